use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinPolicy {
    /// Drift blocks. Never corrected automatically.
    Strict,
    /// Drift is corrected to the live hash; a missing chunk is a warning.
    Relaxed,
    /// Same handling as `Relaxed`. No expiry is applied.
    Ttl,
}

impl PinPolicy {
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// Where a chunk lives in the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub uri: String,
    pub idx: i32,
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uri, self.idx)
    }
}

/// One pinned chunk in the lock artifact.
///
/// Fields this crate does not know about are kept in `extra` and written
/// back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPin {
    pub id: String,
    pub uri: String,
    pub idx: i32,
    pub hash: String,
    pub policy: PinPolicy,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ChunkPin {
    pub fn new(
        id: impl Into<String>,
        uri: impl Into<String>,
        idx: i32,
        hash: impl Into<String>,
        policy: PinPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            idx,
            hash: hash.into(),
            policy,
            extra: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            uri: self.uri.clone(),
            idx: self.idx,
        }
    }
}
