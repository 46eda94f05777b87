//! Policy-driven drift classification for pinned chunks.
//!
//! | policy      | live missing      | live differs        | live matches |
//! |-------------|-------------------|---------------------|--------------|
//! | strict      | `missing` (block) | `hash_mismatch` (block) | ok       |
//! | relaxed/ttl | `missing_relaxed` | hash update         | ok           |
//!
//! Validation never mutates pins. It returns a `DriftOutcome` the caller can
//! apply to the registry once the pass has completed.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use taskdb_common::{TaskDbError, TaskDbResult};
use tracing::{info, warn};

use crate::corpus::{CorpusError, CorpusStore};
use crate::pin::{ChunkKey, ChunkPin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftReason {
    Missing,
    HashMismatch,
    MissingRelaxed,
}

impl DriftReason {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::MissingRelaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEntry {
    pub id: String,
    pub reason: DriftReason,
}

/// A relaxed/ttl pin whose hash follows the live corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashUpdate {
    pub id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftOutcome {
    /// Pins compared against the corpus.
    pub checked: usize,
    /// Pins beyond the batch cap, not looked at this pass.
    pub skipped: usize,
    pub entries: Vec<DriftEntry>,
    pub updates: Vec<HashUpdate>,
}

impl DriftOutcome {
    pub fn blocking(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries.iter().filter(|e| e.reason.is_blocking())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries.iter().filter(|e| !e.reason.is_blocking())
    }

    pub fn has_blocking(&self) -> bool {
        self.blocking().next().is_some()
    }

    /// Relaxed/ttl pins that would be corrected.
    pub fn changed(&self) -> usize {
        self.updates.len()
    }

    /// `Err(Drift)` naming every blocking pin, otherwise the outcome itself.
    pub fn into_result(self) -> TaskDbResult<Self> {
        if self.has_blocking() {
            return Err(TaskDbError::Drift {
                ids: self.blocking().map(|e| e.id.clone()).collect(),
            });
        }
        Ok(self)
    }
}

pub struct DriftValidator {
    timeout: Duration,
}

impl DriftValidator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Compare at most `max_batch` pins against the corpus in one lookup.
    ///
    /// A lookup that times out or cannot reach the corpus aborts the pass with
    /// `Timeout` or `Connectivity`. It is never read as "everything missing".
    pub async fn validate(
        &self,
        pins: &[ChunkPin],
        corpus: &dyn CorpusStore,
        max_batch: usize,
    ) -> TaskDbResult<DriftOutcome> {
        if max_batch == 0 {
            return Err(TaskDbError::Validation("max_batch must be at least 1".into()));
        }
        let batch = &pins[..pins.len().min(max_batch)];
        let skipped = pins.len() - batch.len();
        if skipped > 0 {
            warn!(skipped, max_batch, "Pin count exceeds batch cap, remainder not validated");
        }

        let keys: Vec<ChunkKey> = batch
            .iter()
            .map(ChunkPin::key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let live = match tokio::time::timeout(self.timeout, corpus.lookup(&keys)).await {
            Err(_) => return Err(self.timed_out(corpus)),
            Ok(Err(CorpusError::StatementTimeout(_))) => return Err(self.timed_out(corpus)),
            Ok(Err(CorpusError::Unavailable(reason))) => {
                return Err(TaskDbError::Connectivity {
                    backend: corpus.name().to_string(),
                    reason,
                })
            }
            Ok(Err(CorpusError::Rejected(reason))) => {
                return Err(TaskDbError::Query {
                    backend: corpus.name().to_string(),
                    reason,
                })
            }
            Ok(Ok(live)) => live,
        };

        let mut outcome = DriftOutcome {
            checked: batch.len(),
            skipped,
            ..Default::default()
        };

        for pin in batch {
            let current = live.get(&pin.key());
            let reason = match (pin.policy.is_strict(), current) {
                (true, None) => Some(DriftReason::Missing),
                (true, Some(hash)) if *hash != pin.hash => Some(DriftReason::HashMismatch),
                (false, None) => Some(DriftReason::MissingRelaxed),
                (false, Some(hash)) if *hash != pin.hash => {
                    outcome.updates.push(HashUpdate {
                        id: pin.id.clone(),
                        from: pin.hash.clone(),
                        to: hash.clone(),
                    });
                    None
                }
                _ => None,
            };
            if let Some(reason) = reason {
                outcome.entries.push(DriftEntry {
                    id: pin.id.clone(),
                    reason,
                });
            }
        }

        let blocking = outcome.blocking().count();
        if blocking > 0 {
            warn!(
                blocking,
                warnings = outcome.entries.len() - blocking,
                checked = outcome.checked,
                "Blocking context drift"
            );
        } else {
            info!(
                checked = outcome.checked,
                warnings = outcome.entries.len(),
                changed = outcome.changed(),
                "Context validated against live corpus"
            );
        }
        Ok(outcome)
    }

    fn timed_out(&self, corpus: &dyn CorpusStore) -> TaskDbError {
        TaskDbError::Timeout {
            backend: corpus.name().to_string(),
            operation: "lookup".into(),
            after: self.timeout,
        }
    }
}
