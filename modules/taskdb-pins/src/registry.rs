//! PinRegistry: the lock artifact (`evidence.chunks_pinned`) on disk.
//!
//! Only the pin list and `evidence.revision` are owned here. Every other key
//! in the document, and every unknown key on a pin, is written back as loaded.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_yaml::{Mapping, Value};
use taskdb_common::{TaskDbError, TaskDbResult};
use tracing::info;

use crate::pin::ChunkPin;
use crate::validator::DriftOutcome;

const EVIDENCE: &str = "evidence";
const CHUNKS_PINNED: &str = "chunks_pinned";
const REVISION: &str = "revision";

#[derive(Debug, Clone)]
pub struct PinRegistry {
    path: PathBuf,
    document: Mapping,
    pins: Vec<ChunkPin>,
    /// Ids of strict pins as of the last load or save.
    strict_ids: BTreeSet<String>,
    changed: bool,
}

impl PinRegistry {
    pub fn load(path: impl AsRef<Path>) -> TaskDbResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading lock artifact {}", path.display()))?;
        Self::parse(path, &text)
    }

    /// Parse a lock document that will be saved back to `path`.
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> TaskDbResult<Self> {
        let document: Mapping = if text.trim().is_empty() {
            Mapping::new()
        } else {
            serde_yaml::from_str(text).context("parsing lock artifact")?
        };

        let pins: Vec<ChunkPin> = match document
            .get(EVIDENCE)
            .and_then(|evidence| evidence.get(CHUNKS_PINNED))
        {
            Some(Value::Null) | None => Vec::new(),
            Some(value) => serde_yaml::from_value(value.clone())
                .context("parsing evidence.chunks_pinned")?,
        };

        let mut seen = BTreeSet::new();
        for pin in &pins {
            if !seen.insert(pin.id.as_str()) {
                return Err(TaskDbError::Validation(format!(
                    "duplicate pin id '{}' in lock artifact",
                    pin.id
                )));
            }
        }

        Ok(Self {
            path: path.into(),
            strict_ids: strict_ids(&pins),
            document,
            pins,
            changed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pins(&self) -> &[ChunkPin] {
        &self.pins
    }

    pub fn get(&self, id: &str) -> Option<&ChunkPin> {
        self.pins.iter().find(|p| p.id == id)
    }

    pub fn revision(&self) -> u64 {
        self.document
            .get(EVIDENCE)
            .and_then(|evidence| evidence.get(REVISION))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Pins were modified since the last load or save.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Add a pin, or replace the pin with the same id.
    pub fn pin(&mut self, pin: ChunkPin) {
        match self.pins.iter_mut().find(|p| p.id == pin.id) {
            Some(existing) => *existing = pin,
            None => self.pins.push(pin),
        }
        self.changed = true;
    }

    pub fn unpin(&mut self, id: &str) -> Option<ChunkPin> {
        let pos = self.pins.iter().position(|p| p.id == id)?;
        self.changed = true;
        Some(self.pins.remove(pos))
    }

    /// Apply relaxed/ttl hash corrections from a completed validation pass.
    ///
    /// Strict pins are never touched. An update whose `from` no longer matches
    /// the pin (edited since validation) is skipped. Returns how many pins changed.
    pub fn apply(&mut self, outcome: &DriftOutcome) -> usize {
        let mut applied = 0;
        for update in &outcome.updates {
            let Some(pin) = self.pins.iter_mut().find(|p| p.id == update.id) else {
                continue;
            };
            if pin.policy.is_strict() || pin.hash != update.from {
                continue;
            }
            pin.hash = update.to.clone();
            applied += 1;
        }
        if applied > 0 {
            self.changed = true;
        }
        applied
    }

    /// Render the document as it would be saved.
    pub fn to_yaml(&self) -> TaskDbResult<String> {
        let document = self.render(self.next_revision())?;
        Ok(serde_yaml::to_string(&document).context("serializing lock artifact")?)
    }

    /// Write the artifact atomically. Bumps `evidence.revision` if pins changed.
    ///
    /// Refuses to write if a strict pin known at load time has disappeared.
    pub fn save(&mut self) -> TaskDbResult<()> {
        let current: BTreeSet<&str> = self.pins.iter().map(|p| p.id.as_str()).collect();
        let dropped: Vec<&str> = self
            .strict_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !current.contains(id))
            .collect();
        if !dropped.is_empty() {
            return Err(TaskDbError::Validation(format!(
                "refusing to save: strict pin(s) removed: {}",
                dropped.join(", ")
            )));
        }

        let revision = self.next_revision();
        let document = self.render(revision)?;
        let yaml = serde_yaml::to_string(&document).context("serializing lock artifact")?;
        write_atomic(&self.path, yaml.as_bytes())?;

        info!(
            path = %self.path.display(),
            revision,
            pins = self.pins.len(),
            changed = self.changed,
            "Lock artifact saved"
        );
        self.document = document;
        self.strict_ids = strict_ids(&self.pins);
        self.changed = false;
        Ok(())
    }

    fn next_revision(&self) -> u64 {
        if self.changed {
            self.revision() + 1
        } else {
            self.revision()
        }
    }

    fn render(&self, revision: u64) -> TaskDbResult<Mapping> {
        let pins = serde_yaml::to_value(&self.pins).context("serializing pins")?;
        let mut document = self.document.clone();

        let slot = document
            .entry(Value::from(EVIDENCE))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if slot.is_null() {
            *slot = Value::Mapping(Mapping::new());
        }
        let evidence = match slot {
            Value::Mapping(evidence) => evidence,
            _ => {
                return Err(TaskDbError::Validation(
                    "lock artifact 'evidence' is not a mapping".into(),
                ))
            }
        };
        evidence.insert(Value::from(REVISION), Value::Number(revision.into()));
        evidence.insert(Value::from(CHUNKS_PINNED), pins);
        Ok(document)
    }
}

fn strict_ids(pins: &[ChunkPin]) -> BTreeSet<String> {
    pins.iter()
        .filter(|p| p.policy.is_strict())
        .map(|p| p.id.clone())
        .collect()
}

/// Write via a temp file in the same directory, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> TaskDbResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(bytes).context("writing lock artifact")?;
    tmp.as_file().sync_all().context("syncing lock artifact")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::PinPolicy;
    use crate::validator::HashUpdate;

    const LOCK: &str = r#"
prp: checkout-flow
owner: platform
evidence:
  revision: 4
  source: rag
  chunks_pinned:
    - id: c1
      uri: doc://a
      idx: 0
      hash: aaa
      policy: strict
      note: reviewed
    - id: c2
      uri: doc://b
      idx: 1
      hash: bbb
      policy: relaxed
"#;

    fn registry() -> PinRegistry {
        PinRegistry::parse("PRP.lock.yml", LOCK).unwrap()
    }

    fn update(id: &str, from: &str, to: &str) -> DriftOutcome {
        DriftOutcome {
            updates: vec![HashUpdate {
                id: id.into(),
                from: from.into(),
                to: to.into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn parses_pins_and_revision() {
        let reg = registry();
        assert_eq!(reg.pins().len(), 2);
        assert_eq!(reg.revision(), 4);
        assert_eq!(reg.get("c1").unwrap().policy, PinPolicy::Strict);
    }

    #[test]
    fn apply_never_touches_strict_pins() {
        let mut reg = registry();
        assert_eq!(reg.apply(&update("c1", "aaa", "zzz")), 0);
        assert_eq!(reg.get("c1").unwrap().hash, "aaa");
        assert!(!reg.is_changed());
    }

    #[test]
    fn apply_skips_stale_updates() {
        let mut reg = registry();
        assert_eq!(reg.apply(&update("c2", "old", "new")), 0);
        assert_eq!(reg.apply(&update("c2", "bbb", "new")), 1);
        assert_eq!(reg.get("c2").unwrap().hash, "new");
    }

    #[test]
    fn rendering_keeps_unknown_keys_and_bumps_revision() {
        let mut reg = registry();
        reg.apply(&update("c2", "bbb", "ddd"));

        let yaml = reg.to_yaml().unwrap();
        let doc: Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["prp"], Value::from("checkout-flow"));
        assert_eq!(doc["evidence"]["source"], Value::from("rag"));
        assert_eq!(doc["evidence"]["revision"].as_u64(), Some(5));
        assert_eq!(doc["evidence"]["chunks_pinned"][0]["note"], Value::from("reviewed"));
        assert_eq!(doc["evidence"]["chunks_pinned"][1]["hash"], Value::from("ddd"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let text = "evidence:\n  chunks_pinned:\n    - {id: x, uri: u, idx: 0, hash: h, policy: strict}\n    - {id: x, uri: u, idx: 1, hash: h, policy: ttl}\n";
        assert!(matches!(
            PinRegistry::parse("lock.yml", text),
            Err(TaskDbError::Validation(_))
        ));
    }

    #[test]
    fn empty_document_has_no_pins() {
        let reg = PinRegistry::parse("lock.yml", "").unwrap();
        assert!(reg.pins().is_empty());
        assert_eq!(reg.revision(), 0);
    }
}
