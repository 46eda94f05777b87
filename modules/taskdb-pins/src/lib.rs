//! Content-hash pins over the live document corpus.
//!
//! `PinRegistry` owns the lock artifact. `DriftValidator` compares its pins
//! against a `CorpusStore` and classifies each one by policy. Relaxed and ttl
//! corrections are applied back to the registry only from a completed pass.

pub mod corpus;
pub mod pin;
pub mod registry;
pub mod validator;

pub use corpus::{CorpusError, CorpusStore, MemoryCorpus, PgCorpus};
pub use pin::{ChunkKey, ChunkPin, PinPolicy};
pub use registry::PinRegistry;
pub use validator::{DriftEntry, DriftOutcome, DriftReason, DriftValidator, HashUpdate};
