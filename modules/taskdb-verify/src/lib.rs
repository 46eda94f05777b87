//! Cross-store consistency and historical verification over the TaskEvent log.
//!
//! - `DeltaChecker` compares aggregate counts between canonical and replica.
//! - `StateReconstructor` replays the log up to a cutoff into a deterministic state.
//! - `ProvenanceVerifier` checks a report's claims against that historical state.

pub mod delta;
pub mod provenance;
pub mod reconstruct;

pub use delta::{DeltaChecker, DeltaReport};
pub use provenance::{
    Claim, ClaimEntry, Mismatch, Provenance, ProvenanceLimits, ProvenanceReport,
    ProvenanceVerifier, Verdict, VerdictStatus,
};
pub use reconstruct::{
    replay, ReconstructedState, Reducer, RunFacts, StateReconstructor, TaskFacts,
    TaskStateReducer,
};
