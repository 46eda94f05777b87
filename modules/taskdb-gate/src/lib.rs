//! Gate-style entry points over the TaskDB components.
//!
//! Each gate returns a `GateOutcome`: a JSON report for stdout and the process
//! exit status a CI pipeline acts on.

pub mod gates;

pub use gates::{GateExit, GateOutcome};
