pub mod config;
pub mod error;

pub use config::{Backpressure, Config, CorpusConfig, DeltaPolicy, OutboxConfig, PgConfig};
pub use error::{TaskDbError, TaskDbResult};
