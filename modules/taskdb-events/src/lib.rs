//! Append-only TaskEvent log, materialized independently in two backends.
//!
//! The canonical backend (Postgres) is the source of truth; the analytical
//! replica (SQLite) receives the same writes with no cross-backend transaction.
//! A partially failed write is expected and shows up later as replication drift.

pub mod backend;
#[macro_use]
mod row;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod sqlite;
pub mod store;
pub mod types;

pub use backend::{bounded, BackendError, EventBackend, Operation};
pub use memory::MemoryBackend;
pub use outbox::{Outbox, OutboxStats};
pub use postgres::PgEventBackend;
pub use sqlite::SqliteEventBackend;
pub use store::{BackfillReport, EventStore, InsertReceipt};
pub use types::{
    CorrelationKey, EventKind, EventQuery, EventStatus, TaskContext, TaskEvent, TimeWindow,
};
