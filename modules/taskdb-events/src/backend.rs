//! Backend seam. Implemented by Postgres (canonical), SQLite (replica) and
//! `MemoryBackend` (tests).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskdb_common::{TaskDbError, TaskDbResult};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{EventQuery, TaskEvent, TimeWindow};

/// Raw failure from one backend, before it is attributed and classified.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Could not reach the backend (I/O, TLS, pool exhausted or closed).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Backend-side statement timeout fired.
    #[error("statement timeout: {0}")]
    StatementTimeout(String),

    /// The backend answered and said no.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A stored row could not be decoded into a TaskEvent.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            // 57014 = query_canceled (statement_timeout)
            sqlx::Error::Database(db) if db.code().as_deref() == Some("57014") => {
                Self::StatementTimeout(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => Self::Corrupt(err.to_string()),
            _ => Self::Rejected(err.to_string()),
        }
    }
}

/// What a backend call was doing, for error attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Schema,
    Insert,
    Query,
    Count,
    Read,
}

impl Operation {
    fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Schema)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Schema => "schema",
            Self::Insert => "insert",
            Self::Query => "query",
            Self::Count => "count",
            Self::Read => "read",
        };
        f.write_str(s)
    }
}

/// One materialization of the event log.
///
/// Inserts must be idempotent on `id`: writing an event that already exists is
/// a no-op, so replays and backfills are safe.
#[async_trait]
pub trait EventBackend: Send + Sync {
    /// Stable label used in errors and logs ("postgres", "sqlite", ...).
    fn name(&self) -> &str;

    async fn ensure_schema(&self) -> Result<(), BackendError>;

    async fn insert(&self, event: &TaskEvent) -> Result<(), BackendError> {
        self.insert_batch(std::slice::from_ref(event)).await
    }

    async fn insert_batch(&self, events: &[TaskEvent]) -> Result<(), BackendError>;

    /// Matching events, ordered by `(ts, id)` descending, capped at `query.limit`.
    async fn query(&self, query: &EventQuery) -> Result<Vec<TaskEvent>, BackendError>;

    async fn count(&self, window: &TimeWindow) -> Result<i64, BackendError>;

    /// Every event in the window, in no particular order.
    async fn read_window(&self, window: &TimeWindow) -> Result<Vec<TaskEvent>, BackendError>;

    async fn ids_in(&self, window: &TimeWindow) -> Result<Vec<Uuid>, BackendError>;
}

#[async_trait]
impl<B: EventBackend + ?Sized> EventBackend for Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn ensure_schema(&self) -> Result<(), BackendError> {
        (**self).ensure_schema().await
    }

    async fn insert(&self, event: &TaskEvent) -> Result<(), BackendError> {
        (**self).insert(event).await
    }

    async fn insert_batch(&self, events: &[TaskEvent]) -> Result<(), BackendError> {
        (**self).insert_batch(events).await
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<TaskEvent>, BackendError> {
        (**self).query(query).await
    }

    async fn count(&self, window: &TimeWindow) -> Result<i64, BackendError> {
        (**self).count(window).await
    }

    async fn read_window(&self, window: &TimeWindow) -> Result<Vec<TaskEvent>, BackendError> {
        (**self).read_window(window).await
    }

    async fn ids_in(&self, window: &TimeWindow) -> Result<Vec<Uuid>, BackendError> {
        (**self).ids_in(window).await
    }
}

/// Run one backend call under a deadline and attribute any failure to that backend.
///
/// A deadline miss is a `Timeout`, an unreachable backend a `Connectivity` error;
/// neither is ever turned into an empty result. Nothing is retried here.
pub async fn bounded<T, F>(
    backend: &str,
    operation: Operation,
    limit: Duration,
    fut: F,
) -> TaskDbResult<T>
where
    F: Future<Output = Result<T, BackendError>>,
{
    let timeout = || TaskDbError::Timeout {
        backend: backend.to_string(),
        operation: operation.to_string(),
        after: limit,
    };

    match tokio::time::timeout(limit, fut).await {
        Err(_) => Err(timeout()),
        Ok(Ok(value)) => Ok(value),
        Ok(Err(BackendError::StatementTimeout(_))) => Err(timeout()),
        Ok(Err(BackendError::Unavailable(reason))) => Err(TaskDbError::Connectivity {
            backend: backend.to_string(),
            reason,
        }),
        Ok(Err(BackendError::Corrupt(reason))) => Err(TaskDbError::Validation(format!(
            "{backend} returned a corrupt record: {reason}"
        ))),
        Ok(Err(BackendError::Rejected(reason))) if operation.is_write() => {
            Err(TaskDbError::Write {
                backend: backend.to_string(),
                reason,
            })
        }
        Ok(Err(BackendError::Rejected(reason))) => Err(TaskDbError::Query {
            backend: backend.to_string(),
            reason,
        }),
    }
}
