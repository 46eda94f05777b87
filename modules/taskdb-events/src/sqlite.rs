//! Analytical replica: SQLite.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::backend::BackendError;

/// 14 binds per row; older SQLite builds cap a statement at 999 variables.
const SQLITE_ROWS_PER_STATEMENT: usize = 64;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS taskdb_events (
    id             TEXT     PRIMARY KEY,
    ts_ms          INTEGER  NOT NULL,
    kind           TEXT     NOT NULL,
    status         TEXT,
    duration_ms    INTEGER,
    trace_id       TEXT     NOT NULL,
    run_id         TEXT     NOT NULL,
    task_id        TEXT     NOT NULL,
    span_id        TEXT     NOT NULL,
    parent_span_id TEXT,
    component      TEXT     NOT NULL,
    actor          TEXT,
    context        TEXT     NOT NULL,
    payload        TEXT     NOT NULL,
    created_at     DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Replica copy of the TaskEvent log in SQLite.
#[derive(Clone)]
pub struct SqliteEventBackend {
    pool: SqlitePool,
}

impl SqliteEventBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the replica database file.
    pub async fn connect(path: &str, busy_timeout: Duration) -> Result<Self, BackendError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BackendError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(busy_timeout)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database. A single never-recycled connection keeps it alive.
    pub async fn in_memory() -> Result<Self, BackendError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl_sql_event_backend!(SqliteEventBackend, sqlx::Sqlite, "sqlite", SCHEMA, SQLITE_ROWS_PER_STATEMENT);
