//! Canonical backend: Postgres.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use taskdb_common::PgConfig;

/// 14 binds per row; stays well under the 65535 bind limit.
const PG_ROWS_PER_STATEMENT: usize = 1000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS taskdb_events (
    id             TEXT         PRIMARY KEY,
    ts_ms          BIGINT       NOT NULL,
    kind           TEXT         NOT NULL,
    status         TEXT,
    duration_ms    BIGINT,
    trace_id       TEXT         NOT NULL,
    run_id         TEXT         NOT NULL,
    task_id        TEXT         NOT NULL,
    span_id        TEXT         NOT NULL,
    parent_span_id TEXT,
    component      TEXT         NOT NULL,
    actor          TEXT,
    context        TEXT         NOT NULL,
    payload        TEXT         NOT NULL,
    created_at     TIMESTAMPTZ  NOT NULL DEFAULT now()
);
"#;

/// Append-only TaskEvent table in Postgres. The source of truth.
#[derive(Clone)]
pub struct PgEventBackend {
    pool: PgPool,
}

impl PgEventBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazily connected pool. Connection problems surface on first use as
    /// `Unavailable`, not at construction.
    pub fn connect_lazy(config: &PgConfig, statement_timeout: Duration) -> Self {
        let timeout_ms = statement_timeout.as_millis().to_string();
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .options([("statement_timeout", timeout_ms.as_str())]);

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(statement_timeout)
            .idle_timeout(Duration::from_secs(30))
            .connect_lazy_with(options);

        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl_sql_event_backend!(PgEventBackend, sqlx::Postgres, "postgres", SCHEMA, PG_ROWS_PER_STATEMENT);
