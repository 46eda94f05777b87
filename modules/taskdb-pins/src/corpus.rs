//! Live corpus seam: current chunk hashes by `(uri, idx)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use taskdb_common::CorpusConfig;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::pin::ChunkKey;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("statement timeout: {0}")]
    StatementTimeout(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<sqlx::Error> for CorpusError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("57014") => {
                Self::StatementTimeout(err.to_string())
            }
            _ => Self::Rejected(err.to_string()),
        }
    }
}

#[async_trait]
pub trait CorpusStore: Send + Sync {
    fn name(&self) -> &str;

    /// Live hash for each key that has a non-deleted chunk. Keys with no live
    /// chunk are simply absent from the result.
    async fn lookup(&self, keys: &[ChunkKey]) -> Result<HashMap<ChunkKey, String>, CorpusError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Read-only view of the `rag_chunks` table.
#[derive(Clone)]
pub struct PgCorpus {
    pool: PgPool,
}

impl PgCorpus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn connect_lazy(config: &CorpusConfig, statement_timeout: Duration) -> Self {
        let timeout_ms = statement_timeout.as_millis().to_string();
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .options([("statement_timeout", timeout_ms.as_str())]);

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(statement_timeout)
            .connect_lazy_with(options);

        Self { pool }
    }
}

#[async_trait]
impl CorpusStore for PgCorpus {
    fn name(&self) -> &str {
        "corpus"
    }

    async fn lookup(&self, keys: &[ChunkKey]) -> Result<HashMap<ChunkKey, String>, CorpusError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let uris: Vec<String> = keys.iter().map(|k| k.uri.clone()).collect();
        let idxs: Vec<i32> = keys.iter().map(|k| k.idx).collect();

        let rows: Vec<(String, i32, Option<String>)> = sqlx::query_as(
            r#"
            WITH t AS (
                SELECT unnest($1::text[]) AS uri, unnest($2::int[]) AS chunk_idx
            )
            SELECT t.uri, t.chunk_idx, c.hash
            FROM t LEFT JOIN rag_chunks c
              ON c.uri = t.uri AND c.chunk_idx = t.chunk_idx AND c.deleted_at IS NULL
            "#,
        )
        .bind(&uris)
        .bind(&idxs)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(uri, idx, hash)| hash.map(|h| (ChunkKey { uri, idx }, h)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

struct LiveChunk {
    hash: String,
    deleted: bool,
}

/// In-memory corpus for tests. Supports soft deletes and simulated outages.
pub struct MemoryCorpus {
    chunks: Mutex<HashMap<ChunkKey, LiveChunk>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    lookups: AtomicU64,
}

impl Default for MemoryCorpus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCorpus {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    pub async fn put(&self, uri: &str, idx: i32, hash: &str) {
        self.chunks.lock().await.insert(
            ChunkKey {
                uri: uri.to_string(),
                idx,
            },
            LiveChunk {
                hash: hash.to_string(),
                deleted: false,
            },
        );
    }

    pub async fn soft_delete(&self, uri: &str, idx: i32) {
        let key = ChunkKey {
            uri: uri.to_string(),
            idx,
        };
        if let Some(chunk) = self.chunks.lock().await.get_mut(&key) {
            chunk.deleted = true;
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of lookup round trips served.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CorpusStore for MemoryCorpus {
    fn name(&self) -> &str {
        "memory-corpus"
    }

    async fn lookup(&self, keys: &[ChunkKey]) -> Result<HashMap<ChunkKey, String>, CorpusError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CorpusError::Unavailable("memory corpus is offline".into()));
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let chunks = self.chunks.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| {
                chunks
                    .get(key)
                    .filter(|c| !c.deleted)
                    .map(|c| (key.clone(), c.hash.clone()))
            })
            .collect())
    }
}
