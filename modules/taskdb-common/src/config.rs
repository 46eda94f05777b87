use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Connection parameters for one Postgres endpoint.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Live corpus read replica. Same shape as the canonical backend, separate credentials.
pub type CorpusConfig = PgConfig;

/// Acceptable replication drift: `|delta| <= max(min_abs, max_pct * replica)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaPolicy {
    pub min_abs: f64,
    pub max_pct: f64,
}

impl Default for DeltaPolicy {
    fn default() -> Self {
        Self {
            min_abs: 50.0,
            max_pct: 0.02,
        }
    }
}

/// What the outbox does when it is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Producer waits until a flush frees space.
    #[default]
    Block,
    /// Oldest queued event is discarded and counted.
    DropOldest,
    /// Push fails with `QueueFull`.
    Reject,
}

impl FromStr for Backpressure {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "block" => Ok(Self::Block),
            "drop_oldest" => Ok(Self::DropOldest),
            "reject" => Ok(Self::Reject),
            other => Err(anyhow!(
                "unknown backpressure policy '{other}' (expected block, drop_oldest or reject)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub capacity: usize,
    pub flush_size: usize,
    pub flush_interval: Duration,
    pub backpressure: Backpressure,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            flush_size: 100,
            flush_interval: Duration::from_millis(250),
            backpressure: Backpressure::Block,
        }
    }
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Canonical transactional store
    pub canonical: PgConfig,

    // Analytical replica
    pub replica_path: String,

    // Live corpus (pin validation)
    pub corpus: CorpusConfig,

    // Bounds
    pub statement_timeout: Duration,
    pub max_pins: usize,

    // Drift policies
    pub delta_window_minutes: Option<i64>,
    pub delta_policy: DeltaPolicy,
    pub snapshot_validity_days: i64,

    // Artifacts
    pub lock_path: PathBuf,

    pub outbox: OutboxConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let outbox_defaults = OutboxConfig::default();
        let delta_defaults = DeltaPolicy::default();

        let config = Self {
            canonical: PgConfig {
                host: env_or("TASKDB_PG_HOST", "localhost".to_string())?,
                port: env_or("TASKDB_PG_PORT", 5432)?,
                user: env_or("TASKDB_PG_USER", "taskdb".to_string())?,
                password: required("TASKDB_PG_PASSWORD")?,
                database: env_or("TASKDB_PG_DB", "taskdb".to_string())?,
            },
            replica_path: env_or("TASKDB_SQLITE_PATH", "./data/taskdb.sqlite".to_string())?,
            corpus: PgConfig {
                host: env_or("PGREAD_HOST", "localhost".to_string())?,
                port: env_or("PGREAD_PORT", 5433)?,
                user: env_or("PGREAD_USER", "rag_read".to_string())?,
                password: required("PGREAD_PASSWORD")?,
                database: env_or("PGREAD_DB", "ragdb".to_string())?,
            },
            statement_timeout: Duration::from_millis(env_or("TASKDB_STATEMENT_TIMEOUT_MS", 15_000)?),
            max_pins: env_or("MAX_PINS", 200)?,
            delta_window_minutes: env_opt("DELTA_WINDOW_MINUTES")?,
            delta_policy: DeltaPolicy {
                min_abs: env_or("DELTA_MIN_ABS", delta_defaults.min_abs)?,
                max_pct: env_or("DELTA_MAX_PCT", delta_defaults.max_pct)?,
            },
            snapshot_validity_days: env_or("SNAPSHOT_VALIDITY_DAYS", 7)?,
            lock_path: PathBuf::from(env_or(
                "PRP_LOCK_PATH",
                "prp/PRP.lock.yml".to_string(),
            )?),
            outbox: OutboxConfig {
                capacity: env_or("OUTBOX_CAPACITY", outbox_defaults.capacity)?,
                flush_size: env_or("OUTBOX_FLUSH_SIZE", outbox_defaults.flush_size)?,
                flush_interval: Duration::from_millis(env_or("OUTBOX_FLUSH_MS", 250)?),
                backpressure: env_or("OUTBOX_BACKPRESSURE", Backpressure::Block)?,
            },
        };

        if config.max_pins == 0 {
            return Err(anyhow!("MAX_PINS must be at least 1"));
        }
        if config.outbox.flush_size == 0 || config.outbox.capacity < config.outbox.flush_size {
            return Err(anyhow!(
                "OUTBOX_FLUSH_SIZE must be between 1 and OUTBOX_CAPACITY"
            ));
        }

        Ok(config)
    }

    /// Log the effective configuration with credentials masked.
    pub fn log_redacted(&self) {
        fn preview(val: &str) -> String {
            format!("***({} chars)", val.len())
        }

        tracing::info!("Config loaded:");
        tracing::info!(
            "  canonical: {}@{}:{}/{} password={}",
            self.canonical.user,
            self.canonical.host,
            self.canonical.port,
            self.canonical.database,
            preview(&self.canonical.password)
        );
        tracing::info!("  replica: {}", self.replica_path);
        tracing::info!(
            "  corpus: {}@{}:{}/{} password={}",
            self.corpus.user,
            self.corpus.host,
            self.corpus.port,
            self.corpus.database,
            preview(&self.corpus.password)
        );
        tracing::info!(
            "  statement_timeout={}ms max_pins={} lock={}",
            self.statement_timeout.as_millis(),
            self.max_pins,
            self.lock_path.display()
        );
    }
}

fn required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(anyhow!("{key} must be set")),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{key} has an invalid value: '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{key} has an invalid value: '{raw}'")),
        _ => Ok(None),
    }
}
