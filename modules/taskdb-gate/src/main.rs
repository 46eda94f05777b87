use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::error;
use tracing_subscriber::EnvFilter;

use taskdb_common::Config;
use taskdb_events::{EventStore, Outbox, PgEventBackend, SqliteEventBackend, TimeWindow};
use taskdb_gate::gates::{self, GateOutcome};
use taskdb_pins::{DriftValidator, PgCorpus, PinRegistry};
use taskdb_verify::{DeltaChecker, ProvenanceLimits, ProvenanceVerifier, StateReconstructor};

#[derive(Parser)]
#[command(name = "taskdb-gate", about = "TaskDB consistency and provenance gates")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare event counts between canonical and replica
    DeltaCheck {
        /// Only count events from the last N minutes
        #[arg(long)]
        window_minutes: Option<i64>,
    },
    /// Check pinned chunks against the live corpus without changing the lock
    ContextValidate {
        #[arg(long)]
        lock: Option<PathBuf>,
        #[arg(long)]
        max_pins: Option<usize>,
    },
    /// Apply relaxed/ttl hash corrections to the lock and flag strict drift
    LockUpdate {
        #[arg(long)]
        lock: Option<PathBuf>,
        #[arg(long)]
        max_pins: Option<usize>,
    },
    /// Verify a report's provenance against historical state
    VerifyProvenance {
        /// Report JSON file
        #[arg(long)]
        report: PathBuf,
        /// Override the report's declared snapshot (RFC 3339)
        #[arg(long)]
        snapshot: Option<DateTime<Utc>>,
    },
    /// Copy canonical events missing from the replica
    BackfillReplica {
        #[arg(long)]
        window_minutes: Option<i64>,
    },
    /// Create event tables and indexes on both backends
    InitSchema,
    /// Append newline-delimited TaskEvent JSON through the outbox
    Ingest {
        /// Input file; stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

impl Command {
    fn gate(&self) -> &'static str {
        match self {
            Self::DeltaCheck { .. } => "delta-check",
            Self::ContextValidate { .. } => "context-validate",
            Self::LockUpdate { .. } => "lock-update",
            Self::VerifyProvenance { .. } => "verify-provenance",
            Self::BackfillReplica { .. } => "backfill-replica",
            Self::InitSchema => "init-schema",
            Self::Ingest { .. } => "ingest",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing() {
        eprintln!("failed to initialise logging: {e}");
    }

    let gate = cli.command.gate();
    let outcome = match run(cli.command).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(gate, error = %format!("{e:#}"), "Gate failed");
            GateOutcome::failed(gate, &e)
        }
    };

    match serde_json::to_string_pretty(&outcome) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "Could not serialize gate report"),
    }
    outcome.exit_code()
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("taskdb=info".parse()?))
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

async fn run(command: Command) -> Result<GateOutcome> {
    let config = Config::from_env()?;
    config.log_redacted();

    let outcome = match command {
        Command::DeltaCheck { window_minutes } => {
            let store = event_store(&config).await?;
            let checker = DeltaChecker::for_store(&store, config.delta_policy)?;
            gates::delta_check(&checker, window(window_minutes.or(config.delta_window_minutes)))
                .await?
        }
        Command::ContextValidate { lock, max_pins } => {
            let registry = PinRegistry::load(lock.unwrap_or_else(|| config.lock_path.clone()))?;
            let corpus = PgCorpus::connect_lazy(&config.corpus, config.statement_timeout);
            let validator = DriftValidator::new(config.statement_timeout);
            gates::context_validate(
                &registry,
                &corpus,
                &validator,
                max_pins.unwrap_or(config.max_pins),
            )
            .await?
        }
        Command::LockUpdate { lock, max_pins } => {
            let mut registry =
                PinRegistry::load(lock.unwrap_or_else(|| config.lock_path.clone()))?;
            let corpus = PgCorpus::connect_lazy(&config.corpus, config.statement_timeout);
            let validator = DriftValidator::new(config.statement_timeout);
            gates::lock_update(
                &mut registry,
                &corpus,
                &validator,
                max_pins.unwrap_or(config.max_pins),
            )
            .await?
        }
        Command::VerifyProvenance { report, snapshot } => {
            let report = gates::load_report(&report)?;
            let store = event_store(&config).await?;
            let verifier = ProvenanceVerifier::new(
                StateReconstructor::new(store),
                ProvenanceLimits::default().with_validity_days(config.snapshot_validity_days),
            );
            gates::verify_provenance(&verifier, &report, snapshot).await?
        }
        Command::BackfillReplica { window_minutes } => {
            let store = event_store(&config).await?;
            gates::backfill_replica(&store, window(window_minutes)).await?
        }
        Command::InitSchema => {
            let store = event_store(&config).await?;
            gates::init_schema(&store).await?
        }
        Command::Ingest { file } => {
            let store = event_store(&config).await?;
            let outbox = Outbox::new(store, config.outbox.clone());
            match file {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?;
                    gates::ingest(&outbox, BufReader::new(file)).await?
                }
                None => gates::ingest(&outbox, BufReader::new(tokio::io::stdin())).await?,
            }
        }
    };
    Ok(outcome)
}

/// Postgres canonical plus SQLite replica.
async fn event_store(config: &Config) -> Result<EventStore> {
    let canonical = PgEventBackend::connect_lazy(&config.canonical, config.statement_timeout);
    let replica = SqliteEventBackend::connect(&config.replica_path, config.statement_timeout)
        .await
        .with_context(|| format!("opening replica at {}", config.replica_path))?;

    Ok(EventStore::new(Arc::new(canonical), config.statement_timeout)
        .with_replica(Arc::new(replica)))
}

fn window(minutes: Option<i64>) -> TimeWindow {
    match minutes {
        Some(m) => TimeWindow::last(chrono::Duration::minutes(m)),
        None => TimeWindow::all(),
    }
}
