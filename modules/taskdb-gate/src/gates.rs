use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use taskdb_common::{TaskDbError, TaskDbResult};
use taskdb_events::{EventStore, Outbox, TaskEvent, TimeWindow};
use taskdb_pins::{CorpusStore, DriftValidator, PinRegistry};
use taskdb_verify::{DeltaChecker, ProvenanceReport, ProvenanceVerifier};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

/// Process exit status of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateExit {
    /// 0: nothing blocks.
    Pass,
    /// 1: unexpected, connectivity or timeout failure.
    Error,
    /// 2: hard drift, delta over threshold or failed verdict.
    Blocked,
    /// 3: strict pins need a human.
    Review,
}

impl GateExit {
    pub fn code(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Error => 1,
            Self::Blocked => 2,
            Self::Review => 3,
        }
    }
}

impl From<GateExit> for ExitCode {
    fn from(exit: GateExit) -> Self {
        ExitCode::from(exit.code())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub gate: &'static str,
    pub status: GateExit,
    pub report: serde_json::Value,
}

impl GateOutcome {
    fn new(gate: &'static str, status: GateExit, report: impl Serialize) -> TaskDbResult<Self> {
        let report = serde_json::to_value(report).context("serializing gate report")?;
        Ok(Self {
            gate,
            status,
            report,
        })
    }

    /// Report for a gate that could not run to completion.
    pub fn failed(gate: &'static str, err: &anyhow::Error) -> Self {
        let kind = match err.downcast_ref::<TaskDbError>() {
            Some(TaskDbError::Connectivity { .. }) => "connectivity",
            Some(TaskDbError::Timeout { .. }) => "timeout",
            Some(TaskDbError::Validation(_)) => "validation",
            Some(TaskDbError::Config(_)) => "config",
            Some(TaskDbError::Query { .. }) => "query",
            _ => "unexpected",
        };
        Self {
            gate,
            status: GateExit::Error,
            report: json!({ "error": format!("{err:#}"), "kind": kind }),
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        self.status.into()
    }
}

pub async fn delta_check(checker: &DeltaChecker, window: TimeWindow) -> TaskDbResult<GateOutcome> {
    let report = checker.check_delta(&window).await?;
    let status = if report.within_threshold {
        GateExit::Pass
    } else {
        GateExit::Blocked
    };
    GateOutcome::new("delta-check", status, &report)
}

/// Read-only drift check of the lock artifact against the live corpus.
pub async fn context_validate(
    registry: &PinRegistry,
    corpus: &dyn CorpusStore,
    validator: &DriftValidator,
    max_pins: usize,
) -> TaskDbResult<GateOutcome> {
    let outcome = validator.validate(registry.pins(), corpus, max_pins).await?;
    for entry in outcome.warnings() {
        warn!(pin = %entry.id, "Relaxed pin has no live chunk");
    }

    let status = if outcome.has_blocking() {
        GateExit::Blocked
    } else {
        GateExit::Pass
    };
    let blocking: Vec<_> = outcome.blocking().collect();
    let warnings: Vec<_> = outcome.warnings().collect();
    GateOutcome::new(
        "context-validate",
        status,
        json!({
            "lock": registry.path().display().to_string(),
            "checked": outcome.checked,
            "skipped": outcome.skipped,
            "drift": blocking,
            "warnings": warnings,
            "pending_updates": outcome.updates,
        }),
    )
}

/// Validate, apply relaxed/ttl corrections and save the lock artifact.
pub async fn lock_update(
    registry: &mut PinRegistry,
    corpus: &dyn CorpusStore,
    validator: &DriftValidator,
    max_pins: usize,
) -> TaskDbResult<GateOutcome> {
    let outcome = validator.validate(registry.pins(), corpus, max_pins).await?;
    let changed = registry.apply(&outcome);
    registry.save()?;

    let review: Vec<_> = outcome.blocking().collect();
    info!(changed, strict_review = review.len(), "Lock artifact updated");
    if !review.is_empty() {
        warn!(pins = review.len(), "Strict pins drifted, human review required");
    }

    let status = if review.is_empty() {
        GateExit::Pass
    } else {
        GateExit::Review
    };
    let warnings: Vec<_> = outcome.warnings().collect();
    GateOutcome::new(
        "lock-update",
        status,
        json!({
            "lock": registry.path().display().to_string(),
            "revision": registry.revision(),
            "changed": changed,
            "strict_review": review,
            "warnings": warnings,
            "skipped": outcome.skipped,
        }),
    )
}

pub fn load_report(path: &Path) -> TaskDbResult<ProvenanceReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading report {}", path.display()))?;
    let report = serde_json::from_str(&text)
        .with_context(|| format!("parsing report {}", path.display()))?;
    Ok(report)
}

/// Verify at `snapshot`, or at the snapshot the report itself declares.
pub async fn verify_provenance(
    verifier: &ProvenanceVerifier,
    report: &ProvenanceReport,
    snapshot: Option<DateTime<Utc>>,
) -> TaskDbResult<GateOutcome> {
    let snapshot = snapshot.unwrap_or(report.report_provenance.verification_snapshot_ts);
    let verdict = verifier.verify(report, snapshot).await?;
    let status = if verdict.passed() {
        GateExit::Pass
    } else {
        GateExit::Blocked
    };
    GateOutcome::new("verify-provenance", status, &verdict)
}

pub async fn backfill_replica(store: &EventStore, window: TimeWindow) -> TaskDbResult<GateOutcome> {
    let report = store.backfill_replica(&window).await?;
    GateOutcome::new("backfill-replica", GateExit::Pass, &report)
}

pub async fn init_schema(store: &EventStore) -> TaskDbResult<GateOutcome> {
    store.ensure_schema().await?;
    GateOutcome::new(
        "init-schema",
        GateExit::Pass,
        json!({
            "canonical": store.canonical().name(),
            "replica": store.replica().map(|r| r.name()),
        }),
    )
}

/// Push newline-delimited TaskEvent JSON through the outbox, then drain it.
///
/// A malformed line aborts before anything further is queued; events already
/// queued are still flushed.
pub async fn ingest<R>(outbox: &Outbox, reader: R) -> TaskDbResult<GateOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let flusher = outbox.spawn_flusher();
    let pushed = push_lines(outbox, reader).await;

    outbox.close();
    if let Err(e) = flusher.await {
        error!(error = %e, "Outbox flusher task failed");
    }
    let pushed = pushed?;

    let stats = outbox.stats().await;
    let status = if stats.depth == 0 {
        GateExit::Pass
    } else {
        GateExit::Error
    };
    GateOutcome::new(
        "ingest",
        status,
        json!({ "pushed": pushed, "outbox": stats }),
    )
}

async fn push_lines<R>(outbox: &Outbox, reader: R) -> TaskDbResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0;
    let mut pushed = 0;
    while let Some(line) = lines.next_line().await.context("reading events")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: TaskEvent = serde_json::from_str(&line).map_err(|e| {
            TaskDbError::Validation(format!("line {line_no}: not a TaskEvent: {e}"))
        })?;
        outbox.push(event).await?;
        pushed += 1;
    }
    Ok(pushed)
}
