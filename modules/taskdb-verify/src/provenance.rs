//! Report provenance verification.
//!
//! A report declares which tasks, runs and artifacts it rests on and which
//! claims it makes about them. Every reference and claim is checked against
//! state reconstructed at the verification snapshot, never against the
//! current log, so an event recorded after the snapshot cannot vouch for it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use taskdb_common::TaskDbResult;
use tracing::{info, warn};

use crate::reconstruct::{ReconstructedState, StateReconstructor};

// ---------------------------------------------------------------------------
// Report shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceReport {
    pub id: String,
    pub report_provenance: Provenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub run_ids: Vec<String>,
    #[serde(default)]
    pub artifact_hashes: Vec<String>,
    pub verification_snapshot_ts: DateTime<Utc>,
    #[serde(default)]
    pub claims_validated: Vec<ClaimEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimEntry {
    #[serde(flatten)]
    pub claim: Claim,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "claim", rename_all = "snake_case")]
pub enum Claim {
    /// Every declared task was completed.
    TasksCompleted,
    /// No gate failed on any declared run.
    GatesPassed,
    /// Every declared artifact hash was recorded (and at least one was declared).
    ArtifactsRecorded,
    TaskCompleted { task_id: String },
    RunFinished { run_id: String },
    GatePassed { run_id: String, gate: String },
}

impl Claim {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TasksCompleted => "tasks_completed",
            Self::GatesPassed => "gates_passed",
            Self::ArtifactsRecorded => "artifacts_recorded",
            Self::TaskCompleted { .. } => "task_completed",
            Self::RunFinished { .. } => "run_finished",
            Self::GatePassed { .. } => "gate_passed",
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub check: String,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub report_id: String,
    pub snapshot_ts: DateTime<Utc>,
    pub status: VerdictStatus,
    pub checks: usize,
    pub mismatches: Vec<Mismatch>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.status == VerdictStatus::Pass
    }
}

/// Collects check outcomes for one verification.
struct Ledger {
    checks: usize,
    mismatches: Vec<Mismatch>,
}

impl Ledger {
    fn new() -> Self {
        Self {
            checks: 0,
            mismatches: Vec::new(),
        }
    }

    fn check(&mut self, ok: bool, check: &str, subject: &str, detail: impl FnOnce() -> String) {
        self.checks += 1;
        if !ok {
            self.mismatches.push(Mismatch {
                check: check.to_string(),
                subject: subject.to_string(),
                detail: detail(),
            });
        }
    }

    fn failed(&self) -> bool {
        !self.mismatches.is_empty()
    }

    fn into_verdict(self, report_id: &str, snapshot_ts: DateTime<Utc>) -> Verdict {
        Verdict {
            report_id: report_id.to_string(),
            snapshot_ts,
            status: if self.mismatches.is_empty() {
                VerdictStatus::Pass
            } else {
                VerdictStatus::Fail
            },
            checks: self.checks,
            mismatches: self.mismatches,
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ProvenanceLimits {
    pub max_claims: usize,
    pub max_task_ids: usize,
    pub max_run_ids: usize,
    pub max_artifact_hashes: usize,
    /// How far in the past a snapshot may lie.
    pub validity_window: Duration,
}

impl Default for ProvenanceLimits {
    fn default() -> Self {
        Self {
            max_claims: 100,
            max_task_ids: 1000,
            max_run_ids: 1000,
            max_artifact_hashes: 500,
            validity_window: Duration::days(7),
        }
    }
}

impl ProvenanceLimits {
    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_window = Duration::days(days);
        self
    }
}

pub struct ProvenanceVerifier {
    reconstructor: StateReconstructor,
    limits: ProvenanceLimits,
}

impl ProvenanceVerifier {
    pub fn new(reconstructor: StateReconstructor, limits: ProvenanceLimits) -> Self {
        Self {
            reconstructor,
            limits,
        }
    }

    pub async fn verify(
        &self,
        report: &ProvenanceReport,
        snapshot_ts: DateTime<Utc>,
    ) -> TaskDbResult<Verdict> {
        self.verify_at(report, snapshot_ts, Utc::now()).await
    }

    /// Verify with an explicit notion of "now" for the snapshot window check.
    ///
    /// A report failing the snapshot or size checks is rejected without
    /// touching the log. Reconstruction errors propagate: an unreadable log
    /// is never a pass.
    pub async fn verify_at(
        &self,
        report: &ProvenanceReport,
        snapshot_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TaskDbResult<Verdict> {
        let mut ledger = Ledger::new();
        self.check_snapshot(&mut ledger, snapshot_ts, now);
        self.check_limits(&mut ledger, &report.report_provenance);
        if ledger.failed() {
            let verdict = ledger.into_verdict(&report.id, snapshot_ts);
            warn!(report = %verdict.report_id, mismatches = verdict.mismatches.len(), "Report rejected before replay");
            return Ok(verdict);
        }

        let state = self.reconstructor.reconstruct(snapshot_ts).await?;
        let verdict = check_against(report, &state, snapshot_ts, ledger);

        if verdict.passed() {
            info!(report = %verdict.report_id, checks = verdict.checks, "Provenance verified");
        } else {
            warn!(
                report = %verdict.report_id,
                mismatches = verdict.mismatches.len(),
                "Provenance verification failed"
            );
        }
        Ok(verdict)
    }

    fn check_snapshot(&self, ledger: &mut Ledger, snapshot_ts: DateTime<Utc>, now: DateTime<Utc>) {
        let subject = snapshot_ts.to_rfc3339();
        ledger.check(snapshot_ts <= now, "snapshot_not_future", &subject, || {
            format!("snapshot is after {}", now.to_rfc3339())
        });
        let oldest = now - self.limits.validity_window;
        ledger.check(snapshot_ts >= oldest, "snapshot_within_window", &subject, || {
            format!(
                "snapshot is older than {} days",
                self.limits.validity_window.num_days()
            )
        });
    }

    fn check_limits(&self, ledger: &mut Ledger, provenance: &Provenance) {
        let limits = [
            ("claims_validated", provenance.claims_validated.len(), self.limits.max_claims),
            ("task_ids", provenance.task_ids.len(), self.limits.max_task_ids),
            ("run_ids", provenance.run_ids.len(), self.limits.max_run_ids),
            (
                "artifact_hashes",
                provenance.artifact_hashes.len(),
                self.limits.max_artifact_hashes,
            ),
        ];
        for (field, len, max) in limits {
            ledger.check(len <= max, "size_limit", field, || {
                format!("{len} entries exceeds limit of {max}")
            });
        }
    }
}

fn check_against(
    report: &ProvenanceReport,
    state: &ReconstructedState,
    snapshot_ts: DateTime<Utc>,
    mut ledger: Ledger,
) -> Verdict {
    let provenance = &report.report_provenance;
    let at = snapshot_ts.to_rfc3339();

    for task in &provenance.task_ids {
        ledger.check(state.has_task(task), "task_exists", task, || {
            format!("no task event at or before {at}")
        });
    }
    for run in &provenance.run_ids {
        ledger.check(state.has_run(run), "run_exists", run, || {
            format!("no run event at or before {at}")
        });
    }
    for hash in &provenance.artifact_hashes {
        ledger.check(state.has_artifact(hash), "artifact_recorded", hash, || {
            format!("artifact not recorded at or before {at}")
        });
    }

    for entry in &provenance.claims_validated {
        let name = entry.claim.name();
        let has_evidence = entry
            .evidence
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        ledger.check(has_evidence, "claim_evidence", name, || {
            "claim has no evidence".to_string()
        });

        match &entry.claim {
            Claim::TasksCompleted => {
                for task in &provenance.task_ids {
                    ledger.check(state.task_completed(task), name, task, || {
                        "task not completed at snapshot".to_string()
                    });
                }
            }
            Claim::GatesPassed => {
                for run in &provenance.run_ids {
                    let failed: Vec<&str> = state
                        .runs
                        .get(run)
                        .map(|r| r.failed_gates().collect())
                        .unwrap_or_default();
                    ledger.check(state.has_run(run) && failed.is_empty(), name, run, || {
                        if failed.is_empty() {
                            "run unknown at snapshot".to_string()
                        } else {
                            format!("failed gates: {}", failed.join(", "))
                        }
                    });
                }
            }
            Claim::ArtifactsRecorded => {
                ledger.check(!provenance.artifact_hashes.is_empty(), name, "artifact_hashes", || {
                    "claim made without declaring any artifact".to_string()
                });
                for hash in &provenance.artifact_hashes {
                    ledger.check(state.has_artifact(hash), name, hash, || {
                        "artifact not recorded at snapshot".to_string()
                    });
                }
            }
            Claim::TaskCompleted { task_id } => {
                ledger.check(state.task_completed(task_id), name, task_id, || {
                    "task not completed at snapshot".to_string()
                });
            }
            Claim::RunFinished { run_id } => {
                let finished = state.runs.get(run_id).is_some_and(|r| r.finished.is_some());
                ledger.check(finished, name, run_id, || {
                    "run not finished at snapshot".to_string()
                });
            }
            Claim::GatePassed { run_id, gate } => {
                let passed = state.runs.get(run_id).is_some_and(|r| r.gate_passed(gate));
                ledger.check(passed, name, &format!("{run_id}/{gate}"), || {
                    "gate not passed at snapshot".to_string()
                });
            }
        }
    }

    ledger.into_verdict(&report.id, snapshot_ts)
}
