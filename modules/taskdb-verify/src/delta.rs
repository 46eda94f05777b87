//! Aggregate-count comparison between the canonical log and its replica.
//!
//! Tolerance is `max(min_abs, max_pct * replica)`. A breach is a monitoring
//! signal, not a failure of this call; the caller decides what to do with it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use taskdb_common::{DeltaPolicy, TaskDbError, TaskDbResult};
use taskdb_events::{bounded, EventBackend, EventStore, Operation, TimeWindow};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaReport {
    pub canonical: i64,
    pub replica: i64,
    /// `canonical - replica`. Negative when the replica is ahead.
    pub delta: i64,
    /// `|delta| / replica`, with an empty replica treated as 1.
    pub delta_pct: f64,
    pub threshold: f64,
    pub within_threshold: bool,
    pub window: TimeWindow,
}

impl DeltaReport {
    pub fn compute(window: TimeWindow, canonical: i64, replica: i64, policy: &DeltaPolicy) -> Self {
        let delta = canonical - replica;
        let abs = delta.unsigned_abs() as f64;
        let base = if replica == 0 { 1.0 } else { replica as f64 };
        let threshold = policy.min_abs.max(replica as f64 * policy.max_pct);

        Self {
            canonical,
            replica,
            delta,
            delta_pct: abs / base,
            threshold,
            within_threshold: abs <= threshold,
            window,
        }
    }
}

pub struct DeltaChecker {
    canonical: Arc<dyn EventBackend>,
    replica: Arc<dyn EventBackend>,
    policy: DeltaPolicy,
    timeout: Duration,
}

impl DeltaChecker {
    pub fn new(
        canonical: Arc<dyn EventBackend>,
        replica: Arc<dyn EventBackend>,
        policy: DeltaPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            canonical,
            replica,
            policy,
            timeout,
        }
    }

    /// Compare the backends of a dual-writing store.
    pub fn for_store(store: &EventStore, policy: DeltaPolicy) -> TaskDbResult<Self> {
        let replica = store
            .replica()
            .cloned()
            .ok_or_else(|| TaskDbError::Config("delta check needs a replica".into()))?;
        Ok(Self::new(
            store.canonical().clone(),
            replica,
            policy,
            store.timeout(),
        ))
    }

    pub fn policy(&self) -> &DeltaPolicy {
        &self.policy
    }

    /// Count both backends over `window` concurrently and compare.
    ///
    /// A backend that cannot be counted is an error, never a zero.
    pub async fn check_delta(&self, window: &TimeWindow) -> TaskDbResult<DeltaReport> {
        let (canonical, replica) = tokio::join!(
            bounded(
                self.canonical.name(),
                Operation::Count,
                self.timeout,
                self.canonical.count(window),
            ),
            bounded(
                self.replica.name(),
                Operation::Count,
                self.timeout,
                self.replica.count(window),
            ),
        );

        let report = DeltaReport::compute(*window, canonical?, replica?, &self.policy);

        if report.within_threshold {
            info!(
                canonical = report.canonical,
                replica = report.replica,
                delta = report.delta,
                threshold = report.threshold,
                "Delta within threshold"
            );
        } else {
            warn!(
                canonical = report.canonical,
                replica = report.replica,
                delta = report.delta,
                pct = %format!("{:.2}%", report.delta_pct * 100.0),
                threshold = report.threshold,
                "Delta exceeds threshold"
            );
        }
        Ok(report)
    }
}
