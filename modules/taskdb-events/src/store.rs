//! EventStore: append-only TaskEvent log, dual-written to a canonical backend
//! and an optional analytical replica.
//!
//! There is no cross-backend transaction. Each backend commits on its own, so
//! one acknowledging tells you nothing about the other. Divergence is detected
//! by the delta check and repaired with `backfill_replica`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use taskdb_common::{TaskDbError, TaskDbResult};
use tracing::{debug, info, warn};

use crate::backend::{bounded, EventBackend, Operation};
use crate::types::{EventQuery, TaskEvent, TimeWindow};

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// Per-backend outcome of one insert call.
#[derive(Debug, Default)]
pub struct InsertReceipt {
    /// Backends that durably accepted the write.
    pub acknowledged: Vec<String>,
    /// Backends that did not. Each entry is a `Write`, `Connectivity` or `Timeout` error.
    pub rejected: Vec<TaskDbError>,
}

impl InsertReceipt {
    /// Every configured backend acknowledged.
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub window: TimeWindow,
    pub canonical_events: usize,
    pub already_replicated: usize,
    pub copied: usize,
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventStore {
    canonical: Arc<dyn EventBackend>,
    replica: Option<Arc<dyn EventBackend>>,
    timeout: Duration,
}

impl EventStore {
    pub fn new(canonical: Arc<dyn EventBackend>, timeout: Duration) -> Self {
        Self {
            canonical,
            replica: None,
            timeout,
        }
    }

    pub fn with_replica(mut self, replica: Arc<dyn EventBackend>) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn canonical(&self) -> &Arc<dyn EventBackend> {
        &self.canonical
    }

    pub fn replica(&self) -> Option<&Arc<dyn EventBackend>> {
        self.replica.as_ref()
    }

    /// Deadline applied to every individual backend call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn ensure_schema(&self) -> TaskDbResult<()> {
        bounded(
            self.canonical.name(),
            Operation::Schema,
            self.timeout,
            self.canonical.ensure_schema(),
        )
        .await?;
        if let Some(replica) = &self.replica {
            bounded(
                replica.name(),
                Operation::Schema,
                self.timeout,
                replica.ensure_schema(),
            )
            .await?;
        }
        Ok(())
    }

    /// Append one event to every configured backend.
    pub async fn insert(&self, event: &TaskEvent) -> TaskDbResult<InsertReceipt> {
        self.insert_batch(std::slice::from_ref(event)).await
    }

    /// Append a batch to every configured backend, concurrently.
    ///
    /// Returns `Ok` as long as at least one backend acknowledged; rejections are
    /// listed on the receipt and logged as drift sources. Fails only when the
    /// batch is invalid or no backend took it.
    pub async fn insert_batch(&self, events: &[TaskEvent]) -> TaskDbResult<InsertReceipt> {
        for event in events {
            event.validate()?;
        }
        if events.is_empty() {
            return Ok(InsertReceipt::default());
        }

        let canonical = bounded(
            self.canonical.name(),
            Operation::Insert,
            self.timeout,
            self.canonical.insert_batch(events),
        );

        let outcomes = match &self.replica {
            Some(replica) => {
                let replica_write = bounded(
                    replica.name(),
                    Operation::Insert,
                    self.timeout,
                    replica.insert_batch(events),
                );
                let (c, r) = tokio::join!(canonical, replica_write);
                vec![(self.canonical.name(), c), (replica.name(), r)]
            }
            None => vec![(self.canonical.name(), canonical.await)],
        };

        let mut receipt = InsertReceipt::default();
        for (backend, outcome) in outcomes {
            match outcome {
                Ok(()) => receipt.acknowledged.push(backend.to_string()),
                Err(e) => {
                    warn!(
                        backend,
                        events = events.len(),
                        error = %e,
                        "Backend did not take write; backends will drift until backfilled"
                    );
                    receipt.rejected.push(e);
                }
            }
        }

        if receipt.acknowledged.is_empty() {
            return Err(receipt
                .rejected
                .into_iter()
                .next()
                .unwrap_or_else(|| TaskDbError::Validation("no backend configured".into())));
        }

        debug!(
            events = events.len(),
            acknowledged = ?receipt.acknowledged,
            "Inserted events"
        );
        Ok(receipt)
    }

    /// Events matching `query`, newest first.
    ///
    /// Reads the canonical backend. If it is unreachable and a replica is
    /// configured, the replica answers instead (and a warning is logged).
    pub async fn query(&self, query: &EventQuery) -> TaskDbResult<Vec<TaskEvent>> {
        let primary = bounded(
            self.canonical.name(),
            Operation::Query,
            self.timeout,
            self.canonical.query(query),
        )
        .await;

        match (primary, &self.replica) {
            (Err(e), Some(replica)) if e.is_unavailable() => {
                warn!(error = %e, replica = replica.name(), "Canonical unavailable, querying replica");
                bounded(
                    replica.name(),
                    Operation::Query,
                    self.timeout,
                    replica.query(query),
                )
                .await
            }
            (result, _) => result,
        }
    }

    /// Every canonical event in `window`, unordered. No replica fallback:
    /// historical state is only ever derived from the source of truth.
    pub async fn read_window(&self, window: &TimeWindow) -> TaskDbResult<Vec<TaskEvent>> {
        bounded(
            self.canonical.name(),
            Operation::Read,
            self.timeout,
            self.canonical.read_window(window),
        )
        .await
    }

    /// Copy canonical events the replica is missing (matched by id) into the replica.
    pub async fn backfill_replica(&self, window: &TimeWindow) -> TaskDbResult<BackfillReport> {
        let Some(replica) = &self.replica else {
            return Err(TaskDbError::Config("no replica configured".into()));
        };

        let (canonical_events, replica_ids) = tokio::join!(
            bounded(
                self.canonical.name(),
                Operation::Read,
                self.timeout,
                self.canonical.read_window(window),
            ),
            bounded(
                replica.name(),
                Operation::Read,
                self.timeout,
                replica.ids_in(window),
            ),
        );
        let canonical_events = canonical_events?;
        let replica_ids: HashSet<_> = replica_ids?.into_iter().collect();

        let mut missing: Vec<TaskEvent> = canonical_events
            .iter()
            .filter(|e| !replica_ids.contains(&e.id))
            .cloned()
            .collect();
        missing.sort_by(|a, b| (a.ts, a.id).cmp(&(b.ts, b.id)));

        if !missing.is_empty() {
            bounded(
                replica.name(),
                Operation::Insert,
                self.timeout,
                replica.insert_batch(&missing),
            )
            .await?;
        }

        let report = BackfillReport {
            window: *window,
            canonical_events: canonical_events.len(),
            already_replicated: canonical_events.len() - missing.len(),
            copied: missing.len(),
        };
        info!(
            copied = report.copied,
            canonical = report.canonical_events,
            replica = replica.name(),
            "Replica backfill complete"
        );
        Ok(report)
    }
}
