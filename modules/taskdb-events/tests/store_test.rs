//! EventStore behavior against in-memory and SQLite backends.
//! No external services required.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use taskdb_common::TaskDbError;
use taskdb_events::{
    CorrelationKey, EventBackend, EventKind, EventQuery, EventStatus, EventStore, MemoryBackend,
    SqliteEventBackend, TaskContext, TaskEvent, TimeWindow,
};

fn ctx(run: &str, task: &str) -> TaskContext {
    TaskContext::new("trace-1", run, task, format!("span-{task}"), "planner")
}

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

fn dual() -> (EventStore, Arc<MemoryBackend>, Arc<MemoryBackend>) {
    let canonical = Arc::new(MemoryBackend::new("canonical"));
    let replica = Arc::new(MemoryBackend::new("replica"));
    let store = EventStore::new(canonical.clone(), Duration::from_millis(200))
        .with_replica(replica.clone());
    (store, canonical, replica)
}

// =========================================================================
// Dual write
// =========================================================================

#[tokio::test]
async fn insert_lands_in_both_backends() {
    let (store, canonical, replica) = dual();
    let event = TaskEvent::new(EventKind::RunStart, ctx("run-1", "task-1"), json!({"n": 1}));

    let receipt = store.insert(&event).await.unwrap();

    assert!(receipt.is_complete());
    assert_eq!(receipt.acknowledged, vec!["canonical", "replica"]);
    assert_eq!(canonical.events().await, vec![event.clone()]);
    assert_eq!(replica.events().await, vec![event]);
}

#[tokio::test]
async fn partial_failure_is_reported_not_fatal() {
    let (store, canonical, replica) = dual();
    replica.set_reject_writes(true);

    let event = TaskEvent::new(EventKind::ToolStart, ctx("run-1", "task-1"), json!({}));
    let receipt = store.insert(&event).await.unwrap();

    assert!(!receipt.is_complete());
    assert_eq!(receipt.acknowledged, vec!["canonical"]);
    assert!(matches!(
        &receipt.rejected[0],
        TaskDbError::Write { backend, .. } if backend == "replica"
    ));
    assert_eq!(canonical.len().await, 1);
    assert!(replica.is_empty().await);
}

#[tokio::test]
async fn unreachable_replica_is_connectivity_not_write() {
    let (store, _canonical, replica) = dual();
    replica.set_available(false);

    let event = TaskEvent::new(EventKind::ToolStart, ctx("run-1", "task-1"), json!({}));
    let receipt = store.insert(&event).await.unwrap();

    assert!(matches!(
        &receipt.rejected[0],
        TaskDbError::Connectivity { backend, .. } if backend == "replica"
    ));
}

#[tokio::test]
async fn slow_replica_times_out_without_blocking_canonical() {
    let (store, canonical, replica) = dual();
    replica.set_latency(Duration::from_secs(5));

    let event = TaskEvent::new(EventKind::LlmCall, ctx("run-1", "task-1"), json!({}));
    let receipt = store.insert(&event).await.unwrap();

    assert_eq!(canonical.len().await, 1);
    assert!(matches!(&receipt.rejected[0], TaskDbError::Timeout { .. }));
}

#[tokio::test]
async fn insert_fails_when_no_backend_accepts() {
    let (store, canonical, replica) = dual();
    canonical.set_reject_writes(true);
    replica.set_available(false);

    let event = TaskEvent::new(EventKind::RunStart, ctx("run-1", "task-1"), json!({}));
    let err = store.insert(&event).await.unwrap_err();

    assert!(matches!(err, TaskDbError::Write { backend, .. } if backend == "canonical"));
}

#[tokio::test]
async fn invalid_event_never_reaches_a_backend() {
    let (store, canonical, replica) = dual();
    let event = TaskEvent::new(
        EventKind::RunStart,
        TaskContext::new("trace", "run", "", "span", "planner"),
        json!({}),
    );

    assert!(matches!(
        store.insert(&event).await,
        Err(TaskDbError::Validation(_))
    ));
    assert!(canonical.is_empty().await);
    assert!(replica.is_empty().await);
}

#[tokio::test]
async fn reinserting_same_event_is_idempotent() {
    let (store, canonical, _replica) = dual();
    let event = TaskEvent::new(EventKind::RunStart, ctx("run-1", "task-1"), json!({}));

    store.insert(&event).await.unwrap();
    store.insert(&event).await.unwrap();

    assert_eq!(canonical.len().await, 1);
}

// =========================================================================
// Query
// =========================================================================

#[tokio::test]
async fn query_orders_newest_first_and_filters_kind() {
    let (store, _, _) = dual();
    for (ms, kind) in [
        (1_000, EventKind::RunStart),
        (3_000, EventKind::RunFinish),
        (2_000, EventKind::RunStart),
    ] {
        let e = TaskEvent::new(kind, ctx("run-1", "task-1"), json!({"ms": ms})).with_ts(at(ms));
        store.insert(&e).await.unwrap();
    }

    let starts = store
        .query(&EventQuery::new().kind(EventKind::RunStart))
        .await
        .unwrap();
    let ts: Vec<i64> = starts.iter().map(|e| e.ts_millis()).collect();
    assert_eq!(ts, vec![2_000, 1_000]);

    let all = store.query(&EventQuery::new().limit(2)).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].kind, EventKind::RunFinish);
}

#[tokio::test]
async fn context_filter_does_not_match_prefixes() {
    let (store, _, _) = dual();
    let one = TaskEvent::new(EventKind::ToolStart, ctx("run-1", "task-1"), json!({}));
    let ten = TaskEvent::new(EventKind::ToolStart, ctx("run-1", "task-10"), json!({}));
    store.insert_batch(&[one.clone(), ten]).await.unwrap();

    let hits = store
        .query(&EventQuery::new().correlated(CorrelationKey::TaskId, "task-1"))
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, one.id);
}

#[tokio::test]
async fn query_falls_back_to_replica_when_canonical_is_down() {
    let (store, canonical, _replica) = dual();
    let event = TaskEvent::new(EventKind::RunStart, ctx("run-1", "task-1"), json!({}));
    store.insert(&event).await.unwrap();

    canonical.set_available(false);
    let hits = store.query(&EventQuery::new()).await.unwrap();

    assert_eq!(hits, vec![event]);
}

#[tokio::test]
async fn read_window_has_no_replica_fallback() {
    let (store, canonical, _replica) = dual();
    canonical.set_available(false);

    let err = store.read_window(&TimeWindow::up_to(Utc::now())).await.unwrap_err();
    assert!(matches!(err, TaskDbError::Connectivity { .. }));
}

// =========================================================================
// Backfill
// =========================================================================

#[tokio::test]
async fn backfill_copies_only_missing_events() {
    let (store, _canonical, replica) = dual();
    let first = TaskEvent::new(EventKind::RunStart, ctx("run-1", "task-1"), json!({}));
    store.insert(&first).await.unwrap();

    replica.set_reject_writes(true);
    let second = TaskEvent::new(EventKind::RunFinish, ctx("run-1", "task-1"), json!({}));
    let third = TaskEvent::new(EventKind::GatePass, ctx("run-1", "task-1"), json!({}));
    store.insert_batch(&[second, third]).await.unwrap();
    replica.set_reject_writes(false);

    let report = store.backfill_replica(&TimeWindow::all()).await.unwrap();

    assert_eq!(report.canonical_events, 3);
    assert_eq!(report.already_replicated, 1);
    assert_eq!(report.copied, 2);
    assert_eq!(replica.len().await, 3);
}

#[tokio::test]
async fn backfill_without_replica_is_a_config_error() {
    let store = EventStore::new(
        Arc::new(MemoryBackend::new("canonical")),
        Duration::from_millis(100),
    );
    assert!(matches!(
        store.backfill_replica(&TimeWindow::all()).await,
        Err(TaskDbError::Config(_))
    ));
}

// =========================================================================
// SQLite replica
// =========================================================================

#[tokio::test]
async fn sqlite_round_trip_preserves_context_and_payload() {
    let sqlite = SqliteEventBackend::in_memory().await.unwrap();
    sqlite.ensure_schema().await.unwrap();

    let context = ctx("run-7", "task-7")
        .with_parent_span("span-root")
        .with_actor("agent-x");
    let payload = json!({"tool": "search", "args": {"q": "rust", "k": 5}, "ratio": 0.125});
    let event = TaskEvent::new(EventKind::ToolFinish, context.clone(), payload.clone())
        .with_status(EventStatus::Ok)
        .with_duration_ms(42);

    sqlite.insert(&event).await.unwrap();
    let hits = sqlite
        .query(&EventQuery::new().kind(EventKind::ToolFinish))
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0], event);
    assert_eq!(
        serde_json::to_vec(&hits[0].context).unwrap(),
        serde_json::to_vec(&context).unwrap()
    );
    assert_eq!(
        serde_json::to_vec(&hits[0].payload).unwrap(),
        serde_json::to_vec(&payload).unwrap()
    );
}

#[tokio::test]
async fn sqlite_counts_by_window_and_filters_by_run() {
    let sqlite = SqliteEventBackend::in_memory().await.unwrap();
    sqlite.ensure_schema().await.unwrap();

    let events: Vec<TaskEvent> = (0..5)
        .map(|i| {
            let run = if i % 2 == 0 { "run-a" } else { "run-ab" };
            TaskEvent::new(EventKind::LlmCall, ctx(run, "task-1"), json!({"i": i}))
                .with_ts(at(1_000 * (i + 1)))
        })
        .collect();
    sqlite.insert_batch(&events).await.unwrap();
    sqlite.insert_batch(&events).await.unwrap();

    assert_eq!(sqlite.count(&TimeWindow::all()).await.unwrap(), 5);
    assert_eq!(
        sqlite
            .count(&TimeWindow::between(at(2_000), at(4_000)))
            .await
            .unwrap(),
        3
    );

    let run_a = sqlite
        .query(&EventQuery::new().correlated(CorrelationKey::RunId, "run-a"))
        .await
        .unwrap();
    assert_eq!(run_a.len(), 3);
    assert!(run_a.iter().all(|e| e.context.run_id == "run-a"));
}

#[tokio::test]
async fn sqlite_serves_as_replica_for_the_store() {
    let canonical = Arc::new(MemoryBackend::new("canonical"));
    let sqlite = Arc::new(SqliteEventBackend::in_memory().await.unwrap());
    let store =
        EventStore::new(canonical.clone(), Duration::from_secs(2)).with_replica(sqlite.clone());
    store.ensure_schema().await.unwrap();

    let event = TaskEvent::new(EventKind::GateFail, ctx("run-1", "task-1"), json!({"gate": "lint"}));
    let receipt = store.insert(&event).await.unwrap();

    assert_eq!(receipt.acknowledged, vec!["canonical", "sqlite"]);
    assert_eq!(sqlite.count(&TimeWindow::all()).await.unwrap(), 1);
}
