//! Integration tests for the Postgres canonical backend.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use taskdb_events::{
    CorrelationKey, EventBackend, EventKind, EventQuery, EventStore, PgEventBackend,
    SqliteEventBackend, TaskContext, TaskEvent, TimeWindow,
};

/// Get a clean Postgres backend, or skip if no test DB is available.
async fn test_backend() -> Option<PgEventBackend> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    let backend = PgEventBackend::new(pool);
    backend.ensure_schema().await.ok()?;

    // Clean slate for each test
    sqlx::query("TRUNCATE taskdb_events")
        .execute(backend.pool())
        .await
        .ok()?;

    Some(backend)
}

fn ctx(task: &str) -> TaskContext {
    TaskContext::new("trace-pg", "run-pg", task, "span-pg", "gate")
}

#[tokio::test]
async fn insert_then_query_by_kind_is_byte_identical() {
    let Some(pg) = test_backend().await else {
        return;
    };

    let payload = json!({"gate": "unit", "stats": {"passed": 10, "failed": 0}, "ratio": 1.5});
    let event = TaskEvent::new(EventKind::GatePass, ctx("task-1").with_actor("ci"), payload);
    pg.insert(&event).await.unwrap();

    let hits = pg
        .query(&EventQuery::new().kind(EventKind::GatePass))
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(
        serde_json::to_string(&hits[0].context).unwrap(),
        serde_json::to_string(&event.context).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&hits[0].payload).unwrap(),
        serde_json::to_string(&event.payload).unwrap()
    );
}

#[tokio::test]
async fn task_filter_is_exact_match() {
    let Some(pg) = test_backend().await else {
        return;
    };

    pg.insert_batch(&[
        TaskEvent::new(EventKind::ToolStart, ctx("task-1"), json!({})),
        TaskEvent::new(EventKind::ToolStart, ctx("task-10"), json!({})),
        TaskEvent::new(EventKind::ToolStart, ctx("task-100"), json!({})),
    ])
    .await
    .unwrap();

    let hits = pg
        .query(&EventQuery::new().correlated(CorrelationKey::TaskId, "task-1"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(pg.count(&TimeWindow::all()).await.unwrap(), 3);
}

#[tokio::test]
async fn dual_write_to_postgres_and_sqlite_then_backfill() {
    let Some(pg) = test_backend().await else {
        return;
    };
    let sqlite = Arc::new(SqliteEventBackend::in_memory().await.unwrap());
    sqlite.ensure_schema().await.unwrap();

    let pg = Arc::new(pg);
    let store = EventStore::new(pg.clone(), Duration::from_secs(5)).with_replica(sqlite.clone());

    let first = TaskEvent::new(EventKind::RunStart, ctx("task-1"), json!({}));
    store.insert(&first).await.unwrap();

    // Write only to canonical to simulate a missed replica write.
    let second = TaskEvent::new(EventKind::RunFinish, ctx("task-1"), json!({}));
    pg.insert(&second).await.unwrap();

    assert_eq!(pg.count(&TimeWindow::all()).await.unwrap(), 2);
    assert_eq!(sqlite.count(&TimeWindow::all()).await.unwrap(), 1);

    let report = store.backfill_replica(&TimeWindow::all()).await.unwrap();
    assert_eq!(report.copied, 1);
    assert_eq!(sqlite.count(&TimeWindow::all()).await.unwrap(), 2);
}
