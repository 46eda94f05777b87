//! Flat row shape shared by the SQL backends.
//!
//! Correlation keys are promoted to their own indexed columns; the full context
//! and payload are kept as serialized JSON text so reads return exactly what was
//! written.

use chrono::DateTime;
use uuid::Uuid;

use crate::backend::BackendError;
use crate::types::{EventKind, EventStatus, TaskContext, TaskEvent};

pub(crate) const TABLE: &str = "taskdb_events";

pub(crate) const COLUMNS: &str = "id, ts_ms, kind, status, duration_ms, trace_id, run_id, task_id, \
     span_id, parent_span_id, component, actor, context, payload";

pub(crate) const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_taskdb_events_ts ON taskdb_events (ts_ms);
CREATE INDEX IF NOT EXISTS idx_taskdb_events_kind ON taskdb_events (kind);
CREATE INDEX IF NOT EXISTS idx_taskdb_events_trace ON taskdb_events (trace_id);
CREATE INDEX IF NOT EXISTS idx_taskdb_events_run ON taskdb_events (run_id);
CREATE INDEX IF NOT EXISTS idx_taskdb_events_task ON taskdb_events (task_id);
CREATE INDEX IF NOT EXISTS idx_taskdb_events_span ON taskdb_events (span_id);
CREATE INDEX IF NOT EXISTS idx_taskdb_events_component ON taskdb_events (component);
"#;

#[derive(Debug, Clone)]
pub(crate) struct EventRow {
    pub id: String,
    pub ts_ms: i64,
    pub kind: String,
    pub status: Option<String>,
    pub duration_ms: Option<i64>,
    pub trace_id: String,
    pub run_id: String,
    pub task_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub component: String,
    pub actor: Option<String>,
    pub context: String,
    pub payload: String,
}

impl EventRow {
    pub fn from_event(event: &TaskEvent) -> Result<Self, BackendError> {
        let context = serde_json::to_string(&event.context)
            .map_err(|e| BackendError::Rejected(format!("context not serializable: {e}")))?;
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| BackendError::Rejected(format!("payload not serializable: {e}")))?;

        let ctx = &event.context;
        Ok(Self {
            id: event.id.to_string(),
            ts_ms: event.ts_millis(),
            kind: event.kind.as_str().to_string(),
            status: event.status.map(|s| s.as_str().to_string()),
            duration_ms: event.duration_ms,
            trace_id: ctx.trace_id.clone(),
            run_id: ctx.run_id.clone(),
            task_id: ctx.task_id.clone(),
            span_id: ctx.span_id.clone(),
            parent_span_id: ctx.parent_span_id.clone(),
            component: ctx.component.clone(),
            actor: ctx.actor.clone(),
            context,
            payload,
        })
    }

    pub fn into_event(self) -> Result<TaskEvent, BackendError> {
        let corrupt = |what: &str, detail: String| {
            BackendError::Corrupt(format!("row {}: {what}: {detail}", self.id))
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt("id", e.to_string()))?;
        let ts = DateTime::from_timestamp_millis(self.ts_ms)
            .ok_or_else(|| corrupt("ts_ms", self.ts_ms.to_string()))?;
        let kind: EventKind = self.kind.parse().map_err(|e: taskdb_common::TaskDbError| {
            corrupt("kind", e.to_string())
        })?;
        let status: Option<EventStatus> = self
            .status
            .as_deref()
            .map(|s| s.parse::<EventStatus>())
            .transpose()
            .map_err(|e: taskdb_common::TaskDbError| corrupt("status", e.to_string()))?;
        let context: TaskContext =
            serde_json::from_str(&self.context).map_err(|e| corrupt("context", e.to_string()))?;
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).map_err(|e| corrupt("payload", e.to_string()))?;

        if context.task_id != self.task_id || context.run_id != self.run_id {
            return Err(corrupt(
                "context",
                "indexed columns disagree with stored context".to_string(),
            ));
        }

        Ok(TaskEvent {
            id,
            ts,
            kind,
            context,
            status,
            duration_ms: self.duration_ms,
            payload,
        })
    }
}

macro_rules! impl_from_row {
    ($row:ty) => {
        impl<'r> sqlx::FromRow<'r, $row> for EventRow {
            fn from_row(row: &'r $row) -> std::result::Result<Self, sqlx::Error> {
                use sqlx::Row;
                Ok(EventRow {
                    id: row.try_get("id")?,
                    ts_ms: row.try_get("ts_ms")?,
                    kind: row.try_get("kind")?,
                    status: row.try_get("status")?,
                    duration_ms: row.try_get("duration_ms")?,
                    trace_id: row.try_get("trace_id")?,
                    run_id: row.try_get("run_id")?,
                    task_id: row.try_get("task_id")?,
                    span_id: row.try_get("span_id")?,
                    parent_span_id: row.try_get("parent_span_id")?,
                    component: row.try_get("component")?,
                    actor: row.try_get("actor")?,
                    context: row.try_get("context")?,
                    payload: row.try_get("payload")?,
                })
            }
        }
    };
}

impl_from_row!(sqlx::postgres::PgRow);
impl_from_row!(sqlx::sqlite::SqliteRow);

/// `EventBackend` for a pooled SQL backend. Both dialects accept the same
/// statements, so only the pool, the database marker, the schema and the
/// per-statement row cap differ.
macro_rules! impl_sql_event_backend {
    ($backend:ty, $db:ty, $name:literal, $schema:expr, $rows_per_statement:expr) => {
        #[async_trait::async_trait]
        impl $crate::backend::EventBackend for $backend {
            fn name(&self) -> &str {
                $name
            }

            async fn ensure_schema(&self) -> Result<(), $crate::backend::BackendError> {
                sqlx::raw_sql($schema).execute(&self.pool).await?;
                sqlx::raw_sql($crate::row::INDEXES).execute(&self.pool).await?;
                Ok(())
            }

            async fn insert_batch(
                &self,
                events: &[$crate::types::TaskEvent],
            ) -> Result<(), $crate::backend::BackendError> {
                use $crate::row::{EventRow, COLUMNS, TABLE};

                if events.is_empty() {
                    return Ok(());
                }
                let rows = events
                    .iter()
                    .map(EventRow::from_event)
                    .collect::<Result<Vec<_>, _>>()?;

                let mut tx = self.pool.begin().await?;
                for chunk in rows.chunks($rows_per_statement) {
                    let mut builder =
                        sqlx::QueryBuilder::<$db>::new(format!("INSERT INTO {TABLE} ({COLUMNS}) "));
                    builder.push_values(chunk.iter().cloned(), |mut b, row| {
                        b.push_bind(row.id)
                            .push_bind(row.ts_ms)
                            .push_bind(row.kind)
                            .push_bind(row.status)
                            .push_bind(row.duration_ms)
                            .push_bind(row.trace_id)
                            .push_bind(row.run_id)
                            .push_bind(row.task_id)
                            .push_bind(row.span_id)
                            .push_bind(row.parent_span_id)
                            .push_bind(row.component)
                            .push_bind(row.actor)
                            .push_bind(row.context)
                            .push_bind(row.payload);
                    });
                    builder.push(" ON CONFLICT (id) DO NOTHING");
                    builder.build().execute(&mut *tx).await?;
                }
                tx.commit().await?;

                Ok(())
            }

            async fn query(
                &self,
                query: &$crate::types::EventQuery,
            ) -> Result<Vec<$crate::types::TaskEvent>, $crate::backend::BackendError> {
                use $crate::row::{EventRow, COLUMNS, TABLE};

                let mut builder =
                    sqlx::QueryBuilder::<$db>::new(format!("SELECT {COLUMNS} FROM {TABLE} WHERE 1 = 1"));
                if let Some(kind) = query.kind {
                    builder.push(" AND kind = ").push_bind(kind.as_str());
                }
                if let Some((key, value)) = &query.context {
                    builder
                        .push(format!(" AND {} = ", key.column()))
                        .push_bind(value.clone());
                }
                builder
                    .push(" ORDER BY ts_ms DESC, id DESC LIMIT ")
                    .push_bind(query.limit as i64);

                let rows = builder
                    .build_query_as::<EventRow>()
                    .fetch_all(&self.pool)
                    .await?;
                rows.into_iter().map(EventRow::into_event).collect()
            }

            async fn count(
                &self,
                window: &$crate::types::TimeWindow,
            ) -> Result<i64, $crate::backend::BackendError> {
                use $crate::row::TABLE;

                let mut builder =
                    sqlx::QueryBuilder::<$db>::new(format!("SELECT COUNT(*) FROM {TABLE} WHERE 1 = 1"));
                impl_sql_event_backend!(@window builder, window);

                let row = builder
                    .build_query_as::<(i64,)>()
                    .fetch_one(&self.pool)
                    .await?;
                Ok(row.0)
            }

            async fn read_window(
                &self,
                window: &$crate::types::TimeWindow,
            ) -> Result<Vec<$crate::types::TaskEvent>, $crate::backend::BackendError> {
                use $crate::row::{EventRow, COLUMNS, TABLE};

                let mut builder =
                    sqlx::QueryBuilder::<$db>::new(format!("SELECT {COLUMNS} FROM {TABLE} WHERE 1 = 1"));
                impl_sql_event_backend!(@window builder, window);

                let rows = builder
                    .build_query_as::<EventRow>()
                    .fetch_all(&self.pool)
                    .await?;
                rows.into_iter().map(EventRow::into_event).collect()
            }

            async fn ids_in(
                &self,
                window: &$crate::types::TimeWindow,
            ) -> Result<Vec<uuid::Uuid>, $crate::backend::BackendError> {
                use $crate::row::TABLE;

                let mut builder =
                    sqlx::QueryBuilder::<$db>::new(format!("SELECT id FROM {TABLE} WHERE 1 = 1"));
                impl_sql_event_backend!(@window builder, window);

                let rows = builder
                    .build_query_as::<(String,)>()
                    .fetch_all(&self.pool)
                    .await?;
                rows.into_iter()
                    .map(|(id,)| {
                        uuid::Uuid::parse_str(&id).map_err(|e| {
                            $crate::backend::BackendError::Corrupt(format!("id {id}: {e}"))
                        })
                    })
                    .collect()
            }
        }
    };

    (@window $builder:ident, $window:ident) => {
        if let Some(from) = $window.from_millis() {
            $builder.push(" AND ts_ms >= ").push_bind(from);
        }
        if let Some(until) = $window.until_millis() {
            $builder.push(" AND ts_ms <= ").push_bind(until);
        }
    };
}
