//! Core types for the TaskEvent log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use taskdb_common::{TaskDbError, TaskDbResult};
use uuid::Uuid;

/// Category tag of a TaskEvent. Closed set; anything else read back from a
/// backend is treated as corrupt input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.start")]
    RunStart,
    #[serde(rename = "run.finish")]
    RunFinish,
    #[serde(rename = "run.error")]
    RunError,
    #[serde(rename = "guardrail.input")]
    GuardrailInput,
    #[serde(rename = "guardrail.output")]
    GuardrailOutput,
    #[serde(rename = "router.decision")]
    RouterDecision,
    #[serde(rename = "memory.inject")]
    MemoryInject,
    #[serde(rename = "memory.store")]
    MemoryStore,
    #[serde(rename = "tool.start")]
    ToolStart,
    #[serde(rename = "tool.finish")]
    ToolFinish,
    #[serde(rename = "tool.error")]
    ToolError,
    #[serde(rename = "llm.call")]
    LlmCall,
    #[serde(rename = "llm.result")]
    LlmResult,
    #[serde(rename = "perf.benchmark")]
    PerfBenchmark,
    #[serde(rename = "gate.pass")]
    GatePass,
    #[serde(rename = "gate.fail")]
    GateFail,
}

impl EventKind {
    pub const ALL: [EventKind; 16] = [
        Self::RunStart,
        Self::RunFinish,
        Self::RunError,
        Self::GuardrailInput,
        Self::GuardrailOutput,
        Self::RouterDecision,
        Self::MemoryInject,
        Self::MemoryStore,
        Self::ToolStart,
        Self::ToolFinish,
        Self::ToolError,
        Self::LlmCall,
        Self::LlmResult,
        Self::PerfBenchmark,
        Self::GatePass,
        Self::GateFail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStart => "run.start",
            Self::RunFinish => "run.finish",
            Self::RunError => "run.error",
            Self::GuardrailInput => "guardrail.input",
            Self::GuardrailOutput => "guardrail.output",
            Self::RouterDecision => "router.decision",
            Self::MemoryInject => "memory.inject",
            Self::MemoryStore => "memory.store",
            Self::ToolStart => "tool.start",
            Self::ToolFinish => "tool.finish",
            Self::ToolError => "tool.error",
            Self::LlmCall => "llm.call",
            Self::LlmResult => "llm.result",
            Self::PerfBenchmark => "perf.benchmark",
            Self::GatePass => "gate.pass",
            Self::GateFail => "gate.fail",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = TaskDbError;

    fn from_str(s: &str) -> TaskDbResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| TaskDbError::Validation(format!("unknown event kind '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Ok,
    Fail,
    Skip,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }
}

impl FromStr for EventStatus {
    type Err = TaskDbError;

    fn from_str(s: &str) -> TaskDbResult<Self> {
        match s {
            "ok" => Ok(Self::Ok),
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            other => Err(TaskDbError::Validation(format!(
                "unknown event status '{other}'"
            ))),
        }
    }
}

/// Structured key bag identifying where an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub trace_id: String,
    pub run_id: String,
    pub task_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl TaskContext {
    pub fn new(
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
        task_id: impl Into<String>,
        span_id: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            run_id: run_id.into(),
            task_id: task_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            component: component.into(),
            actor: None,
        }
    }

    pub fn with_parent_span(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Value of a correlation key. Exact field access, never a text search.
    pub fn correlation(&self, key: CorrelationKey) -> &str {
        match key {
            CorrelationKey::TraceId => &self.trace_id,
            CorrelationKey::RunId => &self.run_id,
            CorrelationKey::TaskId => &self.task_id,
            CorrelationKey::SpanId => &self.span_id,
            CorrelationKey::Component => &self.component,
        }
    }
}

/// Context fields that can be used to filter queries. Each maps to its own
/// indexed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKey {
    TraceId,
    RunId,
    TaskId,
    SpanId,
    Component,
}

impl CorrelationKey {
    pub const ALL: [CorrelationKey; 5] = [
        Self::TraceId,
        Self::RunId,
        Self::TaskId,
        Self::SpanId,
        Self::Component,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            Self::TraceId => "trace_id",
            Self::RunId => "run_id",
            Self::TaskId => "task_id",
            Self::SpanId => "span_id",
            Self::Component => "component",
        }
    }
}

/// An immutable, timestamped, kind-tagged record. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub context: TaskContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub payload: serde_json::Value,
}

impl TaskEvent {
    /// New event stamped now. Backends persist millisecond precision, so the
    /// timestamp is truncated up front to keep round trips exact.
    pub fn new(kind: EventKind, context: TaskContext, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: truncate_to_millis(Utc::now()),
            kind,
            context,
            status: None,
            duration_ms: None,
            payload,
        }
    }

    pub fn with_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = truncate_to_millis(ts);
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn ts_millis(&self) -> i64 {
        self.ts.timestamp_millis()
    }

    /// Reject records missing a required context field before any backend sees them.
    pub fn validate(&self) -> TaskDbResult<()> {
        let ctx = &self.context;
        let required = [
            ("trace_id", &ctx.trace_id),
            ("span_id", &ctx.span_id),
            ("run_id", &ctx.run_id),
            ("task_id", &ctx.task_id),
            ("component", &ctx.component),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(TaskDbError::Validation(format!(
                    "event {} missing {field}",
                    self.id
                )));
            }
        }
        if matches!(self.duration_ms, Some(d) if d < 0) {
            return Err(TaskDbError::Validation(format!(
                "event {} has negative duration_ms",
                self.id
            )));
        }
        Ok(())
    }
}

pub(crate) fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Filter for `EventStore::query`. Results are newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub kind: Option<EventKind>,
    pub context: Option<(CorrelationKey, String)>,
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            kind: None,
            context: None,
            limit: 1000,
        }
    }
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn correlated(mut self, key: CorrelationKey, value: impl Into<String>) -> Self {
        self.context = Some((key, value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, event: &TaskEvent) -> bool {
        if self.kind.is_some_and(|k| k != event.kind) {
            return false;
        }
        match &self.context {
            Some((key, value)) => event.context.correlation(*key) == value,
            None => true,
        }
    }
}

/// Inclusive time range. Open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// The whole log.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
        }
    }

    /// Everything at or before `cutoff`.
    pub fn up_to(cutoff: DateTime<Utc>) -> Self {
        Self {
            from: None,
            until: Some(cutoff),
        }
    }

    /// The trailing `span` ending now.
    pub fn last(span: Duration) -> Self {
        let now = Utc::now();
        Self::between(now - span, now)
    }

    pub fn from_millis(&self) -> Option<i64> {
        self.from.map(|t| t.timestamp_millis())
    }

    pub fn until_millis(&self) -> Option<i64> {
        self.until.map(|t| t.timestamp_millis())
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let ms = ts.timestamp_millis();
        self.from_millis().map_or(true, |f| ms >= f) && self.until_millis().map_or(true, |u| ms <= u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(task: &str) -> TaskContext {
        TaskContext::new("trace-1", "run-1", task, "span-1", "planner")
    }

    #[test]
    fn kind_round_trips_through_str_and_serde() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, json!(kind.as_str()));
        }
        assert!("run.restart".parse::<EventKind>().is_err());
    }

    #[test]
    fn validate_requires_context_fields() {
        let ok = TaskEvent::new(EventKind::RunStart, ctx("task-1"), json!({}));
        assert!(ok.validate().is_ok());

        let mut missing = ok.clone();
        missing.context.span_id = " ".into();
        let err = missing.validate().unwrap_err();
        assert!(matches!(err, TaskDbError::Validation(msg) if msg.contains("span_id")));
    }

    #[test]
    fn timestamps_are_truncated_to_millis() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let event = TaskEvent::new(EventKind::LlmCall, ctx("t"), json!(null)).with_ts(ts);
        assert_eq!(event.ts.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn correlation_filter_is_exact_not_prefix() {
        let query = EventQuery::new().correlated(CorrelationKey::TaskId, "task-1");
        let exact = TaskEvent::new(EventKind::RunStart, ctx("task-1"), json!({}));
        let prefixed = TaskEvent::new(EventKind::RunStart, ctx("task-10"), json!({}));
        assert!(query.matches(&exact));
        assert!(!query.matches(&prefixed));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let from = DateTime::from_timestamp_millis(1_000).unwrap();
        let until = DateTime::from_timestamp_millis(2_000).unwrap();
        let window = TimeWindow::between(from, until);
        assert!(window.contains(from));
        assert!(window.contains(until));
        assert!(!window.contains(DateTime::from_timestamp_millis(2_001).unwrap()));
        assert!(TimeWindow::all().contains(until));
    }
}
