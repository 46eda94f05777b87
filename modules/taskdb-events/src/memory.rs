//! In-memory backend for tests and local runs. Keeps the same indexed lookups
//! as the SQL backends and can simulate outages, rejections and slowness.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{BackendError, EventBackend};
use crate::types::{CorrelationKey, EventKind, EventQuery, TaskEvent, TimeWindow};

#[derive(Default)]
struct MemoryState {
    events: Vec<TaskEvent>,
    ids: HashSet<Uuid>,
    by_kind: HashMap<EventKind, Vec<usize>>,
    by_correlation: HashMap<(CorrelationKey, String), Vec<usize>>,
}

impl MemoryState {
    fn append(&mut self, event: &TaskEvent) {
        if !self.ids.insert(event.id) {
            return;
        }
        let pos = self.events.len();
        self.by_kind.entry(event.kind).or_default().push(pos);
        for key in CorrelationKey::ALL {
            self.by_correlation
                .entry((key, event.context.correlation(key).to_string()))
                .or_default()
                .push(pos);
        }
        self.events.push(event.clone());
    }

    fn candidates(&self, query: &EventQuery) -> Vec<&TaskEvent> {
        let positions: Option<&Vec<usize>> = match (&query.context, query.kind) {
            (Some((key, value)), _) => self.by_correlation.get(&(*key, value.clone())),
            (None, Some(kind)) => self.by_kind.get(&kind),
            (None, None) => return self.events.iter().collect(),
        };
        positions
            .map(|p| p.iter().map(|&i| &self.events[i]).collect())
            .unwrap_or_default()
    }
}

/// Thread-safe in-memory event log.
pub struct MemoryBackend {
    name: String,
    state: Mutex<MemoryState>,
    available: AtomicBool,
    reject_writes: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            reject_writes: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every call fails as unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Reachable, but every insert is refused.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every stored event in insertion order (for test assertions).
    pub async fn events(&self) -> Vec<TaskEvent> {
        self.state.lock().await.events.clone()
    }

    async fn gate(&self) -> Result<(), BackendError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!(
                "{} is offline",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_schema(&self) -> Result<(), BackendError> {
        self.gate().await
    }

    async fn insert_batch(&self, events: &[TaskEvent]) -> Result<(), BackendError> {
        self.gate().await?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected(format!(
                "{} refused {} event(s)",
                self.name,
                events.len()
            )));
        }
        let mut state = self.state.lock().await;
        for event in events {
            state.append(event);
        }
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<TaskEvent>, BackendError> {
        self.gate().await?;
        let state = self.state.lock().await;
        let mut hits: Vec<TaskEvent> = state
            .candidates(query)
            .into_iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        hits.sort_by(|a, b| (b.ts, b.id).cmp(&(a.ts, a.id)));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn count(&self, window: &TimeWindow) -> Result<i64, BackendError> {
        self.gate().await?;
        let state = self.state.lock().await;
        Ok(state.events.iter().filter(|e| window.contains(e.ts)).count() as i64)
    }

    async fn read_window(&self, window: &TimeWindow) -> Result<Vec<TaskEvent>, BackendError> {
        self.gate().await?;
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| window.contains(e.ts))
            .cloned()
            .collect())
    }

    async fn ids_in(&self, window: &TimeWindow) -> Result<Vec<Uuid>, BackendError> {
        self.gate().await?;
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| window.contains(e.ts))
            .map(|e| e.id)
            .collect())
    }
}
