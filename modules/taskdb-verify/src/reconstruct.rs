//! Historical state reconstruction: "what was true at time T".
//!
//! The log is read from the canonical backend only, ordered by `(ts, id)`,
//! de-duplicated, and folded through a pure reducer. Facts are only ever
//! added, so state at `T` is always refined by state at any `T' >= T`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use taskdb_common::{TaskDbError, TaskDbResult};
use taskdb_events::{EventKind, EventStatus, EventStore, TaskEvent, TimeWindow};
use tracing::debug;
use uuid::Uuid;

/// Pure state update. No I/O.
pub trait Reducer<S>: Send + Sync {
    fn reduce(&self, state: &mut S, event: &TaskEvent);
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFacts {
    pub first_seen: DateTime<Utc>,
    pub runs: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFacts {
    pub task_id: String,
    pub started_at: Option<DateTime<Utc>>,
    /// First `run.finish` wins. Later finishes for the same run are ignored.
    pub finished: Option<(DateTime<Utc>, EventStatus)>,
    pub errors: u64,
    /// Gate name to its first recorded outcome. Later outcomes for the same gate are ignored.
    pub gates: BTreeMap<String, EventStatus>,
}

impl RunFacts {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            started_at: None,
            finished: None,
            errors: 0,
            gates: BTreeMap::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.finished, Some((_, EventStatus::Ok)))
    }

    pub fn gate_passed(&self, gate: &str) -> bool {
        self.gates.get(gate) == Some(&EventStatus::Ok)
    }

    pub fn failed_gates(&self) -> impl Iterator<Item = &str> {
        self.gates
            .iter()
            .filter(|(_, status)| **status != EventStatus::Ok)
            .map(|(gate, _)| gate.as_str())
    }

    fn refines(&self, earlier: &RunFacts) -> bool {
        self.task_id == earlier.task_id
            && (earlier.started_at.is_none() || self.started_at == earlier.started_at)
            && (earlier.finished.is_none() || self.finished == earlier.finished)
            && self.errors >= earlier.errors
            && earlier
                .gates
                .iter()
                .all(|(gate, status)| self.gates.get(gate) == Some(status))
    }
}

/// Everything the log asserts up to a cutoff.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconstructedState {
    pub as_of: Option<DateTime<Utc>>,
    pub events_applied: u64,
    pub kind_counts: BTreeMap<EventKind, u64>,
    pub tasks: BTreeMap<String, TaskFacts>,
    pub runs: BTreeMap<String, RunFacts>,
    /// Artifact hash to the time it was first recorded.
    pub artifacts: BTreeMap<String, DateTime<Utc>>,
}

impl ReconstructedState {
    pub fn has_task(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn has_run(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn has_artifact(&self, hash: &str) -> bool {
        self.artifacts.contains_key(hash)
    }

    /// A task is completed once any of its runs finished with status ok.
    pub fn task_completed(&self, task_id: &str) -> bool {
        self.tasks.get(task_id).is_some_and(|task| {
            task.runs
                .iter()
                .filter_map(|run| self.runs.get(run))
                .any(RunFacts::succeeded)
        })
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.kind_counts.get(&kind).copied().unwrap_or(0)
    }

    /// `self` holds every fact `earlier` holds, unchanged, and possibly more.
    pub fn refines(&self, earlier: &ReconstructedState) -> bool {
        if self.events_applied < earlier.events_applied {
            return false;
        }
        let counts = earlier
            .kind_counts
            .iter()
            .all(|(kind, n)| self.count(*kind) >= *n);
        let tasks = earlier.tasks.iter().all(|(id, task)| {
            self.tasks.get(id).is_some_and(|t| {
                t.first_seen == task.first_seen && t.runs.is_superset(&task.runs)
            })
        });
        let runs = earlier
            .runs
            .iter()
            .all(|(id, run)| self.runs.get(id).is_some_and(|r| r.refines(run)));
        let artifacts = earlier
            .artifacts
            .iter()
            .all(|(hash, at)| self.artifacts.get(hash) == Some(at));

        counts && tasks && runs && artifacts
    }
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

/// Kind-specific apply rules for `ReconstructedState`.
pub struct TaskStateReducer;

impl TaskStateReducer {
    fn gate_name(event: &TaskEvent) -> String {
        event
            .payload
            .get("gate")
            .and_then(|g| g.as_str())
            .unwrap_or(&event.context.component)
            .to_string()
    }

    fn artifact_hashes(event: &TaskEvent) -> Vec<String> {
        let single = event
            .payload
            .get("artifact_hash")
            .and_then(|h| h.as_str())
            .map(str::to_string);
        let many = event
            .payload
            .get("artifact_hashes")
            .and_then(|h| h.as_array())
            .into_iter()
            .flatten()
            .filter_map(|h| h.as_str().map(str::to_string));
        single.into_iter().chain(many).collect()
    }
}

impl Reducer<ReconstructedState> for TaskStateReducer {
    fn reduce(&self, state: &mut ReconstructedState, event: &TaskEvent) {
        let ctx = &event.context;
        state.events_applied += 1;
        *state.kind_counts.entry(event.kind).or_default() += 1;

        state
            .tasks
            .entry(ctx.task_id.clone())
            .or_insert_with(|| TaskFacts {
                first_seen: event.ts,
                runs: BTreeSet::new(),
            })
            .runs
            .insert(ctx.run_id.clone());

        let run = state
            .runs
            .entry(ctx.run_id.clone())
            .or_insert_with(|| RunFacts::new(&ctx.task_id));

        match event.kind {
            EventKind::RunStart => {
                run.started_at.get_or_insert(event.ts);
            }
            EventKind::RunFinish => {
                let status = event.status.unwrap_or(EventStatus::Ok);
                run.finished.get_or_insert((event.ts, status));
            }
            EventKind::RunError => run.errors += 1,
            EventKind::GatePass => {
                run.gates.entry(Self::gate_name(event)).or_insert(EventStatus::Ok);
            }
            EventKind::GateFail => {
                run.gates.entry(Self::gate_name(event)).or_insert(EventStatus::Fail);
            }
            _ => {}
        }

        for hash in Self::artifact_hashes(event) {
            state.artifacts.entry(hash).or_insert(event.ts);
        }
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Fold `events` at or before `cutoff` into a fresh state.
///
/// Ordering is `(ts, id)`, independent of the order events arrive in. The same
/// id seen twice with identical content is applied once. The same id with
/// different content anywhere in `events`, before or after the cutoff, means
/// the log is corrupt and replay refuses to continue.
pub fn replay<S, R>(mut events: Vec<TaskEvent>, cutoff: DateTime<Utc>, reducer: &R) -> TaskDbResult<S>
where
    S: Default,
    R: Reducer<S>,
{
    events.sort_by(|a, b| (a.ts, a.id).cmp(&(b.ts, b.id)));

    let mut seen: HashMap<Uuid, &TaskEvent> = HashMap::with_capacity(events.len());
    let mut unique: Vec<&TaskEvent> = Vec::with_capacity(events.len());
    for event in &events {
        match seen.get(&event.id) {
            Some(prev) if *prev != event => {
                return Err(TaskDbError::Validation(format!(
                    "event {} appears with conflicting content",
                    event.id
                )));
            }
            Some(_) => {}
            None => {
                seen.insert(event.id, event);
                unique.push(event);
            }
        }
    }

    let mut state = S::default();
    for event in unique.into_iter().filter(|e| e.ts <= cutoff) {
        reducer.reduce(&mut state, event);
    }
    Ok(state)
}

#[derive(Clone)]
pub struct StateReconstructor {
    store: EventStore,
}

impl StateReconstructor {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    pub async fn reconstruct(&self, cutoff: DateTime<Utc>) -> TaskDbResult<ReconstructedState> {
        let mut state: ReconstructedState = self.reconstruct_with(cutoff, &TaskStateReducer).await?;
        state.as_of = Some(cutoff);
        Ok(state)
    }

    /// Replay the canonical log through a caller-supplied reducer.
    ///
    /// The whole log is read so that a corrupt id is refused at every cutoff,
    /// not only at cutoffs late enough to include both copies.
    pub async fn reconstruct_with<S, R>(&self, cutoff: DateTime<Utc>, reducer: &R) -> TaskDbResult<S>
    where
        S: Default,
        R: Reducer<S>,
    {
        let events = self.store.read_window(&TimeWindow::all()).await?;
        debug!(events = events.len(), %cutoff, "Replaying event log");
        replay(events, cutoff, reducer)
    }
}
