//! `RunStore`: durable state machine for in-flight and completed turns.
//! A run that's still `Pending` when the process restarts is marked
//! `Interrupted` on the next startup sweep rather than silently
//! vanishing. `LifecycleStream` fans lifecycle events out to any number
//! of subscribers (e.g. a UI or log sink).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    RunStarted { run_id: Uuid },
    RunStateChanged { run_id: Uuid, state: RunState },
    RunFinished { run_id: Uuid, state: RunState },
}

pub struct RunStore {
    runs: Mutex<HashMap<Uuid, Run>>,
    max_retained: usize,
}

impl RunStore {
    pub fn new(max_retained: usize) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            max_retained,
        }
    }

    pub fn start_run(&self) -> Uuid {
        let run = Run {
            id: Uuid::new_v4(),
            state: RunState::Pending,
            started_at: Utc::now(),
            consumed_at: None,
        };
        let id = run.id;
        self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(id, run);
        id
    }

    pub fn set_state(&self, run_id: Uuid, state: RunState) {
        let mut guard = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(run) = guard.get_mut(&run_id) {
            run.state = state;
            if matches!(state, RunState::Completed | RunState::Failed | RunState::Interrupted) {
                run.consumed_at = Some(Utc::now());
            }
        }
    }

    pub fn get(&self, run_id: Uuid) -> Option<Run> {
        self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&run_id).cloned()
    }

    /// Called once at process start: any run still `Pending`/`Running`
    /// from a prior process is marked `Interrupted` rather than left to
    /// look like it's still in flight forever.
    pub fn sweep_interrupted_on_start(&self) -> Vec<Uuid> {
        let mut guard = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut swept = Vec::new();
        for run in guard.values_mut() {
            if matches!(run.state, RunState::Pending | RunState::Running) {
                run.state = RunState::Interrupted;
                run.consumed_at = Some(Utc::now());
                swept.push(run.id);
            }
        }
        swept
    }

    /// Prune completed/failed/interrupted runs beyond the retention cap,
    /// oldest-consumed-first.
    pub fn prune(&self) -> usize {
        let mut guard = self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut finished: Vec<(Uuid, DateTime<Utc>)> = guard
            .values()
            .filter_map(|r| r.consumed_at.map(|c| (r.id, c)))
            .collect();
        finished.sort_by_key(|(_, consumed_at)| *consumed_at);

        let excess = finished.len().saturating_sub(self.max_retained);
        let to_remove: Vec<Uuid> = finished.into_iter().take(excess).map(|(id, _)| id).collect();
        for id in &to_remove {
            guard.remove(id);
        }
        to_remove.len()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct LifecycleStream {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Broadcasting is best-effort: a lagging or absent subscriber never
    /// blocks or fails the caller.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for LifecycleStream {
    fn default() -> Self {
        Self::new(256)
    }
}
