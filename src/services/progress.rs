use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::models::ProgressEvent;

pub const STAGE_PLANNING_STARTED: u32 = 1;
pub const STAGE_STRUCTURE_REQUESTED: u32 = 2;
pub const STAGE_STRUCTURE_DONE: u32 = 3;
pub const STAGE_CHAPTER: u32 = 4;
pub const STAGE_COMPILING: u32 = 5;
pub const STAGE_FINISHED: u32 = 6;

/// Runs whose events are retained. Older inactive runs are evicted first.
const MAX_TRACKED_RUNS: usize = 64;
/// Events retained per run; the oldest are dropped beyond this.
const MAX_EVENTS_PER_RUN: usize = 512;

/// Receives coarse milestones of a run. Called synchronously from the
/// generation loop, so implementations must return quickly.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, stage: u32, message: &str);
}

impl<F> ProgressReporter for F
where
    F: Fn(u32, &str) + Send + Sync,
{
    fn report(&self, stage: u32, message: &str) {
        self(stage, message)
    }
}

#[derive(Default)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _stage: u32, _message: &str) {}
}

#[derive(Default)]
struct RegistryState {
    events: HashMap<String, VecDeque<ProgressEvent>>,
    order: VecDeque<String>,
    active: HashSet<String>,
}

impl RegistryState {
    fn evict_stale(&mut self) {
        while self.order.len() > MAX_TRACKED_RUNS {
            let Some(pos) = self.order.iter().position(|id| !self.active.contains(id)) else {
                break;
            };
            if let Some(id) = self.order.remove(pos) {
                self.events.remove(&id);
            }
        }
    }
}

/// Progress events and active-run bookkeeping shared by the HTTP handlers.
#[derive(Clone, Default)]
pub struct ProgressRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every update is a single insert or remove, so a poisoned lock
        // still holds consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, run_id: &str, stage: u32, message: &str) {
        let mut state = self.lock();
        if !state.events.contains_key(run_id) {
            state.order.push_back(run_id.to_string());
        }
        let events = state.events.entry(run_id.to_string()).or_default();
        events.push_back(ProgressEvent {
            stage,
            message: message.to_string(),
            at: Utc::now(),
        });
        while events.len() > MAX_EVENTS_PER_RUN {
            events.pop_front();
        }
        state.evict_stale();
    }

    pub fn events(&self, run_id: &str) -> Vec<ProgressEvent> {
        self.lock()
            .events
            .get(run_id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks a run as executing. Returns false when it already was.
    pub fn try_activate(&self, run_id: &str) -> bool {
        self.lock().active.insert(run_id.to_string())
    }

    pub fn deactivate(&self, run_id: &str) {
        let mut state = self.lock();
        state.active.remove(run_id);
        state.evict_stale();
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.lock().active.contains(run_id)
    }

    /// Deactivates `run_id` when the returned guard is dropped, including
    /// while unwinding from a panic.
    pub fn release_on_drop(&self, run_id: &str) -> ActiveRunGuard {
        ActiveRunGuard {
            registry: self.clone(),
            run_id: run_id.to_string(),
        }
    }

    pub fn reporter(&self, run_id: &str) -> RunReporter {
        RunReporter {
            registry: self.clone(),
            run_id: run_id.to_string(),
        }
    }
}

pub struct ActiveRunGuard {
    registry: ProgressRegistry,
    run_id: String,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.registry.deactivate(&self.run_id);
    }
}

/// Forwards one run's events into the registry and the log.
pub struct RunReporter {
    registry: ProgressRegistry,
    run_id: String,
}

impl ProgressReporter for RunReporter {
    fn report(&self, stage: u32, message: &str) {
        tracing::info!(run = %self.run_id, stage, "{}", message);
        self.registry.record(&self.run_id, stage, message);
    }
}
