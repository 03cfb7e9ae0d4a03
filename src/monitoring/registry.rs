//! Run Registry
//!
//! The queryable projection of every run the engine knows about, plus
//! per-pipeline counters. All mutation goes through a single lock so a
//! reader never sees a step's history entry without its scope binding, or a
//! terminal status without the matching counter change.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::run::{FailureReason, HistoryEntry, RunId, RunSnapshot, RunStatus, RunSummary};
use crate::scope::StepOutput;

/// Per-pipeline run counts.
///
/// `active` and `queued` are gauges; the rest only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub active: u64,
    pub queued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

impl PipelineCounters {
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out + self.cancelled
    }

    fn leave(&mut self, status: RunStatus) {
        match status {
            RunStatus::Queued => self.queued = self.queued.saturating_sub(1),
            RunStatus::Running => self.active = self.active.saturating_sub(1),
            _ => {}
        }
    }

    fn enter(&mut self, status: RunStatus) {
        match status {
            RunStatus::Queued => self.queued += 1,
            RunStatus::Running => self.active += 1,
            RunStatus::Succeeded => self.succeeded += 1,
            RunStatus::Failed => self.failed += 1,
            RunStatus::TimedOut => self.timed_out += 1,
            RunStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    runs: HashMap<RunId, RunSnapshot>,
    /// Newest first
    recent: HashMap<String, VecDeque<RunId>>,
    counters: HashMap<String, PipelineCounters>,
}

/// Shared store of run snapshots and pipeline counters.
#[derive(Debug)]
pub struct RunRegistry {
    state: RwLock<RegistryState>,
    history_limit: usize,
}

impl RunRegistry {
    /// Creates a registry retaining at most `history_limit` runs per pipeline.
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            history_limit: history_limit.max(1),
        }
    }

    /// Makes a pipeline known, with zeroed counters.
    pub fn ensure_pipeline(&self, pipeline: &str) {
        self.state
            .write()
            .counters
            .entry(pipeline.to_string())
            .or_default();
    }

    /// Records a newly submitted run in the queued state.
    pub fn register_queued(&self, snapshot: RunSnapshot) {
        let mut state = self.state.write();
        let RegistryState {
            runs,
            recent,
            counters,
        } = &mut *state;

        let pipeline = snapshot.pipeline.clone();
        counters.entry(pipeline.clone()).or_default().enter(RunStatus::Queued);

        let ids = recent.entry(pipeline).or_default();
        ids.push_front(snapshot.id);
        runs.insert(snapshot.id, snapshot);

        // Evict the oldest terminal runs over the limit.
        while ids.len() > self.history_limit {
            let oldest_terminal = ids
                .iter()
                .rposition(|id| runs.get(id).map_or(true, |r| r.status.is_terminal()));
            match oldest_terminal.and_then(|pos| ids.remove(pos)) {
                Some(evicted) => {
                    runs.remove(&evicted);
                    debug!("Evicted run {} from registry", evicted);
                }
                None => break,
            }
        }
    }

    /// Moves a queued run to running. Returns false if it was not queued.
    pub fn mark_running(&self, id: RunId, at: DateTime<Utc>) -> bool {
        self.transition(id, RunStatus::Running, |run| {
            run.started_at = Some(at);
        })
    }

    /// Notes which step a running run is executing.
    pub fn step_started(&self, id: RunId, index: usize) {
        let mut state = self.state.write();
        if let Some(run) = state.runs.get_mut(&id) {
            if run.status == RunStatus::Running {
                run.current_step = Some(index);
            }
        }
    }

    /// Appends a finished step to history and, if the step registered its
    /// output, binds it into the run's scope, in one update.
    ///
    /// Ignored once the run is terminal.
    pub fn record_step(&self, id: RunId, entry: HistoryEntry, binding: Option<(String, StepOutput)>) -> bool {
        let mut state = self.state.write();
        match state.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running => {
                run.history.push(entry);
                if let Some((register, output)) = binding {
                    run.scope.bind(register, output);
                }
                true
            }
            _ => false,
        }
    }

    /// Moves a run to a terminal status, updating counters in the same
    /// update. Returns the final snapshot, or `None` if the transition was
    /// not allowed.
    pub fn finish(
        &self,
        id: RunId,
        status: RunStatus,
        reason: Option<FailureReason>,
        at: DateTime<Utc>,
    ) -> Option<RunSnapshot> {
        if !status.is_terminal() {
            return None;
        }
        let mut finished = None;
        self.transition(id, status, |run| {
            run.ended_at = Some(at);
            run.reason = reason;
            run.current_step = None;
            finished = Some(run.clone());
        });
        finished
    }

    fn transition<F>(&self, id: RunId, next: RunStatus, apply: F) -> bool
    where
        F: FnOnce(&mut RunSnapshot),
    {
        let mut state = self.state.write();
        let RegistryState { runs, counters, .. } = &mut *state;

        let Some(run) = runs.get_mut(&id) else {
            return false;
        };
        if !run.status.can_transition_to(next) {
            return false;
        }

        let counter = counters.entry(run.pipeline.clone()).or_default();
        counter.leave(run.status);
        counter.enter(next);
        run.status = next;
        apply(run);
        true
    }

    pub fn get(&self, id: RunId) -> Option<RunSnapshot> {
        self.state.read().runs.get(&id).cloned()
    }

    pub fn status(&self, id: RunId) -> Option<RunStatus> {
        self.state.read().runs.get(&id).map(|r| r.status)
    }

    /// Counters for a pipeline, or `None` if it was never registered.
    pub fn counters(&self, pipeline: &str) -> Option<PipelineCounters> {
        self.state.read().counters.get(pipeline).copied()
    }

    /// Up to `limit` runs of a pipeline, newest first.
    pub fn recent(&self, pipeline: &str, limit: usize) -> Vec<RunSummary> {
        let state = self.state.read();
        state
            .recent
            .get(pipeline)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.runs.get(id))
                    .take(limit)
                    .map(RunSnapshot::summary)
                    .collect()
            })
            .unwrap_or_default()
    }
}
