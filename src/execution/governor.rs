//! Concurrency Governor
//!
//! Bounds the number of simultaneously running runs per pipeline. A run that
//! cannot start immediately waits in a FIFO queue; when a running run drops
//! its [`Permit`] the slot passes directly to the oldest waiter that is still
//! interested. Admission never blocks: [`Governor::admit`] answers at once
//! with either a permit or a place in the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::run::RunId;

#[derive(Debug)]
struct Waiter {
    run_id: RunId,
    tx: oneshot::Sender<Permit>,
}

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Gate {
    pipeline: String,
    max_concurrent: usize,
    state: Mutex<GateState>,
}

impl Gate {
    /// Hands a freed slot to the next live waiter, or returns it.
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            let permit = Permit {
                gate: Arc::clone(self),
                run_id: waiter.run_id,
                armed: true,
            };
            match waiter.tx.send(permit) {
                Ok(()) => {
                    debug!(
                        "Pipeline '{}': slot handed to queued run {}",
                        self.pipeline, waiter.run_id
                    );
                    return;
                }
                Err(mut unclaimed) => {
                    // The waiter gave up; this permit must not release again.
                    unclaimed.armed = false;
                }
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    fn withdraw(&self, run_id: RunId) -> bool {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.run_id != run_id);
        state.waiters.len() != before
    }
}

/// A held execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    gate: Arc<Gate>,
    run_id: RunId,
    armed: bool,
}

impl Permit {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.armed {
            self.gate.release();
        }
    }
}

/// A run waiting for a slot.
#[derive(Debug)]
pub struct QueuedAdmission {
    gate: Arc<Gate>,
    run_id: RunId,
    rx: oneshot::Receiver<Permit>,
}

impl QueuedAdmission {
    /// Resolves once a slot is handed over.
    ///
    /// Returns `None` if the governor dropped the request.
    pub async fn wait(&mut self) -> Option<Permit> {
        (&mut self.rx).await.ok()
    }

    /// Leaves the queue. A slot granted concurrently is passed on.
    pub fn withdraw(self) {
        if self.gate.withdraw(self.run_id) {
            debug!(
                "Pipeline '{}': run {} left the queue",
                self.gate.pipeline, self.run_id
            );
        }
        // Dropping the receiver drops any permit already sent, which
        // releases it to the next waiter.
    }
}

/// Outcome of asking for a slot.
#[derive(Debug)]
pub enum Admission {
    Granted(Permit),
    Queued(QueuedAdmission),
}

/// Per-pipeline concurrency gates.
#[derive(Debug)]
pub struct Governor {
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    default_max_concurrent: usize,
}

impl Governor {
    pub fn new(default_max_concurrent: usize) -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
            default_max_concurrent: default_max_concurrent.max(1),
        }
    }

    /// Creates the gate for a pipeline.
    pub fn configure(&self, pipeline: &str, max_concurrent: Option<usize>) {
        let max_concurrent = max_concurrent
            .unwrap_or(self.default_max_concurrent)
            .max(1);
        self.gates.lock().insert(
            pipeline.to_string(),
            Arc::new(Gate {
                pipeline: pipeline.to_string(),
                max_concurrent,
                state: Mutex::new(GateState::default()),
            }),
        );
        debug!(
            "Pipeline '{}': at most {} concurrent runs",
            pipeline, max_concurrent
        );
    }

    fn gate(&self, pipeline: &str) -> Arc<Gate> {
        let mut gates = self.gates.lock();
        let default_max = self.default_max_concurrent;
        Arc::clone(gates.entry(pipeline.to_string()).or_insert_with(|| {
            Arc::new(Gate {
                pipeline: pipeline.to_string(),
                max_concurrent: default_max,
                state: Mutex::new(GateState::default()),
            })
        }))
    }

    /// Grants a slot if one is free and nobody is queued ahead; otherwise
    /// queues the run behind earlier requests.
    pub fn admit(&self, pipeline: &str, run_id: RunId) -> Admission {
        let gate = self.gate(pipeline);
        let mut state = gate.state.lock();

        if state.active < gate.max_concurrent && state.waiters.is_empty() {
            state.active += 1;
            drop(state);
            return Admission::Granted(Permit {
                gate,
                run_id,
                armed: true,
            });
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { run_id, tx });
        debug!(
            "Pipeline '{}': run {} queued at position {}",
            pipeline,
            run_id,
            state.waiters.len()
        );
        drop(state);
        Admission::Queued(QueuedAdmission { gate, run_id, rx })
    }

    /// Slots currently held for a pipeline.
    pub fn active(&self, pipeline: &str) -> usize {
        self.gates
            .lock()
            .get(pipeline)
            .map_or(0, |g| g.state.lock().active)
    }

    /// Runs waiting for a slot.
    pub fn queued(&self, pipeline: &str) -> usize {
        self.gates
            .lock()
            .get(pipeline)
            .map_or(0, |g| g.state.lock().waiters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(admission: Admission) -> Permit {
        match admission {
            Admission::Granted(permit) => permit,
            Admission::Queued(_) => panic!("expected a permit"),
        }
    }

    fn queued(admission: Admission) -> QueuedAdmission {
        match admission {
            Admission::Queued(q) => q,
            Admission::Granted(_) => panic!("expected to be queued"),
        }
    }

    #[tokio::test]
    async fn test_never_exceeds_max() {
        let governor = Governor::new(50);
        governor.configure("p", Some(2));

        let a = granted(governor.admit("p", RunId::new()));
        let _b = granted(governor.admit("p", RunId::new()));
        let mut c = queued(governor.admit("p", RunId::new()));
        assert_eq!(governor.active("p"), 2);
        assert_eq!(governor.queued("p"), 1);

        drop(a);
        let c_permit = c.wait().await.unwrap();
        assert_eq!(governor.active("p"), 2);
        assert_eq!(governor.queued("p"), 0);

        drop(c_permit);
        assert_eq!(governor.active("p"), 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let governor = Governor::new(50);
        governor.configure("p", Some(1));

        let first = granted(governor.admit("p", RunId::new()));
        let ids: Vec<RunId> = (0..3).map(|_| RunId::new()).collect();
        let mut waiting: Vec<QueuedAdmission> =
            ids.iter().map(|id| queued(governor.admit("p", *id))).collect();

        drop(first);
        let mut order = Vec::new();
        for q in waiting.iter_mut() {
            let permit = q.wait().await.unwrap();
            order.push(permit.run_id());
            drop(permit);
        }
        assert_eq!(order, ids);
        assert_eq!(governor.active("p"), 0);
    }

    #[tokio::test]
    async fn test_withdrawn_waiters_are_skipped() {
        let governor = Governor::new(50);
        governor.configure("p", Some(1));

        let holder = granted(governor.admit("p", RunId::new()));
        let gone = queued(governor.admit("p", RunId::new()));
        let next_id = RunId::new();
        let mut next = queued(governor.admit("p", next_id));

        gone.withdraw();
        assert_eq!(governor.queued("p"), 1);

        drop(holder);
        assert_eq!(next.wait().await.unwrap().run_id(), next_id);
    }

    #[tokio::test]
    async fn test_dropped_receiver_passes_slot_on() {
        let governor = Governor::new(50);
        governor.configure("p", Some(1));

        let holder = granted(governor.admit("p", RunId::new()));
        let abandoned = queued(governor.admit("p", RunId::new()));
        let mut next = queued(governor.admit("p", RunId::new()));

        // Dropped without withdrawing: the gate must skip it on release.
        drop(abandoned);
        drop(holder);
        assert!(next.wait().await.is_some());
        assert_eq!(governor.active("p"), 1);
    }

    #[tokio::test]
    async fn test_withdraw_after_grant_releases() {
        let governor = Governor::new(50);
        governor.configure("p", Some(1));

        let holder = granted(governor.admit("p", RunId::new()));
        let late = queued(governor.admit("p", RunId::new()));
        let mut next = queued(governor.admit("p", RunId::new()));

        // The slot reaches `late` before it withdraws.
        drop(holder);
        late.withdraw();
        assert!(next.wait().await.is_some());
    }

    #[test]
    fn test_unconfigured_pipeline_uses_default() {
        let governor = Governor::new(1);
        let _a = granted(governor.admit("adhoc", RunId::new()));
        assert!(matches!(governor.admit("adhoc", RunId::new()), Admission::Queued(_)));
    }
}
