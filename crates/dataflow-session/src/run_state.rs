//! Per-step state shared by the coordinator and a step's executors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::barrier::StatusCallback;
use crate::error::{update_status, Result, SessionError};
use crate::notification::Notification;
use crate::rendezvous::{LocalRendezvous, Rendezvous};
use crate::session_state::{StepContainer, TensorStore};
use crate::step_stats::StepStatsCollector;

/// Which declared feeds and fetches a partial run has satisfied.
#[derive(Debug, Default)]
pub struct PendingState {
    pub inputs: BTreeMap<String, bool>,
    pub outputs: BTreeMap<String, bool>,
}

impl PendingState {
    /// True once every declared feed and fetch is satisfied.
    pub fn done(&self) -> bool {
        self.inputs.values().all(|v| *v) && self.outputs.values().all(|v| *v)
    }
}

pub struct RunState {
    pub step_id: i64,
    pub rendezvous: Arc<LocalRendezvous>,
    pub tensor_store: Arc<TensorStore>,
    pub step_container: Arc<StepContainer>,
    pub collector: Option<Arc<StepStatsCollector>>,
    pub executors_done: Arc<Notification>,
    status: Arc<Mutex<Result<()>>>,
    pending: Mutex<PendingState>,
    dispatched: AtomicBool,
}

impl RunState {
    pub fn new(step_id: i64) -> Self {
        RunState {
            step_id,
            rendezvous: Arc::new(LocalRendezvous::new()),
            tensor_store: Arc::new(TensorStore::new()),
            step_container: Arc::new(StepContainer::new(step_id)),
            collector: None,
            executors_done: Arc::new(Notification::new()),
            status: Arc::new(Mutex::new(Ok(()))),
            pending: Mutex::new(PendingState::default()),
            dispatched: AtomicBool::new(false),
        }
    }

    /// A run state for a partial run; every declared name starts pending.
    pub fn for_partial_run(step_id: i64, inputs: &[String], outputs: &[String]) -> Self {
        let state = Self::new(step_id);
        {
            let mut pending = state.pending.lock();
            pending.inputs = inputs.iter().map(|n| (n.clone(), false)).collect();
            pending.outputs = outputs.iter().map(|n| (n.clone(), false)).collect();
        }
        state
    }

    pub fn with_collector(mut self, collector: Option<Arc<StepStatsCollector>>) -> Self {
        self.collector = collector;
        self
    }

    pub fn rendezvous(&self) -> Arc<dyn Rendezvous> {
        self.rendezvous.clone()
    }

    /// Completion callback for the executor barrier: latches the first error
    /// and signals `executors_done`. Marks the state as having live executors.
    pub fn barrier_callback(&self) -> StatusCallback {
        self.dispatched.store(true, Ordering::SeqCst);
        let status = self.status.clone();
        let done = self.executors_done.clone();
        Box::new(move |result| {
            if result.is_err() {
                update_status(&mut status.lock(), result);
            }
            done.notify();
        })
    }

    pub fn status(&self) -> Result<()> {
        self.status.lock().clone()
    }

    pub fn update_status(&self, result: Result<()>) {
        update_status(&mut self.status.lock(), result);
    }

    pub fn pending(&self) -> parking_lot::MutexGuard<'_, PendingState> {
        self.pending.lock()
    }
}

impl Drop for RunState {
    fn drop(&mut self) {
        if self.dispatched.load(Ordering::SeqCst) && !self.executors_done.has_been_notified() {
            debug!(step_id = self.step_id, "aborting executors of an unfinished step");
            self.rendezvous
                .start_abort(SessionError::cancelled("PRun cancellation"));
            self.executors_done.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{create_key, ParsedKey};
    use std::thread;

    #[test]
    fn test_pending_done() {
        let state = RunState::for_partial_run(1, &["a:0".into()], &["y:0".into()]);
        assert!(!state.pending().done());
        state.pending().inputs.insert("a:0".into(), true);
        state.pending().outputs.insert("y:0".into(), true);
        assert!(state.pending().done());
    }

    #[test]
    fn test_barrier_callback_latches_first_error() {
        let state = RunState::new(1);
        state.barrier_callback()(Err(SessionError::internal("first")));
        assert!(state.executors_done.has_been_notified());
        state.update_status(Err(SessionError::internal("second")));
        assert_eq!(state.status().unwrap_err().message(), "first");
    }

    #[test]
    fn test_drop_aborts_and_waits_for_executors() {
        let state = RunState::new(1);
        let done = state.barrier_callback();
        let rendezvous = state.rendezvous();
        let key = ParsedKey::parse(&create_key("/device:CPU:0", 1, "/device:CPU:0", "x:0")).unwrap();
        let worker = thread::spawn(move || {
            // Blocks until the drop below aborts the rendezvous.
            let result = rendezvous.recv(&key, None);
            done(result.map(|_| ()));
        });
        drop(state);
        worker.join().unwrap();
    }
}
