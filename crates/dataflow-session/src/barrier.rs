//! Join point for the partition executors of one step.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, SessionError};
use crate::rendezvous::Rendezvous;

pub type StatusCallback = Box<dyn FnOnce(Result<()>) + Send>;

struct State {
    pending: usize,
    status: Result<()>,
    done: Option<StatusCallback>,
}

/// Counts down `n` executor completions and then calls `done` exactly once
/// with the first error reported, or `Ok`. The first error also aborts the
/// step's rendezvous so the other partitions stop waiting on transfers.
#[derive(Clone)]
pub struct ExecutorBarrier {
    state: Arc<Mutex<State>>,
    rendezvous: Arc<dyn Rendezvous>,
}

impl ExecutorBarrier {
    pub fn new(n: usize, rendezvous: Arc<dyn Rendezvous>, done: StatusCallback) -> Self {
        let barrier = ExecutorBarrier {
            state: Arc::new(Mutex::new(State {
                pending: n,
                status: Ok(()),
                done: Some(done),
            })),
            rendezvous,
        };
        if n == 0 {
            barrier.fire();
        }
        barrier
    }

    /// Completion callback for one executor.
    pub fn get(&self) -> StatusCallback {
        let barrier = self.clone();
        Box::new(move |status| barrier.when_done(status))
    }

    fn when_done(&self, status: Result<()>) {
        let abort = {
            let mut state = self.state.lock();
            let first_error = match (&state.status, &status) {
                (Ok(()), Err(e)) => Some(e.clone()),
                _ => None,
            };
            if let Some(e) = &first_error {
                state.status = Err(e.clone());
            }
            state.pending = state.pending.saturating_sub(1);
            first_error
        };
        if let Some(e) = abort {
            self.rendezvous.start_abort(e);
        }
        self.fire();
    }

    fn fire(&self) {
        let ready = {
            let mut state = self.state.lock();
            if state.pending > 0 {
                return;
            }
            let status = state.status.clone();
            state.done.take().map(|done| (done, status))
        };
        if let Some((done, status)) = ready {
            done(status);
        }
    }
}

impl std::fmt::Debug for ExecutorBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ExecutorBarrier")
            .field("pending", &state.pending)
            .field("failed", &state.status.as_ref().err().map(SessionError::message))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::LocalRendezvous;

    fn collect() -> (StatusCallback, Arc<Mutex<Vec<Result<()>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        (Box::new(move |s| c.lock().push(s)), calls)
    }

    #[test]
    fn test_fires_once_after_all() {
        let (done, calls) = collect();
        let barrier = ExecutorBarrier::new(3, Arc::new(LocalRendezvous::new()), done);
        let cbs: Vec<_> = (0..3).map(|_| barrier.get()).collect();
        let mut cbs = cbs.into_iter();
        cbs.next().unwrap()(Ok(()));
        cbs.next().unwrap()(Ok(()));
        assert!(calls.lock().is_empty());
        cbs.next().unwrap()(Ok(()));
        assert_eq!(*calls.lock(), vec![Ok(())]);
    }

    #[test]
    fn test_first_error_wins_and_aborts() {
        let (done, calls) = collect();
        let rendezvous = Arc::new(LocalRendezvous::new());
        let barrier = ExecutorBarrier::new(2, rendezvous.clone(), done);
        barrier.get()(Err(SessionError::internal("first")));
        assert!(rendezvous.status().is_err());
        barrier.get()(Err(SessionError::cancelled("second")));
        assert_eq!(*calls.lock(), vec![Err(SessionError::internal("first"))]);
    }

    #[test]
    fn test_zero_executors_fire_immediately() {
        let (done, calls) = collect();
        let _barrier = ExecutorBarrier::new(0, Arc::new(LocalRendezvous::new()), done);
        assert_eq!(calls.lock().len(), 1);
    }
}
