//! Run handlers: many concurrent steps sharing a bounded set of threads.
//!
//! Each step gets a [`RunHandler`] with its own work queue. Workers take one
//! closure at a time from the queues in round-robin order, so a step with a
//! large burst of ready ops cannot starve the others and the total thread
//! count stays fixed no matter how many steps are in flight.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::thread_pool::default_num_threads;

type Work = Box<dyn FnOnce() + Send>;

struct HandlerQueue {
    work: VecDeque<Work>,
    retired: bool,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<u64, HandlerQueue>,
    next_handler: u64,
    cursor: u64,
    shutdown: bool,
}

impl State {
    /// Next closure in round-robin order, dropping retired queues that ran dry.
    fn pick(&mut self) -> Option<Work> {
        let order: Vec<u64> = self
            .queues
            .range(self.cursor..)
            .chain(self.queues.range(..self.cursor))
            .map(|(k, _)| *k)
            .collect();
        for key in order {
            let Some(queue) = self.queues.get_mut(&key) else {
                continue;
            };
            if let Some(work) = queue.work.pop_front() {
                self.cursor = key + 1;
                return Some(work);
            }
            if queue.retired {
                self.queues.remove(&key);
            }
        }
        None
    }
}

struct Shared {
    state: Mutex<State>,
    work_available: Condvar,
}

pub struct RunHandlerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl RunHandlerPool {
    /// `num_threads == 0` sizes the pool to the available parallelism.
    pub fn new(num_threads: usize) -> Result<Self> {
        let num_threads = if num_threads == 0 {
            default_num_threads()
        } else {
            num_threads
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work_available: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = shared.clone();
            match std::thread::Builder::new()
                .name(format!("run-handler-{}", i))
                .spawn(move || worker_loop(&shared))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(error = %e, "failed to spawn run handler thread"),
            }
        }
        if workers.is_empty() {
            return Err(SessionError::internal(
                "Could not start any run handler threads",
            ));
        }
        debug!(threads = workers.len(), "run handler pool started");
        Ok(RunHandlerPool { shared, workers })
    }

    /// A handler with a fresh queue. Dropping it retires the queue once drained.
    pub fn get(&self) -> RunHandler {
        let mut state = self.shared.state.lock();
        let id = state.next_handler;
        state.next_handler += 1;
        state.queues.insert(
            id,
            HandlerQueue {
                work: VecDeque::new(),
                retired: false,
            },
        );
        RunHandler {
            id,
            shared: self.shared.clone(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn active_handlers(&self) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .values()
            .filter(|q| !q.retired)
            .count()
    }
}

impl Drop for RunHandlerPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if let Some(work) = state.pick() {
            drop(state);
            work();
            state = shared.state.lock();
        } else if state.shutdown {
            return;
        } else {
            shared.work_available.wait(&mut state);
        }
    }
}

/// Per-step scheduling handle into a [`RunHandlerPool`].
pub struct RunHandler {
    id: u64,
    shared: Arc<Shared>,
}

impl RunHandler {
    pub fn schedule(&self, work: Box<dyn FnOnce() + Send>) {
        let mut state = self.shared.state.lock();
        match state.queues.get_mut(&self.id) {
            Some(queue) => queue.work.push_back(work),
            None => {
                state.queues.insert(
                    self.id,
                    HandlerQueue {
                        work: VecDeque::from([work]),
                        retired: false,
                    },
                );
            }
        }
        drop(state);
        self.shared.work_available.notify_one();
    }
}

impl Drop for RunHandler {
    fn drop(&mut self) {
        if let Some(queue) = self.shared.state.lock().queues.get_mut(&self.id) {
            queue.retired = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_handlers_share_threads() {
        let pool = RunHandlerPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        let handlers: Vec<RunHandler> = (0..5).map(|_| pool.get()).collect();
        assert_eq!(pool.active_handlers(), 5);
        for (i, h) in handlers.iter().enumerate() {
            for j in 0..3 {
                let tx = tx.clone();
                h.schedule(Box::new(move || {
                    let _ = tx.send((i, j));
                }));
            }
        }
        let mut got: Vec<(usize, i32)> = (0..15)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got.len(), 15);
        assert_eq!(got[0], (0, 0));
        drop(handlers);
        assert_eq!(pool.active_handlers(), 0);
    }

    #[test]
    fn test_round_robin_between_queues() {
        let mut state = State::default();
        for id in 0..2 {
            state.queues.insert(
                id,
                HandlerQueue {
                    work: VecDeque::new(),
                    retired: false,
                },
            );
        }
        let order = Arc::new(Mutex::new(Vec::new()));
        for (id, n) in [(0u64, 3), (1u64, 2)] {
            for _ in 0..n {
                let order = order.clone();
                if let Some(q) = state.queues.get_mut(&id) {
                    q.work.push_back(Box::new(move || order.lock().push(id)));
                }
            }
        }
        while let Some(work) = state.pick() {
            work();
        }
        assert_eq!(*order.lock(), vec![0, 1, 0, 1, 0]);
    }
}
