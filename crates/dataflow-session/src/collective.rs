//! In-process collectives.
//!
//! Participants of one collective instance are ops in the same step that
//! share an `instance_key`. The step's [`CollectiveExecutor`] gathers their
//! inputs and completes all of them once the group is full.

use std::collections::HashMap;
use std::sync::Arc;

use dataflow_ir::{binary_op, BinaryOp, Tensor};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SessionError};

pub type CollectiveDone = Box<dyn FnOnce(Result<Tensor>) + Send>;

struct Instance {
    group_size: usize,
    contributions: Vec<Tensor>,
    waiters: Vec<CollectiveDone>,
}

#[derive(Default)]
struct State {
    instances: HashMap<i64, Instance>,
    aborted: Option<SessionError>,
}

pub struct CollectiveExecutor {
    step_id: i64,
    state: Mutex<State>,
}

impl CollectiveExecutor {
    pub fn new(step_id: i64) -> Self {
        CollectiveExecutor {
            step_id,
            state: Mutex::new(State::default()),
        }
    }

    pub fn step_id(&self) -> i64 {
        self.step_id
    }

    /// Contributes `input` to the sum-reduction `instance_key`. `done` receives
    /// the sum once all `group_size` participants have contributed.
    pub fn reduce(&self, instance_key: i64, group_size: usize, input: Tensor, done: CollectiveDone) {
        let ready = {
            let mut state = self.state.lock();
            if let Some(status) = state.aborted.clone() {
                drop(state);
                done(Err(status));
                return;
            }
            let instance = state.instances.entry(instance_key).or_insert_with(|| Instance {
                group_size,
                contributions: Vec::with_capacity(group_size),
                waiters: Vec::with_capacity(group_size),
            });
            if instance.group_size != group_size {
                let expected = instance.group_size;
                drop(state);
                done(Err(SessionError::invalid_argument(format!(
                    "Collective instance {} has group_size {} but a participant declared {}",
                    instance_key, expected, group_size
                ))));
                return;
            }
            instance.contributions.push(input);
            instance.waiters.push(done);
            if instance.contributions.len() < instance.group_size {
                None
            } else {
                state.instances.remove(&instance_key)
            }
        };
        if let Some(instance) = ready {
            debug!(step_id = self.step_id, instance_key, "collective reduce complete");
            let result = sum(&instance.contributions);
            for waiter in instance.waiters {
                waiter(result.clone());
            }
        }
    }

    /// Fails every waiting participant and any later ones.
    pub fn start_abort(&self, status: SessionError) {
        let waiters: Vec<CollectiveDone> = {
            let mut state = self.state.lock();
            if state.aborted.is_some() {
                return;
            }
            state.aborted = Some(status.clone());
            state
                .instances
                .drain()
                .flat_map(|(_, i)| i.waiters)
                .collect()
        };
        for waiter in waiters {
            waiter(Err(status.clone()));
        }
    }
}

fn sum(values: &[Tensor]) -> Result<Tensor> {
    let mut iter = values.iter();
    let first = iter
        .next()
        .cloned()
        .ok_or_else(|| SessionError::internal("Collective with no participants"))?;
    iter.try_fold(first, |acc, t| {
        binary_op(BinaryOp::Add, &acc, t).map_err(SessionError::from)
    })
}

/// Hands out one collective executor per step, built lazily.
#[derive(Default)]
pub struct CollectiveExecutorMgr {
    executors: Mutex<HashMap<i64, Arc<CollectiveExecutor>>>,
}

impl CollectiveExecutorMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_or_create(&self, step_id: i64) -> Arc<CollectiveExecutor> {
        self.executors
            .lock()
            .entry(step_id)
            .or_insert_with(|| Arc::new(CollectiveExecutor::new(step_id)))
            .clone()
    }

    pub fn cleanup(&self, step_id: i64) {
        self.executors.lock().remove(&step_id);
    }

    pub fn num_live_steps(&self) -> usize {
        self.executors.lock().len()
    }
}

/// Releases the step's collective executor when dropped.
pub struct CollectiveHandle {
    mgr: Arc<CollectiveExecutorMgr>,
    executor: Arc<CollectiveExecutor>,
}

impl CollectiveHandle {
    pub fn new(mgr: Arc<CollectiveExecutorMgr>, step_id: i64) -> Self {
        let executor = mgr.find_or_create(step_id);
        CollectiveHandle { mgr, executor }
    }

    pub fn executor(&self) -> &Arc<CollectiveExecutor> {
        &self.executor
    }
}

impl Drop for CollectiveHandle {
    fn drop(&mut self) {
        self.mgr.cleanup(self.executor.step_id());
    }
}
