//! The executor abstraction the run coordinator dispatches partitions to.

use std::sync::Arc;

use crate::barrier::StatusCallback;
use crate::call_frame::CallFrame;
use crate::cancellation::CancellationManager;
use crate::collective::CollectiveExecutor;
use crate::debug::DebugSink;
use crate::error::Result;
use crate::notification::Notification;
use crate::rendezvous::Rendezvous;
use crate::session_state::{SessionState, StepContainer, TensorStore};
use crate::step_stats::StepStatsCollector;

pub type Closure = Box<dyn FnOnce() + Send>;

/// Schedules a closure somewhere: inline, on a pool, or on a run handler.
pub type Runner = Arc<dyn Fn(Closure) + Send + Sync>;

pub type DoneCallback = StatusCallback;

/// Everything a partition executor borrows from its step.
#[derive(Clone)]
pub struct ExecutorArgs {
    pub step_id: i64,
    pub rendezvous: Arc<dyn Rendezvous>,
    pub call_frame: Option<Arc<dyn CallFrame>>,
    pub cancellation: Arc<CancellationManager>,
    pub runner: Runner,
    pub session_state: Arc<SessionState>,
    pub tensor_store: Arc<TensorStore>,
    pub step_container: Arc<StepContainer>,
    pub stats_collector: Option<Arc<StepStatsCollector>>,
    pub collective_executor: Option<Arc<CollectiveExecutor>>,
    pub debug_sink: Option<Arc<dyn DebugSink>>,
}

pub fn inline_runner() -> Runner {
    Arc::new(|work: Closure| work())
}

pub trait Executor: Send + Sync {
    /// Starts the partition and returns; `done` is called exactly once when
    /// every op has finished or the step has failed.
    fn run_async(&self, args: ExecutorArgs, done: DoneCallback);

    /// Runs to completion on the calling thread's behalf.
    fn run(&self, args: ExecutorArgs) -> Result<()> {
        let finished = Arc::new(Notification::new());
        let status = Arc::new(parking_lot::Mutex::new(Ok(())));
        let (f, s) = (finished.clone(), status.clone());
        self.run_async(
            args,
            Box::new(move |result| {
                *s.lock() = result;
                f.notify();
            }),
        );
        finished.wait();
        let result = status.lock().clone();
        result
    }
}
