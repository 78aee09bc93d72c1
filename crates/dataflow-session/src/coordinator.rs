//! Drives one step of a cached plan across its partitions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::call_frame::CallFrame;
use crate::cancellation::CancellationManager;
use crate::collective::{CollectiveExecutorMgr, CollectiveHandle};
use crate::config::{RunMetadata, RunOptions, TraceLevel};
use crate::error::{Result, SessionError};
use crate::executor::{inline_runner, Closure, ExecutorArgs, Runner};
use crate::barrier::ExecutorBarrier;
use crate::executors_and_keys::ExecutorsAndKeys;
use crate::run_state::RunState;
use crate::session::DirectSession;
use crate::step_stats::StepStatsCollector;

/// Smallest of the nonzero timeouts, `None` when both are zero.
pub(crate) fn step_timeout(run_timeout_ms: u64, operation_timeout_ms: u64) -> Option<Duration> {
    [run_timeout_ms, operation_timeout_ms]
        .into_iter()
        .filter(|ms| *ms > 0)
        .min()
        .map(Duration::from_millis)
}

/// Whether the cost model samples the step whose pre-increment count is `step_count`.
pub(crate) fn cost_model_due(every: i64, after: i64, step_count: i64) -> bool {
    if every <= 0 {
        return false;
    }
    let measure = step_count - after;
    measure >= 0 && (measure + 1) % every == 0
}

impl DirectSession {
    fn should_use_run_handler_pool(&self, run_options: &RunOptions) -> bool {
        if self.config.use_per_session_threads {
            return false;
        }
        if !self.config.session_inter_op_thread_pools.is_empty()
            && run_options.inter_op_thread_pool > 0
        {
            return false;
        }
        true
    }

    fn collective_executor_mgr(&self) -> Arc<CollectiveExecutorMgr> {
        self.collective_executor_mgr
            .lock()
            .get_or_insert_with(|| Arc::new(CollectiveExecutorMgr::new()))
            .clone()
    }

    /// Runs every partition of `ek` for one step and waits for them.
    pub(crate) fn run_internal(
        &self,
        step_id: i64,
        run_options: &RunOptions,
        call_frame: Option<Arc<dyn CallFrame>>,
        ek: &ExecutorsAndKeys,
        metadata: &mut RunMetadata,
    ) -> Result<()> {
        let step_count = ek.next_step();
        let graph_options = &self.config.graph_options;
        let update_cost_model = cost_model_due(
            graph_options.build_cost_model,
            graph_options.build_cost_model_after,
            step_count,
        );
        let do_trace = run_options.trace_level > TraceLevel::NoTrace;
        let collector = (do_trace || update_cost_model).then(|| Arc::new(StepStatsCollector::new()));
        let run_state = RunState::new(step_id).with_collector(collector.clone());

        let mut collective_handle = None;
        if ek.collective_graph_key != 0 {
            if run_options.collective_graph_key != 0
                && run_options.collective_graph_key != ek.collective_graph_key
            {
                return Err(SessionError::internal(format!(
                    "collective_graph_key in RunOptions {} should match collective_graph_key from optimized graph {}",
                    run_options.collective_graph_key, ek.collective_graph_key
                )));
            }
            collective_handle = Some(CollectiveHandle::new(self.collective_executor_mgr(), step_id));
        }

        let num_executors = ek.items.len();
        let barrier = ExecutorBarrier::new(
            num_executors,
            run_state.rendezvous(),
            run_state.barrier_callback(),
        );

        let pool_index = run_options.inter_op_thread_pool;
        if pool_index < -1 || pool_index >= self.thread_pools.len() as i32 {
            run_state.executors_done.notify();
            return Err(SessionError::invalid_argument(format!(
                "Invalid inter_op_thread_pool: {}",
                pool_index
            )));
        }

        let step_cancellation = Arc::new(CancellationManager::new());
        let token = self.cancellation_manager.get_cancellation_token();
        let cancel_step = step_cancellation.clone();
        if !self
            .cancellation_manager
            .register_callback(token, Box::new(move || cancel_step.start_cancel()))
        {
            run_state.executors_done.notify();
            return Err(SessionError::cancelled("Run call was cancelled"));
        }

        let pool = if self.run_in_caller_thread {
            None
        } else if pool_index >= 0 {
            Some(self.thread_pools[pool_index as usize].clone())
        } else {
            None
        };
        let pool = match pool {
            None if num_executors > 1 => self.thread_pools.first().cloned(),
            other => other,
        };

        let handler = if pool.is_some()
            && run_options.use_run_handler_pool
            && self.should_use_run_handler_pool(run_options)
        {
            let handler_pool = match self
                .resources
                .run_handler_pool(self.config.run_handler.num_threads)
            {
                Ok(handler_pool) => handler_pool,
                Err(e) => {
                    self.cancellation_manager.deregister_callback(token);
                    run_state.executors_done.notify();
                    return Err(e);
                }
            };
            debug!(step_id, "scheduling step on the run handler pool");
            Some(Arc::new(handler_pool.get()))
        } else {
            None
        };

        let default_runner: Runner = match (&pool, handler) {
            (None, _) => inline_runner(),
            (Some(_), Some(handler)) => Arc::new(move |work: Closure| handler.schedule(work)),
            (Some(pool), None) => {
                let pool = pool.clone();
                Arc::new(move |work: Closure| pool.schedule(work))
            }
        };

        let args = ExecutorArgs {
            step_id,
            rendezvous: run_state.rendezvous(),
            call_frame,
            cancellation: step_cancellation.clone(),
            runner: default_runner.clone(),
            session_state: self.session_state.clone(),
            tensor_store: run_state.tensor_store.clone(),
            step_container: run_state.step_container.clone(),
            stats_collector: collector.clone(),
            collective_executor: collective_handle.as_ref().map(|h| h.executor().clone()),
            debug_sink: self.debug_sink.read().clone(),
        };

        debug!(step_id, partitions = num_executors, "starting step");
        for item in &ek.items {
            let mut item_args = args.clone();
            if let Some(device_pool) = item.device.thread_pool() {
                item_args.runner = Arc::new(move |work: Closure| device_pool.schedule(work));
            }
            item.executor.run_async(item_args, barrier.get());
        }
        drop(args);

        match step_timeout(run_options.timeout_ms, self.operation_timeout_ms) {
            Some(timeout) => {
                if !run_state.executors_done.wait_for_timeout(timeout) {
                    warn!(step_id, timeout_ms = timeout.as_millis() as u64, "step timed out");
                    run_state.update_status(Err(SessionError::deadline_exceeded(
                        "Timed out waiting for notification",
                    )));
                    step_cancellation.start_cancel();
                    run_state.executors_done.wait();
                }
            }
            None => run_state.executors_done.wait(),
        }

        if !self.cancellation_manager.deregister_callback(token) {
            run_state.update_status(Err(SessionError::cancelled("Run call was cancelled")));
        }
        drop(collective_handle);

        run_state.status()?;

        run_state
            .tensor_store
            .save_tensors(&ek.callable_options.fetches, &self.session_state)?;

        if let Some(collector) = &collector {
            if do_trace {
                metadata.step_stats = Some(collector.finalize());
            }
            if update_cost_model {
                let mut partitions = Vec::with_capacity(num_executors);
                for item in &ek.items {
                    self.cost_model_manager.update(
                        item.device_name(),
                        item.graph_id,
                        &collector.device_stats(item.device_name()),
                    );
                    partitions.push((item.device_name().to_string(), item.graph_id));
                }
                metadata.cost_graph = Some(self.cost_model_manager.cost_graph(&partitions));
            }
        }

        if run_options.output_partition_graphs {
            metadata.partition_graphs = ek.items.iter().map(|item| item.graph_def()).collect();
        }
        Ok(())
    }
}
