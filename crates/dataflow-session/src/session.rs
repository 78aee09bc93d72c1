//! [`DirectSession`]: runs a graph on the devices of this process.
//!
//! The session owns the graph state, the plan cache, the partial-run table
//! and the callable table, each behind its own lock so unrelated steps never
//! serialize on one another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dataflow_ir::{GraphDef, OpRegistry, Tensor};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStats, ExecutorCache};
use crate::call_frame::{CallFrame, FunctionCallFrame};
use crate::callable::Callables;
use crate::cancellation::CancellationManager;
use crate::collective::CollectiveExecutorMgr;
use crate::config::{ExecutorPolicy, RunMetadata, RunOptions, SessionConfig};
use crate::cost_model::CostModelManager;
use crate::debug::DebugSink;
use crate::device::{DeviceAttributes, DeviceMgr};
use crate::error::{ErrorCode, Result, SessionError};
use crate::executors_and_keys::{CallableOptions, ExecutorsAndKeys};
use crate::kernels::{KernelRegistry, OpSegment};
use crate::planner::{create_executors, GraphExecutionState, PlanContext};
use crate::run_state::RunState;
use crate::session_state::{resource_handle_to_input_tensor, SessionState};
use crate::thread_pool::{SessionResources, ThreadPool};

static STEP_ID_COUNTER: AtomicI64 = AtomicI64::new(1);

/// Step ids are unique within the process.
pub(crate) fn next_step_id() -> i64 {
    STEP_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

pub struct DirectSession {
    pub(crate) config: SessionConfig,
    pub(crate) device_mgr: Arc<DeviceMgr>,
    pub(crate) resources: Arc<SessionResources>,
    pub(crate) ops: Arc<OpRegistry>,
    pub(crate) kernels: KernelRegistry,
    pub(crate) op_segment: OpSegment,
    pub(crate) thread_pools: Vec<Arc<ThreadPool>>,
    pub(crate) run_in_caller_thread: bool,
    pub(crate) operation_timeout_ms: u64,

    pub(crate) execution_state: Mutex<Option<GraphExecutionState>>,
    pub(crate) executors: ExecutorCache<ExecutorsAndKeys>,
    pub(crate) partial_runs: Mutex<HashMap<String, Arc<RunState>>>,
    pub(crate) callables: RwLock<Callables>,

    pub(crate) cancellation_manager: Arc<CancellationManager>,
    pub(crate) closed: Mutex<bool>,
    pub(crate) handle_name_counter: AtomicU64,
    pub(crate) edge_name_counter: AtomicU64,
    pub(crate) graph_id_counter: AtomicU64,

    pub(crate) collective_executor_mgr: Mutex<Option<Arc<CollectiveExecutorMgr>>>,
    pub(crate) cost_model_manager: CostModelManager,
    pub(crate) session_state: Arc<SessionState>,
    pub(crate) debug_sink: RwLock<Option<Arc<dyn DebugSink>>>,
}

impl DirectSession {
    pub fn new(
        config: SessionConfig,
        device_mgr: Arc<DeviceMgr>,
        resources: Arc<SessionResources>,
    ) -> Result<Self> {
        Self::with_registries(
            config,
            device_mgr,
            resources,
            OpRegistry::with_builtins(),
            KernelRegistry::with_builtins(),
        )
    }

    /// A session whose graphs may use the ops in `ops`, run by the kernels in `kernels`.
    pub fn with_registries(
        config: SessionConfig,
        device_mgr: Arc<DeviceMgr>,
        resources: Arc<SessionResources>,
        ops: OpRegistry,
        kernels: KernelRegistry,
    ) -> Result<Self> {
        let thread_pools = build_thread_pools(&config, &resources)?;
        let run_in_caller_thread =
            config.executor_policy == ExecutorPolicy::Inline || config.inter_op_parallelism_threads < 0;
        if config.log_device_placement {
            let mapping: Vec<String> = device_mgr
                .list_devices()
                .iter()
                .map(|d| format!("{} -> {}", d.name(), d.attributes().device_type))
                .collect();
            info!("Device mapping:\n{}", mapping.join("\n"));
        }
        debug!(
            pools = thread_pools.len(),
            run_in_caller_thread,
            devices = device_mgr.len(),
            "created session"
        );
        Ok(DirectSession {
            operation_timeout_ms: config.operation_timeout_ms,
            config,
            device_mgr,
            resources,
            ops: Arc::new(ops),
            kernels,
            op_segment: OpSegment::new(),
            thread_pools,
            run_in_caller_thread,
            execution_state: Mutex::new(None),
            executors: ExecutorCache::new(),
            partial_runs: Mutex::new(HashMap::new()),
            callables: RwLock::new(Callables::default()),
            cancellation_manager: Arc::new(CancellationManager::new()),
            closed: Mutex::new(false),
            handle_name_counter: AtomicU64::new(0),
            edge_name_counter: AtomicU64::new(0),
            graph_id_counter: AtomicU64::new(0),
            collective_executor_mgr: Mutex::new(None),
            cost_model_manager: CostModelManager::new(),
            session_state: Arc::new(SessionState::new()),
            debug_sink: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_state(&self) -> &Arc<SessionState> {
        &self.session_state
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.executors.stats()
    }

    pub fn num_partial_runs(&self) -> usize {
        self.partial_runs.lock().len()
    }

    pub fn set_debug_sink(&self, sink: Arc<dyn DebugSink>) {
        *self.debug_sink.write() = Some(sink);
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceAttributes>> {
        self.check_not_closed()?;
        Ok(self
            .device_mgr
            .list_devices()
            .iter()
            .map(|d| d.attributes().clone())
            .collect())
    }

    pub fn create(&self, graph: GraphDef) -> Result<()> {
        self.check_not_closed()?;
        if graph.nodes.is_empty() {
            return Ok(());
        }
        let mut state = self.execution_state.lock();
        if state.is_some() {
            return Err(SessionError::AlreadyExists(
                "A Graph has already been created for this session.".into(),
            ));
        }
        *state = Some(GraphExecutionState::new(
            graph,
            self.ops.clone(),
            &self.device_mgr,
            &self.config,
        )?);
        Ok(())
    }

    pub fn extend(&self, graph: GraphDef) -> Result<()> {
        self.check_not_closed()?;
        let mut state = self.execution_state.lock();
        let next = match state.as_ref() {
            Some(current) => current.extend(&graph, &self.device_mgr, &self.config)?,
            None => GraphExecutionState::new(graph, self.ops.clone(), &self.device_mgr, &self.config)?,
        };
        *state = Some(next);
        Ok(())
    }

    /// Cancels every in-flight step. Later calls fail with `Cancelled`.
    pub fn close(&self) -> Result<()> {
        self.cancellation_manager.start_cancel();
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            info!("session closed");
        }
        Ok(())
    }

    pub(crate) fn check_not_closed(&self) -> Result<()> {
        if *self.closed.lock() {
            return Err(SessionError::cancelled("Session has been closed."));
        }
        Ok(())
    }

    pub(crate) fn check_graph_created(&self, method: &str) -> Result<()> {
        if self.execution_state.lock().is_none() {
            return Err(SessionError::FailedPrecondition(format!(
                "Session was not created with a graph before {}!",
                method
            )));
        }
        Ok(())
    }

    pub fn run(&self, feeds: &[(&str, Tensor)], fetches: &[&str], targets: &[&str]) -> Result<Vec<Tensor>> {
        self.run_with_options(&RunOptions::default(), feeds, fetches, targets)
            .map(|(outputs, _)| outputs)
    }

    pub fn run_with_options(
        &self,
        run_options: &RunOptions,
        feeds: &[(&str, Tensor)],
        fetches: &[&str],
        targets: &[&str],
    ) -> Result<(Vec<Tensor>, RunMetadata)> {
        self.check_not_closed()?;
        self.check_graph_created("Run()")?;

        let input_names: Vec<String> = feeds.iter().map(|(n, _)| n.to_string()).collect();
        let output_names = to_strings(fetches);
        let target_names = to_strings(targets);
        let ek = self
            .get_or_create_executors(&input_names, &output_names, &target_names, false, run_options)?
            .value;

        let call_frame = Arc::new(FunctionCallFrame::new(
            ek.input_types.clone(),
            ek.output_types.clone(),
        ));
        let mut feed_args: Vec<Option<Tensor>> = vec![None; feeds.len()];
        for (name, tensor) in feeds {
            let index = *ek.input_name_to_index.get(*name).ok_or_else(|| {
                SessionError::internal(format!("'{}' is not a pre-defined feed.", name))
            })?;
            feed_args[index] = Some(if tensor.dtype() == dataflow_ir::DataType::Resource {
                resource_handle_to_input_tensor(&self.session_state, tensor)?
            } else {
                tensor.clone()
            });
        }
        let feed_args: Vec<Tensor> = feed_args.into_iter().flatten().collect();
        call_frame.set_args(feed_args).map_err(internal_to_invalid_argument)?;

        let step_id = next_step_id();
        let mut metadata = RunMetadata::default();
        let frame: Arc<dyn CallFrame> = call_frame.clone();
        self.run_internal(step_id, run_options, Some(frame), &ek, &mut metadata)?;

        let retvals = call_frame.consume_retvals().map_err(internal_to_invalid_argument)?;
        let mut outputs = Vec::with_capacity(output_names.len());
        for name in &output_names {
            let index = *ek.output_name_to_index.get(name).ok_or_else(|| {
                SessionError::internal(format!("'{}' is not a pre-defined fetch.", name))
            })?;
            outputs.push(retvals[index].clone());
        }
        Ok((outputs, metadata))
    }

    /// Returns the plan for a request, building and caching it on a miss.
    pub(crate) fn get_or_create_executors(
        &self,
        feeds: &[String],
        fetches: &[String],
        targets: &[String],
        is_partial_run: bool,
        run_options: &RunOptions,
    ) -> Result<CacheEntry<ExecutorsAndKeys>> {
        let debug_summary = if run_options.debug_options.is_empty() {
            String::new()
        } else {
            run_options.debug_options.summary()
        };
        self.executors.get_or_create(
            feeds,
            fetches,
            targets,
            is_partial_run,
            &debug_summary,
            |feeds, fetches, targets| {
                let mut options = CallableOptions::new(feeds.iter(), fetches.iter(), targets.iter());
                options.run_options.debug_options = run_options.debug_options.clone();
                options.run_options.collective_graph_key = run_options.collective_graph_key;
                self.create_executors(options, is_partial_run)
            },
        )
    }

    pub(crate) fn create_executors(
        &self,
        options: CallableOptions,
        is_partial_run: bool,
    ) -> Result<ExecutorsAndKeys> {
        let client_graphs = {
            let mut state = self.execution_state.lock();
            let state = state.as_mut().ok_or_else(|| {
                SessionError::FailedPrecondition("Session has no graph".into())
            })?;
            state.build_graphs(
                &options,
                is_partial_run,
                &self.device_mgr,
                &self.config,
                &self.edge_name_counter,
            )?
        };
        let ctx = PlanContext {
            devices: &self.device_mgr,
            config: &self.config,
            kernels: &self.kernels,
            op_segment: &self.op_segment,
            debug_sink: self.debug_sink.read().clone(),
            graph_id_counter: &self.graph_id_counter,
        };
        create_executors(&ctx, client_graphs, options, is_partial_run)
    }
}

impl Drop for DirectSession {
    fn drop(&mut self) {
        let _ = self.close();
        // Dropping a run state aborts its rendezvous and joins its executors.
        let partial_runs = std::mem::take(&mut *self.partial_runs.lock());
        drop(partial_runs);
        self.callables.write().clear();
    }
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn internal_to_invalid_argument(e: SessionError) -> SessionError {
    if e.code() == ErrorCode::Internal {
        SessionError::InvalidArgument(e.message().to_string())
    } else {
        e
    }
}

fn build_thread_pools(
    config: &SessionConfig,
    resources: &SessionResources,
) -> Result<Vec<Arc<ThreadPool>>> {
    let inter_op = usize::try_from(config.inter_op_parallelism_threads).unwrap_or(0);
    if !config.session_inter_op_thread_pools.is_empty() {
        let mut pools = Vec::with_capacity(config.session_inter_op_thread_pools.len());
        for (i, options) in config.session_inter_op_thread_pools.iter().enumerate() {
            let pool = match &options.global_name {
                Some(name) => resources.named_pool(name, options.num_threads)?,
                None => Arc::new(ThreadPool::new(format!("Compute{}", i), options.num_threads)?),
            };
            pools.push(pool);
        }
        Ok(pools)
    } else if config.use_per_session_threads {
        Ok(vec![Arc::new(ThreadPool::new("Compute", inter_op)?)])
    } else {
        Ok(vec![resources.global_pool(inter_op)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadPoolOptions;
    use dataflow_ir::{DataType, NodeDef};

    fn session(config: SessionConfig) -> DirectSession {
        DirectSession::new(
            config,
            Arc::new(DeviceMgr::with_cpus(1).unwrap()),
            SessionResources::new(),
        )
        .unwrap()
    }

    fn add_graph() -> GraphDef {
        GraphDef::new()
            .with_node(NodeDef::placeholder("a", DataType::Float))
            .with_node(NodeDef::placeholder("b", DataType::Float))
            .with_node(NodeDef::binary("y", "Add", "a", "b"))
    }

    #[test]
    fn test_thread_pool_selection() {
        let s = session(SessionConfig {
            session_inter_op_thread_pools: vec![
                ThreadPoolOptions {
                    num_threads: 1,
                    global_name: None,
                },
                ThreadPoolOptions {
                    num_threads: 2,
                    global_name: Some("shared".into()),
                },
            ],
            ..Default::default()
        });
        assert_eq!(s.thread_pools.len(), 2);
        assert_eq!(s.thread_pools[0].name(), "Compute0");
        assert!(!s.run_in_caller_thread);

        let inline = session(SessionConfig {
            inter_op_parallelism_threads: -1,
            ..Default::default()
        });
        assert!(inline.run_in_caller_thread);
    }

    #[test]
    fn test_graph_lifecycle_errors() {
        let s = session(SessionConfig::default());
        let err = s.run(&[], &["y"], &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);

        s.create(add_graph()).unwrap();
        let err = s.create(add_graph()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);

        s.close().unwrap();
        s.close().unwrap();
        let err = s.run(&[], &["y"], &[]).unwrap_err();
        assert_eq!(err, SessionError::cancelled("Session has been closed."));
        assert!(s.list_devices().is_err());
    }

    #[test]
    fn test_run_add() {
        let s = session(SessionConfig::default());
        s.create(add_graph()).unwrap();
        let out = s
            .run(
                &[("a", Tensor::scalar_f64(2.0)), ("b", Tensor::scalar_f64(3.0))],
                &["y", "y:0"],
                &[],
            )
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].scalar_value_f64(), Some(5.0));
        assert_eq!(out[1].scalar_value_f64(), Some(5.0));
    }

    #[test]
    fn test_duplicate_feed_is_invalid() {
        let s = session(SessionConfig::default());
        s.create(add_graph()).unwrap();
        let err = s
            .run(
                &[("a", Tensor::scalar_f64(2.0)), ("a", Tensor::scalar_f64(3.0))],
                &["y"],
                &[],
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
