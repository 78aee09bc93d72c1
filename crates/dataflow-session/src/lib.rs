//! Local multi-device session runtime for dataflow graphs.
//!
//! A [`DirectSession`] owns a graph and runs steps over it on the devices of
//! the current process. Each distinct request signature is planned once:
//!
//! - **Planning**: rewrite for the request's feeds and fetches, prune, place,
//!   partition per device with `_Send`/`_Recv` pairs, optimize, and build one
//!   [`LocalExecutor`] per partition. Plans live in an [`ExecutorCache`].
//! - **Steps**: the run coordinator dispatches every partition onto an
//!   inter-op pool (or the caller's thread, or a [`RunHandlerPool`]), joins
//!   them through an [`ExecutorBarrier`], and enforces timeouts and
//!   cancellation.
//! - **Partial runs**: [`DirectSession::prun_setup`] and
//!   [`DirectSession::prun`] feed and fetch one step incrementally through
//!   its [`Rendezvous`].
//! - **Callables**: [`DirectSession::make_callable`] plans once and runs by
//!   handle with positional feeds.
//! - **Instrumentation**: step stats, a sampled cost model, partition graphs
//!   and debug tensor watches, reported through [`RunMetadata`] and a
//!   [`DebugSink`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use dataflow_ir::{DataType, GraphDef, NodeDef, Tensor};
//! use dataflow_session::{DeviceMgr, DirectSession, SessionConfig, SessionResources};
//!
//! # fn main() -> Result<(), dataflow_session::SessionError> {
//! let session = DirectSession::new(
//!     SessionConfig::default(),
//!     Arc::new(DeviceMgr::with_cpus(1)?),
//!     SessionResources::new(),
//! )?;
//! session.create(
//!     GraphDef::new()
//!         .with_node(NodeDef::placeholder("a", DataType::Float))
//!         .with_node(NodeDef::placeholder("b", DataType::Float))
//!         .with_node(NodeDef::binary("y", "Add", "a", "b")),
//! )?;
//! let out = session.run(
//!     &[("a", Tensor::scalar_f64(2.0)), ("b", Tensor::scalar_f64(3.0))],
//!     &["y"],
//!     &[],
//! )?;
//! assert_eq!(out[0].scalar_value_f64(), Some(5.0));
//! # Ok(())
//! # }
//! ```

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::type_complexity)]

pub mod barrier;
pub mod cache;
pub mod call_frame;
pub mod callable;
pub mod cancellation;
pub mod collective;
pub mod config;
mod coordinator;
pub mod cost_model;
pub mod debug;
pub mod device;
pub mod error;
pub mod executor;
pub mod executors_and_keys;
pub mod kernels;
pub mod local_executor;
#[cfg(feature = "structured-logging")]
pub mod logging;
pub mod notification;
mod partial_run;
mod planner;
pub mod rendezvous;
pub mod run_handler;
pub mod run_state;
pub mod session;
pub mod session_state;
pub mod step_stats;
pub mod thread_pool;

pub use barrier::ExecutorBarrier;
pub use cache::{cache_key, CacheStats, ExecutorCache};
pub use call_frame::{CallFrame, FunctionCallFrame, RunCallableCallFrame};
pub use callable::CallableHandle;
pub use cancellation::CancellationManager;
pub use collective::{CollectiveExecutor, CollectiveExecutorMgr};
pub use config::{
    DebugOptions, DebugTensorWatch, ExecutorPolicy, GraphOptions, OptimizerConfig,
    RunHandlerOptions, RunMetadata, RunOptions, SessionConfig, ThreadPoolOptions, TraceLevel,
};
pub use cost_model::{CostGraph, CostModelManager, CostNode};
pub use debug::{DebugEvent, DebugSink, InMemoryDebugSink};
pub use device::{Device, DeviceAttributes, DeviceMgr, LocalDevice};
pub use error::{ErrorCode, Result, SessionError};
pub use executor::{Executor, ExecutorArgs, Runner};
pub use executors_and_keys::{CallableOptions, ExecutorsAndKeys, PerPartitionExecutorsAndLib};
pub use kernels::{
    AsyncOpKernel, Kernel, KernelDone, KernelOutputs, KernelRegistry, NodeInfo, OpKernel,
    OpKernelContext, OpSegment,
};
pub use local_executor::LocalExecutor;
pub use notification::Notification;
pub use rendezvous::{create_key, LocalRendezvous, ParsedKey, Rendezvous, RendezvousValue};
pub use run_handler::{RunHandler, RunHandlerPool};
pub use session::DirectSession;
pub use session_state::{SessionState, StepContainer, TensorStore};
pub use step_stats::{NodeExecStats, StepStats, StepStatsCollector};
pub use thread_pool::{SessionResources, ThreadPool};
