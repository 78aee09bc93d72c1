//! Session and per-run configuration.
//!
//! [`SessionConfig`] is fixed when a session is constructed and can be read
//! from a TOML file. [`RunOptions`] travel with each step, and
//! [`RunMetadata`] is what a step reports back.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use dataflow_ir::{GraphDef, OptimizerOptions};
use serde::{Deserialize, Serialize};

use crate::cost_model::CostGraph;
use crate::step_stats::StepStats;

/// One inter-op pool a session schedules onto.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolOptions {
    /// 0 picks the machine's available parallelism.
    pub num_threads: usize,
    /// Pools with a global name are shared by every session that names them.
    pub global_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorPolicy {
    #[default]
    Normal,
    /// Run every step on the calling thread.
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub do_constant_folding: bool,
    pub do_identity_elimination: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            do_constant_folding: true,
            do_identity_elimination: true,
        }
    }
}

impl From<OptimizerConfig> for OptimizerOptions {
    fn from(c: OptimizerConfig) -> Self {
        OptimizerOptions {
            do_constant_folding: c.do_constant_folding,
            do_identity_elimination: c.do_identity_elimination,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphOptions {
    /// Place only the pruned graph of each request instead of the whole base graph once.
    pub place_pruned_graph: bool,
    /// Sample the cost model every N steps of an executor set (0 disables it).
    pub build_cost_model: i64,
    /// Steps to skip before the first cost model sample.
    pub build_cost_model_after: i64,
    pub optimizer: OptimizerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunHandlerOptions {
    /// Worker threads of the shared run handler pool. 0 picks available parallelism.
    pub num_threads: usize,
}

/// Options fixed for the lifetime of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 0 picks a default size; a negative value runs steps on the caller thread.
    pub inter_op_parallelism_threads: i32,
    pub intra_op_parallelism_threads: i32,
    pub use_per_session_threads: bool,
    pub session_inter_op_thread_pools: Vec<ThreadPoolOptions>,
    /// Upper bound on how long a step may run, 0 for none.
    pub operation_timeout_ms: u64,
    pub executor_policy: ExecutorPolicy,
    pub log_device_placement: bool,
    pub graph_options: GraphOptions,
    pub run_handler: RunHandlerOptions,
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read session config: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse session config: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid session configuration")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize session config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write session config: {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TraceLevel {
    #[default]
    NoTrace,
    SoftwareTrace,
    FullTrace,
}

/// Asks for the value of `node_name:output_slot` to be published on every step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugTensorWatch {
    pub node_name: String,
    pub output_slot: usize,
    pub debug_ops: Vec<String>,
    pub debug_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub watches: Vec<DebugTensorWatch>,
    pub global_step: i64,
}

impl DebugOptions {
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Order-insensitive description of the watches, used in plan cache keys.
    pub fn summary(&self) -> String {
        let mut items: Vec<String> = self
            .watches
            .iter()
            .map(|w| {
                format!(
                    "{}:{}:{}:{}",
                    w.node_name,
                    w.output_slot,
                    w.debug_ops.join(";"),
                    w.debug_urls.join(";")
                )
            })
            .collect();
        items.sort();
        items.join(",")
    }
}

/// Options for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Step timeout, 0 for the session default.
    pub timeout_ms: u64,
    pub trace_level: TraceLevel,
    /// Index into the session's inter-op pools; -1 runs on the caller thread.
    pub inter_op_thread_pool: i32,
    pub output_partition_graphs: bool,
    pub use_run_handler_pool: bool,
    /// Expected collective key of the plan, 0 when unknown.
    pub collective_graph_key: u64,
    pub debug_options: DebugOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            trace_level: TraceLevel::NoTrace,
            inter_op_thread_pool: 0,
            output_partition_graphs: false,
            use_run_handler_pool: false,
            collective_graph_key: 0,
            debug_options: DebugOptions::default(),
        }
    }
}

/// What a step reports besides its outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetadata {
    pub step_stats: Option<StepStats>,
    pub cost_graph: Option<CostGraph>,
    pub partition_graphs: Vec<GraphDef>,
}
