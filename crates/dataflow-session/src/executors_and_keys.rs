//! The compiled plan of one request signature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dataflow_ir::{DataType, FunctionLibraryDefinition, Graph, GraphDef};
use serde::{Deserialize, Serialize};

use crate::config::RunOptions;
use crate::device::Device;
use crate::executor::Executor;

/// Feeds, fetches and targets of a request, plus the run options it was planned with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallableOptions {
    pub feeds: Vec<String>,
    pub fetches: Vec<String>,
    pub targets: Vec<String>,
    pub run_options: RunOptions,
}

impl CallableOptions {
    pub fn new(
        feeds: impl IntoIterator<Item = impl Into<String>>,
        fetches: impl IntoIterator<Item = impl Into<String>>,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        CallableOptions {
            feeds: feeds.into_iter().map(Into::into).collect(),
            fetches: fetches.into_iter().map(Into::into).collect(),
            targets: targets.into_iter().map(Into::into).collect(),
            run_options: RunOptions::default(),
        }
    }

    pub fn with_run_options(mut self, run_options: RunOptions) -> Self {
        self.run_options = run_options;
        self
    }
}

/// One device's share of a plan.
pub struct PerPartitionExecutorsAndLib {
    pub device: Arc<dyn Device>,
    pub executor: Arc<dyn Executor>,
    /// The optimized partition graph the executor was built from.
    pub graph: Arc<Graph>,
    /// Functions visible to the partition, shared by every item of a plan.
    pub library: Arc<FunctionLibraryDefinition>,
    /// Identifies the partition in the cost model.
    pub graph_id: u64,
}

impl PerPartitionExecutorsAndLib {
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn graph_def(&self) -> GraphDef {
        self.graph.to_def()
    }
}

/// Immutable once built, apart from the step counter.
#[derive(Default)]
pub struct ExecutorsAndKeys {
    pub step_count: AtomicI64,
    /// Full client graph, kept for partial runs only.
    pub graph: Option<Arc<Graph>>,
    /// Feed and fetch nodes of `graph`, by node name. Partial runs only.
    pub name_to_node: HashMap<String, usize>,
    pub items: Vec<PerPartitionExecutorsAndLib>,
    pub input_name_to_index: HashMap<String, usize>,
    pub output_name_to_index: HashMap<String, usize>,
    pub input_name_to_rendezvous_key: HashMap<String, String>,
    pub output_name_to_rendezvous_key: HashMap<String, String>,
    pub input_types: Vec<DataType>,
    pub output_types: Vec<DataType>,
    pub callable_options: CallableOptions,
    pub collective_graph_key: u64,
}

impl ExecutorsAndKeys {
    /// Returns the step count before this step.
    pub fn next_step(&self) -> i64 {
        self.step_count.fetch_add(1, Ordering::SeqCst)
    }

    pub fn steps_run(&self) -> i64 {
        self.step_count.load(Ordering::SeqCst)
    }

    pub fn is_partial_run(&self) -> bool {
        self.graph.is_some()
    }
}

impl std::fmt::Debug for ExecutorsAndKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorsAndKeys")
            .field("partitions", &self.items.iter().map(|i| i.device_name()).collect::<Vec<_>>())
            .field("input_types", &self.input_types)
            .field("output_types", &self.output_types)
            .field("collective_graph_key", &self.collective_graph_key)
            .finish_non_exhaustive()
    }
}
