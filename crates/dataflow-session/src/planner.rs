//! Turns a request into per-device executors.
//!
//! [`GraphExecutionState`] owns the session's base graph. For each request
//! it produces a client graph (feeds and fetches rewritten, pruned, placed),
//! checks it against the placements recorded for stateful nodes, and splits
//! it into one partition per device. [`create_executors`] then optimizes
//! each partition and builds its executor.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dataflow_ir::{
    partition, rewrite_graph_for_execution, stateful_placements, DataType, DeviceName,
    FunctionLibraryDefinition, Graph, GraphDef, GraphOptimizer, OpRegistry, PartitionOptions,
    Placer, RewriteOptions, TensorId,
};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::debug::{decorate_partition, DebugSink};
use crate::device::DeviceMgr;
use crate::error::{Result, SessionError};
use crate::executor::Executor;
use crate::executors_and_keys::{CallableOptions, ExecutorsAndKeys, PerPartitionExecutorsAndLib};
use crate::kernels::{KernelRegistry, OpSegment};
use crate::local_executor::LocalExecutor;
use crate::rendezvous::create_key;

/// The session graph and what earlier plans decided about it.
pub struct GraphExecutionState {
    registry: Arc<OpRegistry>,
    base_def: GraphDef,
    library: FunctionLibraryDefinition,
    /// The whole base graph, placed once, when pruned graphs are not placed individually.
    full_graph: Option<Graph>,
    stateful_placements: HashMap<String, String>,
}

/// Output of [`GraphExecutionState::build_graphs`].
pub struct ClientGraphs {
    /// Keyed by full device name.
    pub partitions: BTreeMap<String, Graph>,
    pub library: FunctionLibraryDefinition,
    pub input_types: Vec<DataType>,
    pub output_types: Vec<DataType>,
    pub collective_graph_key: u64,
    /// The unpruned base graph, for partial-run reachability checks.
    pub full_graph: Option<Graph>,
}

impl GraphExecutionState {
    pub fn new(
        def: GraphDef,
        registry: Arc<OpRegistry>,
        devices: &DeviceMgr,
        config: &SessionConfig,
    ) -> Result<Self> {
        let library = FunctionLibraryDefinition::from_library(&def.library)?;
        let mut state = GraphExecutionState {
            registry,
            base_def: def,
            library,
            full_graph: None,
            stateful_placements: HashMap::new(),
        };
        state.rebuild_full_graph(devices, config)?;
        Ok(state)
    }

    /// State for `base_def` plus `def`. Duplicate node names are rejected and
    /// nothing about `self` changes on failure.
    pub fn extend(&self, def: &GraphDef, devices: &DeviceMgr, config: &SessionConfig) -> Result<Self> {
        let existing: HashSet<&str> = self.base_def.nodes.iter().map(|n| n.name.as_str()).collect();
        for node in &def.nodes {
            if existing.contains(node.name.as_str()) {
                return Err(SessionError::invalid_argument(format!(
                    "GraphDef argument to Extend includes node '{}', which was created by a previous call to Create or Extend in this session.",
                    node.name
                )));
            }
        }
        let mut base_def = self.base_def.clone();
        base_def.nodes.extend(def.nodes.iter().cloned());
        let mut library = self.library.clone();
        library.add_library(&def.library)?;
        base_def.library = library.to_library();

        let mut state = GraphExecutionState {
            registry: self.registry.clone(),
            base_def,
            library,
            full_graph: None,
            stateful_placements: self.stateful_placements.clone(),
        };
        state.rebuild_full_graph(devices, config)?;
        Ok(state)
    }

    fn rebuild_full_graph(&mut self, devices: &DeviceMgr, config: &SessionConfig) -> Result<()> {
        let mut graph = Graph::from_def(&self.base_def, self.registry.clone())?;
        if !config.graph_options.place_pruned_graph {
            self.place(&mut graph, devices, config)?;
            self.full_graph = Some(graph);
        } else {
            // Validate only; placement happens per pruned graph.
            graph.topological_order()?;
        }
        Ok(())
    }

    fn place(&self, graph: &mut Graph, devices: &DeviceMgr, config: &SessionConfig) -> Result<()> {
        let names = devices.device_names();
        let default = devices.client_device().name().to_string();
        Placer::new(&names, &default, &self.stateful_placements)?.run(graph)?;
        if config.log_device_placement {
            for node in graph.nodes() {
                info!(node = %node.name, op = %node.op, device = %node.device(), "placed node");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn base_def(&self) -> &GraphDef {
        &self.base_def
    }

    #[cfg(test)]
    pub fn stateful_placements(&self) -> &HashMap<String, String> {
        &self.stateful_placements
    }

    /// Rewrites, prunes, places and partitions the graph for one request.
    pub fn build_graphs(
        &mut self,
        options: &CallableOptions,
        is_partial_run: bool,
        devices: &DeviceMgr,
        config: &SessionConfig,
        edge_name_counter: &AtomicU64,
    ) -> Result<ClientGraphs> {
        let client = devices.client_device();
        let rewrite = RewriteOptions {
            use_function_convention: !is_partial_run,
            client_device: client.name().to_string(),
            client_device_incarnation: client.attributes().incarnation,
        };

        let mut graph = match &self.full_graph {
            Some(full) => full.clone(),
            None => Graph::from_def(&self.base_def, self.registry.clone())?,
        };
        let rewritten = rewrite_graph_for_execution(
            &mut graph,
            &options.feeds,
            &options.fetches,
            &options.targets,
            &rewrite,
        )?;
        if self.full_graph.is_none() {
            self.place(&mut graph, devices, config)?;
        }

        if options.feeds.len() != rewritten.feed_types.len() {
            return Err(SessionError::internal(format!(
                "Graph pruning failed: requested number of feed endpoints = {} versus number of pruned feed endpoints = {}",
                options.feeds.len(),
                rewritten.feed_types.len()
            )));
        }
        if options.fetches.len() != rewritten.fetch_types.len() {
            return Err(SessionError::internal(format!(
                "Graph pruning failed: requested number of fetch endpoints = {} versus number of pruned fetch endpoints = {}",
                options.fetches.len(),
                rewritten.fetch_types.len()
            )));
        }

        let current = stateful_placements(&graph);
        for (node, placement) in &current {
            if let Some(previous) = self.stateful_placements.get(node) {
                if previous != placement {
                    return Err(SessionError::internal(format!(
                        "Stateful placement mismatch. Current assignment of {} to {} does not match {}",
                        node, previous, placement
                    )));
                }
            }
        }
        self.stateful_placements.extend(current);

        let collective_graph_key = collective_key(&graph, options.run_options.collective_graph_key);

        let full_graph = if is_partial_run {
            Some(match &self.full_graph {
                Some(full) => full.clone(),
                None => Graph::from_def(&self.base_def, self.registry.clone())?,
            })
        } else {
            None
        };

        let mut new_name = |prefix: &str| {
            format!("{}/_{}", prefix, edge_name_counter.fetch_add(1, Ordering::Relaxed))
        };
        let get_incarnation = |name: &str| devices.incarnation(name);
        let defs = partition(
            &graph,
            &mut PartitionOptions {
                new_name: &mut new_name,
                get_incarnation: &get_incarnation,
            },
        )?;

        let local_names: Vec<String> = devices
            .list_devices()
            .iter()
            .filter_map(|d| DeviceName::parse(d.name()).ok().map(|n| n.local_name()))
            .collect();
        let mut partitions = BTreeMap::new();
        for (device, def) in defs {
            let local = DeviceName::parse(&device)?.local_name();
            if !local_names.contains(&local) {
                return Err(SessionError::internal(format!(
                    "Creating a partition for {} which doesn't exist in the list of available devices. Available devices: {}",
                    local,
                    local_names.join(",")
                )));
            }
            let mut part = Graph::from_def(&def, self.registry.clone())?;
            for id in part.node_ids() {
                if let Some(node) = part.node_mut(id) {
                    node.assigned_device = Some(device.clone());
                }
            }
            debug!(device = %device, num_nodes = part.num_nodes(), "created partition");
            partitions.insert(device, part);
        }

        Ok(ClientGraphs {
            partitions,
            library: graph.library().clone(),
            input_types: rewritten.feed_types,
            output_types: rewritten.fetch_types,
            collective_graph_key,
            full_graph,
        })
    }
}

/// Key identifying the set of collective instances a graph takes part in, 0 if none.
fn collective_key(graph: &Graph, requested: u64) -> u64 {
    let mut instance_keys: Vec<i64> = graph
        .nodes()
        .filter(|n| n.op.starts_with("Collective"))
        .filter_map(|n| n.attr("instance_key").and_then(|v| v.as_int()))
        .collect();
    if instance_keys.is_empty() {
        return 0;
    }
    if requested != 0 {
        return requested;
    }
    instance_keys.sort_unstable();
    let mut hasher = DefaultHasher::new();
    instance_keys.hash(&mut hasher);
    hasher.finish().max(1)
}

/// Session pieces executor construction needs.
pub(crate) struct PlanContext<'a> {
    pub devices: &'a DeviceMgr,
    pub config: &'a SessionConfig,
    pub kernels: &'a KernelRegistry,
    pub op_segment: &'a OpSegment,
    pub debug_sink: Option<Arc<dyn DebugSink>>,
    pub graph_id_counter: &'a AtomicU64,
}

/// Optimizes the partitions of a planned request and builds one executor per partition.
pub(crate) fn create_executors(
    ctx: &PlanContext<'_>,
    client_graphs: ClientGraphs,
    options: CallableOptions,
    is_partial_run: bool,
) -> Result<ExecutorsAndKeys> {
    let mut ek = ExecutorsAndKeys {
        input_types: client_graphs.input_types,
        output_types: client_graphs.output_types,
        collective_graph_key: client_graphs.collective_graph_key,
        ..Default::default()
    };

    if let Some(full) = client_graphs.full_graph {
        let names: HashSet<String> = options
            .feeds
            .iter()
            .chain(&options.fetches)
            .filter_map(|n| TensorId::parse(n).ok().map(|id| id.node))
            .collect();
        for node in full.nodes() {
            if names.contains(&node.name) {
                ek.name_to_node.insert(node.name.clone(), node.id);
            }
        }
        ek.graph = Some(Arc::new(full));
    }

    let watches = &options.run_options.debug_options.watches;
    let preserved: Vec<String> = watches.iter().map(|w| w.node_name.clone()).collect();
    let optimizer = GraphOptimizer::new(ctx.config.graph_options.optimizer.into()).with_preserved(preserved);

    let library = Arc::new(client_graphs.library);
    for (device_name, mut graph) in client_graphs.partitions {
        let device = ctx.devices.lookup(&device_name)?;
        let stats = optimizer.optimize(&mut graph)?;
        if stats.total_transformations() > 0 {
            debug!(
                device = %device_name,
                folded = stats.constants_folded,
                identities = stats.identities_removed,
                "optimized partition"
            );
        }
        device.maybe_rewrite_graph(&mut graph)?;

        if !watches.is_empty() {
            let sink = ctx.debug_sink.as_ref().ok_or_else(|| {
                SessionError::FailedPrecondition(
                    "Debug tensor watches were requested but the session has no debug sink".into(),
                )
            })?;
            decorate_partition(&mut graph, watches)?;
            let urls: Vec<String> = watches.iter().flat_map(|w| w.debug_urls.iter().cloned()).collect();
            sink.publish_graph(&device_name, &graph.to_def(), &urls)?;
        }

        let executor: Arc<dyn Executor> = Arc::new(LocalExecutor::new(
            &device_name,
            &graph,
            ctx.kernels,
            ctx.op_segment,
        )?);
        ek.items.push(PerPartitionExecutorsAndLib {
            device,
            executor,
            graph: Arc::new(graph),
            library: library.clone(),
            graph_id: ctx.graph_id_counter.fetch_add(1, Ordering::Relaxed),
        });
    }

    if is_partial_run {
        let client = ctx.devices.client_device();
        let incarnation = client.attributes().incarnation;
        let key = |name: &str| -> Result<String> {
            let canonical = TensorId::parse(name)?.canonical();
            Ok(create_key(client.name(), incarnation, client.name(), &canonical))
        };
        for name in &options.feeds {
            ek.input_name_to_rendezvous_key.insert(name.clone(), key(name)?);
        }
        for name in &options.fetches {
            ek.output_name_to_rendezvous_key.insert(name.clone(), key(name)?);
        }
    } else {
        for (i, name) in options.feeds.iter().enumerate() {
            ek.input_name_to_index.insert(name.clone(), i);
        }
        for (i, name) in options.fetches.iter().enumerate() {
            ek.output_name_to_index.insert(name.clone(), i);
        }
    }
    ek.callable_options = options;
    Ok(ek)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_ir::{NodeDef, Tensor};

    fn graph() -> GraphDef {
        GraphDef::new()
            .with_node(NodeDef::placeholder("a", DataType::Float))
            .with_node(NodeDef::placeholder("b", DataType::Float))
            .with_node(NodeDef::binary("y", "Add", "a", "b"))
            .with_node(NodeDef::new("c", "Counter").with_device("/device:CPU:1"))
    }

    fn state(config: &SessionConfig, devices: &DeviceMgr) -> GraphExecutionState {
        GraphExecutionState::new(graph(), Arc::new(OpRegistry::with_builtins()), devices, config).unwrap()
    }

    #[test]
    fn test_build_graphs_types_and_partitions() {
        let devices = DeviceMgr::with_cpus(2).unwrap();
        let config = SessionConfig::default();
        let mut st = state(&config, &devices);
        let counter = AtomicU64::new(0);
        let built = st
            .build_graphs(
                &CallableOptions::new(["a", "b"], ["y", "c"], Vec::<String>::new()),
                false,
                &devices,
                &config,
                &counter,
            )
            .unwrap();
        assert_eq!(built.input_types, vec![DataType::Float; 2]);
        assert_eq!(built.output_types, vec![DataType::Float, DataType::Int64]);
        assert_eq!(built.partitions.len(), 2);
        assert_eq!(built.collective_graph_key, 0);
        assert!(counter.load(Ordering::Relaxed) > 0);
        assert_eq!(st.stateful_placements().len(), 1);
    }

    #[test]
    fn test_partition_on_missing_device_is_internal() {
        let config = SessionConfig::default();
        let mut st = state(&config, &DeviceMgr::with_cpus(2).unwrap());
        let fewer = DeviceMgr::with_cpus(1).unwrap();
        let err = st
            .build_graphs(
                &CallableOptions::new(["a", "b"], ["y", "c"], Vec::<String>::new()),
                false,
                &fewer,
                &config,
                &AtomicU64::new(0),
            )
            .err()
            .unwrap();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
        assert!(err.message().contains("Creating a partition for CPU:1"));
    }

    #[test]
    fn test_unknown_fetch_is_not_found() {
        let devices = DeviceMgr::with_cpus(1).unwrap();
        let config = SessionConfig {
            graph_options: crate::config::GraphOptions {
                place_pruned_graph: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut st = GraphExecutionState::new(
            GraphDef::new().with_node(NodeDef::constant("k", Tensor::scalar_f64(1.0))),
            Arc::new(OpRegistry::with_builtins()),
            &devices,
            &config,
        )
        .unwrap();
        let err = st
            .build_graphs(
                &CallableOptions::new(Vec::<String>::new(), ["nope:0"], Vec::<String>::new()),
                false,
                &devices,
                &config,
                &AtomicU64::new(0),
            )
            .err()
            .unwrap();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }

    #[test]
    fn test_extend_rejects_duplicates() {
        let devices = DeviceMgr::with_cpus(2).unwrap();
        let config = SessionConfig::default();
        let st = state(&config, &devices);
        let dup = GraphDef::new().with_node(NodeDef::constant("a", Tensor::scalar_f64(1.0)));
        assert!(st.extend(&dup, &devices, &config).is_err());
        let more = GraphDef::new().with_node(NodeDef::binary("z", "Mul", "y", "y"));
        let extended = st.extend(&more, &devices, &config).unwrap();
        assert_eq!(extended.base_def().nodes.len(), 5);
        assert_eq!(st.base_def().nodes.len(), 4);
    }

    #[test]
    fn test_collective_key() {
        let registry = Arc::new(OpRegistry::with_builtins());
        let def = GraphDef::new()
            .with_node(NodeDef::constant("x", Tensor::scalar_f64(1.0)))
            .with_node(
                NodeDef::new("r", "CollectiveReduce")
                    .with_input("x")
                    .with_attr("instance_key", 3i64)
                    .with_attr("group_size", 1i64),
            );
        let g = Graph::from_def(&def, registry).unwrap();
        let k = collective_key(&g, 0);
        assert_ne!(k, 0);
        assert_eq!(k, collective_key(&g, 0));
        assert_eq!(collective_key(&g, 42), 42);
    }
}
