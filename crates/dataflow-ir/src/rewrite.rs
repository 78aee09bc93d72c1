//! Feed/fetch rewriting and reachability pruning.
//!
//! Each fed tensor is replaced by a source node (`_Arg` or `_Recv`) and each
//! fetched tensor gets a sink node (`_Retval` or `_Send`), all on the client
//! device. The graph is then trimmed to the nodes the fetches, targets and
//! feeds transitively depend on.

use std::collections::{HashMap, HashSet};

use crate::attr::AttrValue;
use crate::error::IrError;
use crate::graph::{Graph, NodeDef, NodeId};
use crate::tensor::DataType;
use crate::tensor_id::TensorId;

#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// `_Arg`/`_Retval` when true, client-terminated `_Recv`/`_Send` otherwise.
    pub use_function_convention: bool,
    pub client_device: String,
    pub client_device_incarnation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RewriteResult {
    pub feed_types: Vec<DataType>,
    pub fetch_types: Vec<DataType>,
    /// Names of the inserted source nodes, in feed order.
    pub feed_nodes: Vec<String>,
    /// Names of the inserted sink nodes, in fetch order.
    pub fetch_nodes: Vec<String>,
}

pub fn rewrite_graph_for_execution(
    graph: &mut Graph,
    feeds: &[String],
    fetches: &[String],
    targets: &[String],
    options: &RewriteOptions,
) -> Result<RewriteResult, IrError> {
    let mut result = RewriteResult::default();
    // Fetches of a fed tensor must read the fed value.
    let mut redirected: HashMap<TensorId, (NodeId, usize)> = HashMap::new();

    let mut seen = HashSet::new();
    for (index, feed) in feeds.iter().enumerate() {
        let id = TensorId::parse(feed)?;
        if !seen.insert(id.clone()) {
            return Err(IrError::DuplicateFeed { name: feed.clone() });
        }
        let (src, dtype) = resolve_tensor(graph, &id, feed)?;
        let def = if options.use_function_convention {
            NodeDef::new(sanitized("_arg", &id, index), "_Arg")
                .with_attr("T", dtype)
                .with_attr("index", index as i64)
        } else {
            transfer_node(sanitized("_recv", &id, index), "_Recv", &id, options)
                .with_attr("tensor_type", dtype)
        };
        let feed_node = add_client_node(graph, def, &[], options)?;

        let consumers: Vec<_> = graph
            .out_edges(src)
            .filter(|e| !e.is_control && e.src_output == id.index)
            .map(|e| (e.id, e.dst, e.dst_input))
            .collect();
        for (edge, dst, dst_input) in consumers {
            graph.remove_edge(edge);
            graph.add_edge(feed_node, 0, dst, dst_input);
        }
        redirected.insert(id, (feed_node, 0));
        result.feed_types.push(dtype);
        result.feed_nodes.push(name_of(graph, feed_node));
    }

    for (index, fetch) in fetches.iter().enumerate() {
        let id = TensorId::parse(fetch)?;
        let (src, slot, dtype) = match redirected.get(&id) {
            Some(&(node, slot)) => {
                let dtype = graph
                    .node(node)
                    .and_then(|n| n.output_types.get(slot).copied())
                    .ok_or_else(|| IrError::TensorNotFound { name: fetch.clone() })?;
                (node, slot, dtype)
            }
            None => {
                let (node, dtype) = resolve_tensor(graph, &id, fetch)?;
                (node, id.index, dtype)
            }
        };
        let def = if options.use_function_convention {
            NodeDef::new(sanitized("_retval", &id, index), "_Retval")
                .with_attr("T", dtype)
                .with_attr("index", index as i64)
        } else {
            transfer_node(sanitized("_send", &id, index), "_Send", &id, options)
                .with_attr("T", dtype)
        };
        let fetch_node = add_client_node(graph, def, &[dtype], options)?;
        graph.add_edge(src, slot, fetch_node, 0);
        result.fetch_types.push(dtype);
        result.fetch_nodes.push(name_of(graph, fetch_node));
    }

    let mut roots = Vec::new();
    for target in targets {
        let node = graph
            .find_node(target)
            .ok_or_else(|| IrError::NodeNotFound {
                name: target.clone(),
            })?;
        roots.push(node);
    }
    for name in result.feed_nodes.iter().chain(&result.fetch_nodes) {
        if let Some(node) = graph.find_node(name) {
            roots.push(node);
        }
    }
    prune_for_targets(graph, &roots);
    Ok(result)
}

/// Removes every node that no root transitively depends on. Returns the number removed.
pub fn prune_for_targets(graph: &mut Graph, roots: &[NodeId]) -> usize {
    let mut keep = HashSet::new();
    let mut stack: Vec<NodeId> = roots.to_vec();
    while let Some(id) = stack.pop() {
        if !keep.insert(id) {
            continue;
        }
        for edge in graph.in_edges(id) {
            if !keep.contains(&edge.src) {
                stack.push(edge.src);
            }
        }
    }
    let doomed: Vec<NodeId> = graph
        .node_ids()
        .into_iter()
        .filter(|id| !keep.contains(id))
        .collect();
    for id in &doomed {
        graph.remove_node(*id);
    }
    doomed.len()
}

fn resolve_tensor(graph: &Graph, id: &TensorId, name: &str) -> Result<(NodeId, DataType), IrError> {
    let not_found = || IrError::TensorNotFound {
        name: name.to_string(),
    };
    let node_id = graph.find_node(&id.node).ok_or_else(not_found)?;
    let dtype = graph
        .node(node_id)
        .and_then(|n| n.output_types.get(id.index).copied())
        .ok_or_else(not_found)?;
    Ok((node_id, dtype))
}

fn transfer_node(name: String, op: &str, id: &TensorId, options: &RewriteOptions) -> NodeDef {
    NodeDef::new(name, op)
        .with_attr("tensor_name", id.canonical())
        .with_attr("send_device", options.client_device.as_str())
        .with_attr("recv_device", options.client_device.as_str())
        .with_attr(
            "send_device_incarnation",
            AttrValue::Int(options.client_device_incarnation as i64),
        )
        .with_attr("client_terminated", true)
}

fn add_client_node(
    graph: &mut Graph,
    def: NodeDef,
    input_types: &[DataType],
    options: &RewriteOptions,
) -> Result<NodeId, IrError> {
    let def = def.with_device(options.client_device.as_str());
    let id = graph.add_node(&def, input_types)?;
    if let Some(node) = graph.node_mut(id) {
        node.assigned_device = Some(options.client_device.clone());
    }
    Ok(id)
}

fn sanitized(prefix: &str, id: &TensorId, index: usize) -> String {
    let body: String = id
        .node
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}_{}_{}", prefix, body, id.index, index)
}

fn name_of(graph: &Graph, id: NodeId) -> String {
    graph.node(id).map(|n| n.name.clone()).unwrap_or_default()
}
