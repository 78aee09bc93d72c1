//! Tensor watches: debug nodes inserted into partitions, and the sink that
//! receives decorated graphs and watched values.

use dataflow_ir::{AttrValue, Graph, GraphDef, NodeDef, Tensor};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::DebugTensorWatch;
use crate::error::{Result, SessionError};

pub const DEBUG_IDENTITY_OP: &str = "DebugIdentity";

#[derive(Debug, Clone, PartialEq)]
pub struct DebugEvent {
    pub step_id: i64,
    /// `node:slot` of the watched tensor.
    pub watched_tensor: String,
    pub debug_op: String,
    pub tensor: Tensor,
}

pub trait DebugSink: Send + Sync {
    fn publish_graph(&self, device: &str, graph: &GraphDef, urls: &[String]) -> Result<()>;

    fn publish_tensor(&self, event: DebugEvent, urls: &[String]) -> Result<()>;
}

/// Keeps everything it is sent. Useful for tests and in-process inspection.
#[derive(Default)]
pub struct InMemoryDebugSink {
    graphs: Mutex<Vec<(String, GraphDef)>>,
    events: Mutex<Vec<DebugEvent>>,
}

impl InMemoryDebugSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graphs(&self) -> Vec<(String, GraphDef)> {
        self.graphs.lock().clone()
    }

    pub fn events(&self) -> Vec<DebugEvent> {
        self.events.lock().clone()
    }
}

impl DebugSink for InMemoryDebugSink {
    fn publish_graph(&self, device: &str, graph: &GraphDef, _urls: &[String]) -> Result<()> {
        self.graphs.lock().push((device.to_string(), graph.clone()));
        Ok(())
    }

    fn publish_tensor(&self, event: DebugEvent, _urls: &[String]) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Inserts one debug node per (watch, debug op) whose watched node lives in
/// `graph`. Returns the names of the inserted nodes.
pub fn decorate_partition(graph: &mut Graph, watches: &[DebugTensorWatch]) -> Result<Vec<String>> {
    let mut inserted = Vec::new();
    for watch in watches {
        let Some(src) = graph.find_node(&watch.node_name) else {
            continue;
        };
        let (device, dtype) = match graph.node(src) {
            Some(node) => {
                let dtype = node.output_types.get(watch.output_slot).copied().ok_or_else(|| {
                    SessionError::invalid_argument(format!(
                        "Debug watch on {}:{} but the node has {} outputs",
                        watch.node_name,
                        watch.output_slot,
                        node.num_outputs()
                    ))
                })?;
                (node.assigned_device.clone(), dtype)
            }
            None => continue,
        };
        let ops: Vec<&str> = if watch.debug_ops.is_empty() {
            vec![DEBUG_IDENTITY_OP]
        } else {
            watch.debug_ops.iter().map(String::as_str).collect()
        };
        for op in ops {
            if op != DEBUG_IDENTITY_OP {
                return Err(SessionError::Unimplemented(format!(
                    "Unsupported debug op: {}",
                    op
                )));
            }
            let watched = format!("{}:{}", watch.node_name, watch.output_slot);
            let name = graph.unique_name(&format!(
                "__dbg_{}_{}_{}",
                sanitize(&watch.node_name),
                watch.output_slot,
                op
            ));
            let urls = AttrValue::List(
                watch
                    .debug_urls
                    .iter()
                    .map(|u| AttrValue::Str(u.clone()))
                    .collect(),
            );
            let mut def = NodeDef::new(name.clone(), op)
                .with_attr("watched_tensor", watched.as_str())
                .with_attr("debug_op", op)
                .with_attr("debug_urls", urls);
            if let Some(d) = &device {
                def = def.with_device(d.as_str());
            }
            let id = graph.add_node(&def, &[dtype])?;
            if let Some(node) = graph.node_mut(id) {
                node.assigned_device = device.clone();
            }
            graph.add_edge(src, watch.output_slot, id, 0);
            debug!(node = %name, watched = %watched, "inserted debug node");
            inserted.push(name);
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_ir::{DataType, OpRegistry};
    use std::sync::Arc;

    fn watch(node: &str) -> DebugTensorWatch {
        DebugTensorWatch {
            node_name: node.into(),
            output_slot: 0,
            debug_ops: vec![],
            debug_urls: vec!["mem://".into()],
        }
    }

    #[test]
    fn test_decorates_only_local_nodes() {
        let mut g = Graph::from_def(
            &GraphDef::new()
                .with_node(NodeDef::placeholder("a", DataType::Float))
                .with_node(NodeDef::new("b", "Identity").with_input("a")),
            Arc::new(OpRegistry::with_builtins()),
        )
        .unwrap();
        let inserted = decorate_partition(&mut g, &[watch("b"), watch("elsewhere")]).unwrap();
        assert_eq!(inserted.len(), 1);
        let node = g.node(g.find_node(&inserted[0]).unwrap()).unwrap();
        assert_eq!(node.op, DEBUG_IDENTITY_OP);
        assert_eq!(node.attr("watched_tensor").and_then(|v| v.as_str()), Some("b:0"));
    }

    #[test]
    fn test_bad_slot_and_op() {
        let def = GraphDef::new().with_node(NodeDef::placeholder("a", DataType::Float));
        let registry = Arc::new(OpRegistry::with_builtins());
        let mut g = Graph::from_def(&def, registry.clone()).unwrap();
        let mut w = watch("a");
        w.output_slot = 3;
        assert!(decorate_partition(&mut g, &[w]).is_err());

        let mut w = watch("a");
        w.debug_ops = vec!["DebugNumericSummary".into()];
        let err = decorate_partition(&mut g, &[w]).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Unimplemented);
    }
}
