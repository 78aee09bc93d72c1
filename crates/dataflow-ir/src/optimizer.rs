//! Post-partition graph optimization passes.

use std::collections::{BTreeMap, HashSet};

use crate::attr::AttrValue;
use crate::error::IrError;
use crate::graph::{Graph, NodeId};
use crate::tensor::{binary_op, BinaryOp, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizerOptions {
    pub do_constant_folding: bool,
    pub do_identity_elimination: bool,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        OptimizerOptions {
            do_constant_folding: true,
            do_identity_elimination: true,
        }
    }
}

/// Counts of what a pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizationStats {
    pub constants_folded: usize,
    pub identities_removed: usize,
    pub dead_nodes_removed: usize,
}

impl OptimizationStats {
    pub fn total_transformations(&self) -> usize {
        self.constants_folded + self.identities_removed + self.dead_nodes_removed
    }
}

pub struct GraphOptimizer {
    options: OptimizerOptions,
    preserve: HashSet<String>,
}

impl GraphOptimizer {
    pub fn new(options: OptimizerOptions) -> Self {
        GraphOptimizer {
            options,
            preserve: HashSet::new(),
        }
    }

    /// Nodes that must survive under their own name (e.g. watched by a debugger).
    pub fn with_preserved(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.preserve.extend(names);
        self
    }

    pub fn optimize(&self, graph: &mut Graph) -> Result<OptimizationStats, IrError> {
        let mut stats = OptimizationStats::default();
        if self.options.do_constant_folding {
            self.fold_constants(graph, &mut stats)?;
        }
        if self.options.do_identity_elimination {
            self.eliminate_identities(graph, &mut stats);
        }
        Ok(stats)
    }

    fn fold_constants(&self, graph: &mut Graph, stats: &mut OptimizationStats) -> Result<(), IrError> {
        let mut orphaned = Vec::new();
        for id in graph.topological_order()? {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let Some(op) = BinaryOp::from_op_name(&node.op) else {
                continue;
            };
            if node.is_stateful || self.preserve.contains(&node.name) {
                continue;
            }
            let inputs = graph.data_inputs(id);
            let mut operands = Vec::with_capacity(inputs.len());
            for edge in &inputs {
                match const_value(graph, edge.src) {
                    Some(t) => operands.push((edge.id, edge.src, t.clone())),
                    None => break,
                }
            }
            if operands.len() != 2 || inputs.len() != 2 {
                continue;
            }
            let Ok(folded) = binary_op(op, &operands[0].2, &operands[1].2) else {
                continue;
            };
            for (edge, src, _) in &operands {
                graph.remove_edge(*edge);
                orphaned.push(*src);
            }
            if let Some(node) = graph.node_mut(id) {
                let dtype = folded.dtype();
                node.op = "Const".to_string();
                node.input_types.clear();
                node.attrs = BTreeMap::from([
                    ("value".to_string(), AttrValue::Tensor(folded)),
                    ("dtype".to_string(), AttrValue::Type(dtype)),
                ]);
            }
            stats.constants_folded += 1;
        }
        for id in orphaned {
            let dead = graph.node(id).is_some_and(|n| n.op == "Const" && !self.preserve.contains(&n.name))
                && graph.out_edges(id).next().is_none();
            if dead {
                graph.remove_node(id);
                stats.dead_nodes_removed += 1;
            }
        }
        Ok(())
    }

    fn eliminate_identities(&self, graph: &mut Graph, stats: &mut OptimizationStats) {
        for id in graph.node_ids() {
            if !self.is_removable_identity(graph, id) {
                continue;
            }
            let Some(input) = graph.data_inputs(id).first().map(|e| (e.src, e.src_output)) else {
                continue;
            };
            let consumers: Vec<(usize, NodeId, usize)> = graph
                .out_edges(id)
                .map(|e| (e.id, e.dst, e.dst_input))
                .collect();
            for (edge, dst, dst_input) in consumers {
                graph.remove_edge(edge);
                graph.add_edge(input.0, input.1, dst, dst_input);
            }
            graph.remove_node(id);
            stats.identities_removed += 1;
        }
    }

    fn is_removable_identity(&self, graph: &Graph, id: NodeId) -> bool {
        let Some(node) = graph.node(id) else {
            return false;
        };
        node.op == "Identity"
            && !self.preserve.contains(&node.name)
            && graph.in_edges(id).all(|e| !e.is_control)
            && graph.out_edges(id).next().is_some()
            && graph.out_edges(id).all(|e| !e.is_control)
    }
}

fn const_value(graph: &Graph, id: NodeId) -> Option<&Tensor> {
    let node = graph.node(id)?;
    if node.op != "Const" {
        return None;
    }
    node.attr("value").and_then(AttrValue::as_tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphDef, NodeDef};
    use crate::op_registry::OpRegistry;
    use crate::tensor::DataType;
    use std::sync::Arc;

    fn build(def: GraphDef) -> Graph {
        Graph::from_def(&def, Arc::new(OpRegistry::with_builtins())).unwrap()
    }

    #[test]
    fn test_fold_chain() {
        let mut g = build(
            GraphDef::new()
                .with_node(NodeDef::constant("a", Tensor::scalar_f64(2.0)))
                .with_node(NodeDef::constant("b", Tensor::scalar_f64(3.0)))
                .with_node(NodeDef::binary("s", "Add", "a", "b"))
                .with_node(NodeDef::binary("m", "Mul", "s", "s"))
                .with_node(NodeDef::new("out", "Identity").with_input("m")),
        );
        let stats = GraphOptimizer::new(OptimizerOptions {
            do_constant_folding: true,
            do_identity_elimination: false,
        })
        .optimize(&mut g)
        .unwrap();
        assert_eq!(stats.constants_folded, 2);
        let m = g.node(g.find_node("m").unwrap()).unwrap();
        assert_eq!(m.op, "Const");
        assert_eq!(
            m.attr("value").and_then(|v| v.as_tensor()).and_then(|t| t.scalar_value_f64()),
            Some(25.0)
        );
        assert!(g.find_node("a").is_none());
        assert!(g.find_node("s").is_none());
    }

    #[test]
    fn test_placeholder_blocks_folding() {
        let mut g = build(
            GraphDef::new()
                .with_node(NodeDef::placeholder("p", DataType::Float))
                .with_node(NodeDef::constant("c", Tensor::scalar_f64(3.0)))
                .with_node(NodeDef::binary("s", "Add", "p", "c")),
        );
        let stats = GraphOptimizer::new(OptimizerOptions::default())
            .optimize(&mut g)
            .unwrap();
        assert_eq!(stats.total_transformations(), 0);
    }

    #[test]
    fn test_identity_elimination() {
        let mut g = build(
            GraphDef::new()
                .with_node(NodeDef::placeholder("p", DataType::Float))
                .with_node(NodeDef::new("i", "Identity").with_input("p"))
                .with_node(NodeDef::new("kept", "Identity").with_input("p"))
                .with_node(NodeDef::binary("s", "Add", "i", "kept")),
        );
        let stats = GraphOptimizer::new(OptimizerOptions::default())
            .with_preserved(["kept".to_string()])
            .optimize(&mut g)
            .unwrap();
        assert_eq!(stats.identities_removed, 1);
        assert!(g.find_node("i").is_none());
        assert!(g.find_node("kept").is_some());
        let s = g.find_node("s").unwrap();
        let p = g.find_node("p").unwrap();
        assert_eq!(g.data_inputs(s)[0].src, p);
    }
}
