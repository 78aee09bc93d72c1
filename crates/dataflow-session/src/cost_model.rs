//! Running per-node cost estimates, sampled from step statistics.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::step_stats::NodeExecStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct NodeCost {
    count: u64,
    total_micros: u64,
    max_output_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostNode {
    pub name: String,
    pub device: String,
    pub op: String,
    /// Mean elapsed time over all samples.
    pub compute_cost_micros: u64,
    pub max_output_bytes: u64,
    pub samples: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostGraph {
    pub nodes: Vec<CostNode>,
}

type ModelKey = (String, u64);

/// Cost models keyed by device and partition graph id.
#[derive(Default)]
pub struct CostModelManager {
    models: Mutex<HashMap<ModelKey, BTreeMap<String, (String, NodeCost)>>>,
}

impl CostModelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, device: &str, graph_id: u64, stats: &[NodeExecStats]) {
        let mut models = self.models.lock();
        let model = models.entry((device.to_string(), graph_id)).or_default();
        for s in stats {
            let (_, cost) = model
                .entry(s.node_name.clone())
                .or_insert_with(|| (s.op.clone(), NodeCost::default()));
            cost.count += 1;
            cost.total_micros += s.elapsed_micros;
            cost.max_output_bytes = cost.max_output_bytes.max(s.output_bytes);
        }
    }

    /// Cost graph of the given partitions, nodes ordered by device then name.
    pub fn cost_graph(&self, partitions: &[(String, u64)]) -> CostGraph {
        let models = self.models.lock();
        let mut nodes = Vec::new();
        let mut keys: Vec<&(String, u64)> = partitions.iter().collect();
        keys.sort();
        for key in keys {
            let Some(model) = models.get(key) else {
                continue;
            };
            for (name, (op, cost)) in model {
                nodes.push(CostNode {
                    name: name.clone(),
                    device: key.0.clone(),
                    op: op.clone(),
                    compute_cost_micros: cost.total_micros / cost.count.max(1),
                    max_output_bytes: cost.max_output_bytes,
                    samples: cost.count,
                });
            }
        }
        CostGraph { nodes }
    }

    pub fn num_models(&self) -> usize {
        self.models.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(name: &str, micros: u64) -> NodeExecStats {
        NodeExecStats {
            node_name: name.into(),
            op: "Add".into(),
            elapsed_micros: micros,
            ..Default::default()
        }
    }

    #[test]
    fn test_averages_samples() {
        let mgr = CostModelManager::new();
        mgr.update("cpu0", 1, &[stat("a", 10)]);
        mgr.update("cpu0", 1, &[stat("a", 30)]);
        mgr.update("cpu1", 2, &[stat("b", 5)]);
        let graph = mgr.cost_graph(&[("cpu0".into(), 1)]);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].compute_cost_micros, 20);
        assert_eq!(graph.nodes[0].samples, 2);
        assert_eq!(mgr.num_models(), 2);
    }
}
