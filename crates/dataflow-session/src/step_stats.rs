//! Per-node timing collected while a step runs.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExecStats {
    pub node_name: String,
    pub op: String,
    pub start_micros: u64,
    pub elapsed_micros: u64,
    pub output_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStepStats {
    pub device: String,
    pub node_stats: Vec<NodeExecStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStats {
    pub dev_stats: Vec<DeviceStepStats>,
}

impl StepStats {
    pub fn num_nodes(&self) -> usize {
        self.dev_stats.iter().map(|d| d.node_stats.len()).sum()
    }
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Thread-safe sink executors report node timings into.
#[derive(Default)]
pub struct StepStatsCollector {
    by_device: Mutex<BTreeMap<String, Vec<NodeExecStats>>>,
}

impl StepStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, device: &str, stats: NodeExecStats) {
        self.by_device
            .lock()
            .entry(device.to_string())
            .or_default()
            .push(stats);
    }

    /// Stats recorded so far, grouped by device in name order.
    pub fn finalize(&self) -> StepStats {
        let by_device = self.by_device.lock();
        StepStats {
            dev_stats: by_device
                .iter()
                .map(|(device, stats)| DeviceStepStats {
                    device: device.clone(),
                    node_stats: stats.clone(),
                })
                .collect(),
        }
    }

    pub fn device_stats(&self, device: &str) -> Vec<NodeExecStats> {
        self.by_device.lock().get(device).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_by_device() {
        let collector = StepStatsCollector::new();
        for (device, node) in [("b", "n1"), ("a", "n2"), ("b", "n3")] {
            collector.record(
                device,
                NodeExecStats {
                    node_name: node.into(),
                    ..Default::default()
                },
            );
        }
        let stats = collector.finalize();
        assert_eq!(stats.num_nodes(), 3);
        assert_eq!(stats.dev_stats[0].device, "a");
        assert_eq!(stats.dev_stats[1].node_stats.len(), 2);
    }
}
