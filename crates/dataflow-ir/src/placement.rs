//! Device assignment for graph nodes.
//!
//! Nodes keep any device already assigned. Otherwise an explicit request is
//! resolved against the known devices, a stateful node reuses the device it
//! was given in an earlier placement, and everything else lands on the
//! default device.

use std::collections::HashMap;

use crate::device_name::DeviceName;
use crate::error::IrError;
use crate::graph::Graph;

pub struct Placer<'a> {
    devices: Vec<(String, DeviceName)>,
    default_device: &'a str,
    stateful_history: &'a HashMap<String, String>,
}

impl<'a> Placer<'a> {
    /// `devices` are fully qualified names; `default_device` must be one of them.
    pub fn new(
        devices: &[String],
        default_device: &'a str,
        stateful_history: &'a HashMap<String, String>,
    ) -> Result<Self, IrError> {
        let mut parsed = Vec::with_capacity(devices.len());
        for d in devices {
            parsed.push((d.clone(), DeviceName::parse(d)?));
        }
        Ok(Placer {
            devices: parsed,
            default_device,
            stateful_history,
        })
    }

    /// Assigns every unplaced node. Returns the number of nodes placed.
    pub fn run(&self, graph: &mut Graph) -> Result<usize, IrError> {
        let mut placed = 0;
        for id in graph.node_ids() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if node.assigned_device.is_some() {
                continue;
            }
            let device = if !node.requested_device.is_empty() {
                self.resolve(&node.name, &node.requested_device)?
            } else if let Some(prev) = node
                .is_stateful
                .then(|| self.stateful_history.get(&node.name))
                .flatten()
            {
                prev.clone()
            } else {
                self.default_device.to_string()
            };
            if let Some(node) = graph.node_mut(id) {
                node.assigned_device = Some(device);
                placed += 1;
            }
        }
        Ok(placed)
    }

    fn resolve(&self, node: &str, requested: &str) -> Result<String, IrError> {
        let wanted = DeviceName::parse(requested)?;
        self.devices
            .iter()
            .find(|(_, name)| wanted.matches(name))
            .map(|(full, _)| full.clone())
            .ok_or_else(|| IrError::NoMatchingDevice {
                node: node.to_string(),
                requested: requested.to_string(),
                available: self
                    .devices
                    .iter()
                    .map(|(full, _)| full.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// Assigned device of every stateful node, keyed by node name.
pub fn stateful_placements(graph: &Graph) -> HashMap<String, String> {
    graph
        .nodes()
        .filter(|n| n.is_stateful)
        .filter_map(|n| Some((n.name.clone(), n.assigned_device.clone()?)))
        .collect()
}
