//! Splitting a placed graph into one subgraph per device.
//!
//! Data edges that cross devices become a `_Send` on the producer's device
//! and a `_Recv` on the consumer's device sharing a generated tensor name.
//! Cross-device control edges are carried by an empty constant sent the
//! same way, so the consumer waits for the producer without moving data.

use std::collections::{BTreeMap, HashMap};

use crate::attr::AttrValue;
use crate::error::IrError;
use crate::graph::{Graph, GraphDef, NodeDef, NodeId};
use crate::tensor::{DataType, Tensor};

pub struct PartitionOptions<'a> {
    /// Returns a process-unique name derived from the argument.
    pub new_name: &'a mut dyn FnMut(&str) -> String,
    /// Incarnation of a device by full name.
    pub get_incarnation: &'a dyn Fn(&str) -> u64,
}

#[derive(Hash, PartialEq, Eq)]
enum TransferKey {
    Data(NodeId, usize, String),
    Control(NodeId, String),
}

struct Partitioner<'g, 'o, 'a> {
    graph: &'g Graph,
    options: &'o mut PartitionOptions<'a>,
    parts: BTreeMap<String, GraphDef>,
    /// Name of the `_Recv` already created for a transfer.
    transfers: HashMap<TransferKey, String>,
}

/// Partitions `graph` by assigned device. Every node must be placed.
pub fn partition(
    graph: &Graph,
    options: &mut PartitionOptions<'_>,
) -> Result<BTreeMap<String, GraphDef>, IrError> {
    let mut p = Partitioner {
        graph,
        options,
        parts: BTreeMap::new(),
        transfers: HashMap::new(),
    };
    for node in graph.nodes() {
        let device = node
            .assigned_device
            .clone()
            .ok_or_else(|| IrError::UnplacedNode {
                node: node.name.clone(),
            })?;
        let mut def = node.to_def();
        for edge in graph.data_inputs(node.id) {
            let input = p.data_input(edge.src, edge.src_output, &device)?;
            def.inputs.push(input);
        }
        let mut controls: Vec<NodeId> = graph
            .in_edges(node.id)
            .filter(|e| e.is_control)
            .map(|e| e.src)
            .collect();
        controls.sort_unstable();
        controls.dedup();
        for src in controls {
            let input = p.control_input(src, &device)?;
            def.inputs.push(input);
        }
        p.part(&device).nodes.push(def);
    }
    let library = graph.library().to_library();
    for def in p.parts.values_mut() {
        def.library = library.clone();
    }
    Ok(p.parts)
}

impl Partitioner<'_, '_, '_> {
    fn part(&mut self, device: &str) -> &mut GraphDef {
        self.parts.entry(device.to_string()).or_default()
    }

    fn src_info(&self, src: NodeId) -> Result<(String, String), IrError> {
        let node = self.graph.node(src).ok_or_else(|| IrError::NodeNotFound {
            name: format!("#{}", src),
        })?;
        let device = node
            .assigned_device
            .clone()
            .ok_or_else(|| IrError::UnplacedNode {
                node: node.name.clone(),
            })?;
        Ok((node.name.clone(), device))
    }

    fn data_input(&mut self, src: NodeId, slot: usize, dst_device: &str) -> Result<String, IrError> {
        let (src_name, src_device) = self.src_info(src)?;
        let local = if slot == 0 {
            src_name.clone()
        } else {
            format!("{}:{}", src_name, slot)
        };
        if src_device == dst_device {
            return Ok(local);
        }
        let key = TransferKey::Data(src, slot, dst_device.to_string());
        if let Some(recv) = self.transfers.get(&key) {
            return Ok(recv.clone());
        }
        let dtype = self
            .graph
            .node(src)
            .and_then(|n| n.output_types.get(slot).copied())
            .ok_or_else(|| IrError::OutputSlotOutOfRange {
                node: src_name.clone(),
                input: local.clone(),
                slot,
                num_outputs: 0,
            })?;
        let tensor_name = (self.options.new_name)(&format!("edge_{}_{}", src_name, slot));
        let recv = self.add_transfer(&tensor_name, &local, dtype, &src_device, dst_device);
        self.transfers.insert(key, recv.clone());
        Ok(recv)
    }

    fn control_input(&mut self, src: NodeId, dst_device: &str) -> Result<String, IrError> {
        let (src_name, src_device) = self.src_info(src)?;
        if src_device == dst_device {
            return Ok(format!("^{}", src_name));
        }
        let key = TransferKey::Control(src, dst_device.to_string());
        if let Some(recv) = self.transfers.get(&key) {
            return Ok(format!("^{}", recv));
        }
        let tensor_name = (self.options.new_name)(&format!("ctrl_{}", src_name));
        let dummy = format!("{}/_ctrl", tensor_name);
        let dummy_def = NodeDef::constant(dummy.clone(), Tensor::empty(DataType::Float))
            .with_control_input(&src_name)
            .with_device(src_device.as_str());
        self.part(&src_device).nodes.push(dummy_def);
        let recv = self.add_transfer(&tensor_name, &dummy, DataType::Float, &src_device, dst_device);
        self.transfers.insert(key, recv.clone());
        Ok(format!("^{}", recv))
    }

    /// Adds the `_Send`/`_Recv` pair and returns the `_Recv` node name.
    fn add_transfer(
        &mut self,
        tensor_name: &str,
        input: &str,
        dtype: DataType,
        src_device: &str,
        dst_device: &str,
    ) -> String {
        let incarnation = (self.options.get_incarnation)(src_device) as i64;
        let common = |name: String, op: &str, device: &str| {
            NodeDef::new(name, op)
                .with_device(device)
                .with_attr("tensor_name", tensor_name)
                .with_attr("send_device", src_device)
                .with_attr("recv_device", dst_device)
                .with_attr("send_device_incarnation", AttrValue::Int(incarnation))
                .with_attr("client_terminated", false)
        };
        let send = common(format!("{}/_send", tensor_name), "_Send", src_device)
            .with_input(input)
            .with_attr("T", dtype);
        let recv_name = format!("{}/_recv", tensor_name);
        let recv = common(recv_name.clone(), "_Recv", dst_device).with_attr("tensor_type", dtype);
        self.part(src_device).nodes.push(send);
        self.part(dst_device).nodes.push(recv);
        recv_name
    }
}
