//! In-memory dataflow graph with typed data edges and control edges.

mod def;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

pub use def::{FunctionDef, FunctionLibrary, FunctionLibraryDefinition, GraphDef, NodeDef};

use crate::attr::AttrValue;
use crate::error::IrError;
use crate::op_registry::{InferenceContext, OpRegistry};
use crate::tensor::DataType;
use crate::tensor_id::InputRef;

pub type NodeId = usize;
pub type EdgeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub id: EdgeId,
    pub src: NodeId,
    pub src_output: usize,
    pub dst: NodeId,
    pub dst_input: usize,
    pub is_control: bool,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: String,
    /// Device string from the definition, possibly partial or empty.
    pub requested_device: String,
    /// Fully qualified device chosen by placement.
    pub assigned_device: Option<String>,
    pub attrs: BTreeMap<String, AttrValue>,
    pub input_types: Vec<DataType>,
    pub output_types: Vec<DataType>,
    pub is_stateful: bool,
    in_edges: Vec<EdgeId>,
    out_edges: Vec<EdgeId>,
}

impl Node {
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn num_outputs(&self) -> usize {
        self.output_types.len()
    }

    /// Assigned device if placed, else the requested one.
    pub fn device(&self) -> &str {
        self.assigned_device
            .as_deref()
            .unwrap_or(&self.requested_device)
    }

    pub fn to_def(&self) -> NodeDef {
        NodeDef {
            name: self.name.clone(),
            op: self.op.clone(),
            inputs: Vec::new(),
            device: self.device().to_string(),
            attrs: self.attrs.clone(),
        }
    }
}

/// Mutable graph. Removed nodes and edges leave tombstones so ids stay stable.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    edges: Vec<Option<Edge>>,
    by_name: HashMap<String, NodeId>,
    registry: Arc<OpRegistry>,
    library: FunctionLibraryDefinition,
    name_counter: usize,
}

impl Graph {
    pub fn new(registry: Arc<OpRegistry>) -> Self {
        Graph {
            nodes: Vec::new(),
            edges: Vec::new(),
            by_name: HashMap::new(),
            registry,
            library: FunctionLibraryDefinition::new(),
            name_counter: 0,
        }
    }

    /// Builds a graph, resolving inputs and inferring every output type.
    pub fn from_def(def: &GraphDef, registry: Arc<OpRegistry>) -> Result<Self, IrError> {
        let mut graph = Graph::new(registry);
        graph.library = FunctionLibraryDefinition::from_library(&def.library)?;

        let mut ids = Vec::with_capacity(def.nodes.len());
        for nd in &def.nodes {
            if graph.by_name.contains_key(&nd.name) {
                return Err(IrError::DuplicateNode {
                    name: nd.name.clone(),
                });
            }
            let op = graph
                .registry
                .lookup(&nd.op)
                .ok_or_else(|| IrError::UnknownOp {
                    node: nd.name.clone(),
                    op: nd.op.clone(),
                })?;
            let is_stateful = op.is_stateful;
            ids.push(graph.insert_node(Node {
                id: 0,
                name: nd.name.clone(),
                op: nd.op.clone(),
                requested_device: nd.device.clone(),
                assigned_device: None,
                attrs: nd.attrs.clone(),
                input_types: Vec::new(),
                output_types: Vec::new(),
                is_stateful,
                in_edges: Vec::new(),
                out_edges: Vec::new(),
            }));
        }

        for (nd, &dst) in def.nodes.iter().zip(&ids) {
            let mut data_index = 0;
            for input in &nd.inputs {
                let unknown = |name: &str| IrError::UnknownInput {
                    node: nd.name.clone(),
                    input: name.to_string(),
                };
                match InputRef::parse(input)? {
                    InputRef::Data(tid) => {
                        let src = graph.find_node(&tid.node).ok_or_else(|| unknown(input))?;
                        graph.add_edge(src, tid.index, dst, data_index);
                        data_index += 1;
                    }
                    InputRef::Control(name) => {
                        let src = graph.find_node(&name).ok_or_else(|| unknown(input))?;
                        graph.add_control_edge(src, dst);
                    }
                }
            }
        }

        for id in graph.topological_order()? {
            graph.infer_node_types(id)?;
        }
        Ok(graph)
    }

    fn infer_node_types(&mut self, id: NodeId) -> Result<(), IrError> {
        let node = self.lookup(id)?;
        let mut input_types = Vec::new();
        for edge in self.data_inputs(id) {
            let src = self.lookup(edge.src)?;
            let t = src.output_types.get(edge.src_output).copied().ok_or_else(|| {
                IrError::OutputSlotOutOfRange {
                    node: node.name.clone(),
                    input: format!("{}:{}", src.name, edge.src_output),
                    slot: edge.src_output,
                    num_outputs: src.output_types.len(),
                }
            })?;
            input_types.push(t);
        }
        let op = self
            .registry
            .lookup(&node.op)
            .ok_or_else(|| IrError::UnknownOp {
                node: node.name.clone(),
                op: node.op.clone(),
            })?;
        let output_types = op.output_types(&InferenceContext {
            node: &node.name,
            op: &node.op,
            attrs: &node.attrs,
            input_types: &input_types,
        })?;
        if let Some(node) = self.node_mut(id) {
            node.input_types = input_types;
            node.output_types = output_types;
        }
        Ok(())
    }

    fn insert_node(&mut self, mut node: Node) -> NodeId {
        let id = self.nodes.len();
        node.id = id;
        self.by_name.insert(node.name.clone(), id);
        self.nodes.push(Some(node));
        id
    }

    /// Adds a node whose data inputs will have `input_types`; edges are added separately.
    pub fn add_node(&mut self, def: &NodeDef, input_types: &[DataType]) -> Result<NodeId, IrError> {
        if self.by_name.contains_key(&def.name) {
            return Err(IrError::DuplicateNode {
                name: def.name.clone(),
            });
        }
        let op = self
            .registry
            .lookup(&def.op)
            .ok_or_else(|| IrError::UnknownOp {
                node: def.name.clone(),
                op: def.op.clone(),
            })?;
        let output_types = op.output_types(&InferenceContext {
            node: &def.name,
            op: &def.op,
            attrs: &def.attrs,
            input_types,
        })?;
        let is_stateful = op.is_stateful;
        Ok(self.insert_node(Node {
            id: 0,
            name: def.name.clone(),
            op: def.op.clone(),
            requested_device: def.device.clone(),
            assigned_device: None,
            attrs: def.attrs.clone(),
            input_types: input_types.to_vec(),
            output_types,
            is_stateful,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
        }))
    }

    pub fn add_edge(&mut self, src: NodeId, src_output: usize, dst: NodeId, dst_input: usize) -> EdgeId {
        self.push_edge(src, src_output, dst, dst_input, false)
    }

    pub fn add_control_edge(&mut self, src: NodeId, dst: NodeId) -> EdgeId {
        self.push_edge(src, 0, dst, 0, true)
    }

    fn push_edge(
        &mut self,
        src: NodeId,
        src_output: usize,
        dst: NodeId,
        dst_input: usize,
        is_control: bool,
    ) -> EdgeId {
        let id = self.edges.len();
        self.edges.push(Some(Edge {
            id,
            src,
            src_output,
            dst,
            dst_input,
            is_control,
        }));
        if let Some(n) = self.nodes[src].as_mut() {
            n.out_edges.push(id);
        }
        if let Some(n) = self.nodes[dst].as_mut() {
            n.in_edges.push(id);
        }
        id
    }

    pub fn remove_edge(&mut self, id: EdgeId) {
        if let Some(edge) = self.edges.get_mut(id).and_then(Option::take) {
            if let Some(n) = self.nodes[edge.src].as_mut() {
                n.out_edges.retain(|e| *e != id);
            }
            if let Some(n) = self.nodes[edge.dst].as_mut() {
                n.in_edges.retain(|e| *e != id);
            }
        }
    }

    /// Removes a node together with all its edges.
    pub fn remove_node(&mut self, id: NodeId) {
        let edges: Vec<EdgeId> = match self.node(id) {
            Some(n) => n.in_edges.iter().chain(&n.out_edges).copied().collect(),
            None => return,
        };
        for e in edges {
            self.remove_edge(e);
        }
        if let Some(node) = self.nodes[id].take() {
            self.by_name.remove(&node.name);
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id).and_then(Option::as_mut)
    }

    fn lookup(&self, id: NodeId) -> Result<&Node, IrError> {
        self.node(id).ok_or_else(|| IrError::NodeNotFound {
            name: format!("#{}", id),
        })
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id).and_then(Option::as_ref)
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().map(|n| n.id).collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter_map(Option::as_ref)
    }

    pub fn num_nodes(&self) -> usize {
        self.by_name.len()
    }

    pub fn in_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.node(id)
            .map(|n| n.in_edges.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|e| self.edge(*e))
    }

    pub fn out_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.node(id)
            .map(|n| n.out_edges.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|e| self.edge(*e))
    }

    /// Data in-edges ordered by input index.
    pub fn data_inputs(&self, id: NodeId) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.in_edges(id).filter(|e| !e.is_control).collect();
        edges.sort_by_key(|e| e.dst_input);
        edges
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    pub fn library(&self) -> &FunctionLibraryDefinition {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut FunctionLibraryDefinition {
        &mut self.library
    }

    /// Kahn order over data and control edges.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, IrError> {
        let mut pending: HashMap<NodeId, usize> = HashMap::new();
        let mut ready = VecDeque::new();
        for node in self.nodes() {
            let count = self.in_edges(node.id).count();
            if count == 0 {
                ready.push_back(node.id);
            }
            pending.insert(node.id, count);
        }
        let mut order = Vec::with_capacity(pending.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for edge in self.out_edges(id) {
                if let Some(count) = pending.get_mut(&edge.dst) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(edge.dst);
                    }
                }
            }
        }
        if order.len() != pending.len() {
            let stuck = pending
                .iter()
                .filter(|(_, c)| **c > 0)
                .filter_map(|(id, _)| self.node(*id))
                .map(|n| n.name.clone())
                .min()
                .unwrap_or_default();
            return Err(IrError::CyclicGraph { node: stuck });
        }
        Ok(order)
    }

    /// Name not yet used in this graph, derived from `prefix`.
    pub fn unique_name(&mut self, prefix: &str) -> String {
        loop {
            let candidate = format!("{}/_{}", prefix, self.name_counter);
            self.name_counter += 1;
            if !self.by_name.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Serializes back to a definition with inputs in `x:slot` / `^x` form.
    pub fn to_def(&self) -> GraphDef {
        let mut nodes = Vec::with_capacity(self.num_nodes());
        for node in self.nodes() {
            let mut nd = node.to_def();
            for edge in self.data_inputs(node.id) {
                let Some(src) = self.node(edge.src) else {
                    continue;
                };
                nd.inputs.push(if edge.src_output == 0 {
                    src.name.clone()
                } else {
                    format!("{}:{}", src.name, edge.src_output)
                });
            }
            let mut controls: Vec<&str> = self
                .in_edges(node.id)
                .filter(|e| e.is_control)
                .filter_map(|e| self.node(e.src).map(|n| n.name.as_str()))
                .collect();
            controls.sort_unstable();
            for c in controls {
                nd.inputs.push(format!("^{}", c));
            }
            nodes.push(nd);
        }
        GraphDef {
            nodes,
            library: self.library.to_library(),
            version: 0,
        }
    }
}
