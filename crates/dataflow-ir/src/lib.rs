//! Graph model and planning transforms for the dataflow session runtime.
//!
//! This crate holds everything the session needs to turn a caller's graph
//! definition into per-device executable subgraphs, without executing
//! anything itself:
//!
//! - **[`GraphDef`] / [`NodeDef`]**: serializable graph definitions with a
//!   function library.
//! - **[`Graph`]**: the in-memory graph with typed data edges and control
//!   edges, built against an [`OpRegistry`] that supplies output types and
//!   statefulness.
//! - **[`Tensor`]**: dense host values exchanged with callers.
//! - **Transforms**: [`rewrite_graph_for_execution`] (feed/fetch rewriting
//!   and pruning), [`Placer`] (device assignment), [`partition()`]
//!   (per-device split with `_Send`/`_Recv` pairs) and [`GraphOptimizer`]
//!   (constant folding, identity elimination).

#![allow(clippy::len_without_is_empty)]

pub mod attr;
pub mod device_name;
pub mod error;
pub mod graph;
pub mod op_registry;
pub mod optimizer;
pub mod partition;
pub mod placement;
pub mod rewrite;
pub mod tensor;
pub mod tensor_id;

pub use attr::AttrValue;
pub use device_name::DeviceName;
pub use error::IrError;
pub use graph::{
    Edge, EdgeId, FunctionDef, FunctionLibrary, FunctionLibraryDefinition, Graph, GraphDef, Node,
    NodeDef, NodeId,
};
pub use op_registry::{InferenceContext, OpDef, OpRegistry, TypeInferenceFn};
pub use optimizer::{GraphOptimizer, OptimizationStats, OptimizerOptions};
pub use partition::{partition, PartitionOptions};
pub use placement::{stateful_placements, Placer};
pub use rewrite::{prune_for_targets, rewrite_graph_for_execution, RewriteOptions, RewriteResult};
pub use tensor::{
    binary_op, BinaryOp, DataType, ResourceHandle, Tensor, TensorData, TENSOR_HANDLE_CONTAINER,
};
pub use tensor_id::{InputRef, TensorId};
