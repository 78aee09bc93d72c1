//! Error types for graph construction and the planning transforms.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrError {
    #[error("Node '{name}' is defined more than once")]
    DuplicateNode { name: String },

    #[error("Node '{node}': input '{input}' refers to a node that does not exist")]
    UnknownInput { node: String, input: String },

    #[error(
        "Node '{node}': input '{input}' refers to output {slot} but the producer has only {num_outputs} outputs"
    )]
    OutputSlotOutOfRange {
        node: String,
        input: String,
        slot: usize,
        num_outputs: usize,
    },

    #[error("Op '{op}' is already registered")]
    DuplicateOp { op: String },

    #[error("Op type not registered '{op}' (node '{node}')")]
    UnknownOp { node: String, op: String },

    #[error("Node '{node}' (op '{op}') expects {expected} data inputs, got {actual}")]
    ArityMismatch {
        node: String,
        op: String,
        expected: String,
        actual: usize,
    },

    #[error("Node '{node}': input {index} expected {expected}, got {actual}")]
    TypeMismatch {
        node: String,
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("Node '{node}': {message}")]
    InvalidAttr { node: String, message: String },

    #[error("Tensor '{name}' not found in graph")]
    TensorNotFound { name: String },

    #[error("Node '{name}' not found in graph")]
    NodeNotFound { name: String },

    #[error("Invalid tensor name '{name}': {reason}")]
    InvalidTensorName { name: String, reason: String },

    #[error("Feed '{name}' is specified more than once")]
    DuplicateFeed { name: String },

    #[error("Graph contains a cycle through node '{node}'")]
    CyclicGraph { node: String },

    #[error("Invalid device name '{0}'")]
    InvalidDeviceName(String),

    #[error("Node '{node}' requests device '{requested}' which matches no known device. Available devices: {available}")]
    NoMatchingDevice {
        node: String,
        requested: String,
        available: String,
    },

    #[error("Node '{node}' has no assigned device")]
    UnplacedNode { node: String },

    #[error("Function '{name}' is already defined with a different body")]
    FunctionConflict { name: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for IrError {
    fn from(err: serde_json::Error) -> Self {
        IrError::Serialization(err.to_string())
    }
}
