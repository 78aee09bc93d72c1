//! Tensors that outlive a step.
//!
//! A step hands values to the session through its [`TensorStore`]; once the
//! step finishes, the ones whose handles were fetched move into the
//! session-wide [`SessionState`] and can be fed back by handle later.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use dataflow_ir::{DataType, Tensor, TensorId, TENSOR_HANDLE_CONTAINER};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SessionError};

/// Session-wide table of retained tensors, keyed by handle name.
#[derive(Default)]
pub struct SessionState {
    tensors: Mutex<HashMap<String, Tensor>>,
    next_id: AtomicI64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_tensor(&self, handle: &str) -> Result<Tensor> {
        self.tensors.lock().get(handle).cloned().ok_or_else(|| {
            SessionError::not_found(format!(
                "The tensor with handle '{}' is not in the session store.",
                handle
            ))
        })
    }

    pub fn add_tensor(&self, handle: &str, tensor: Tensor) -> Result<()> {
        let mut tensors = self.tensors.lock();
        if tensors.contains_key(handle) {
            return Err(SessionError::AlreadyExists(format!(
                "Failed to add a tensor with handle '{}' to the session store.",
                handle
            )));
        }
        tensors.insert(handle.to_string(), tensor);
        Ok(())
    }

    pub fn delete_tensor(&self, handle: &str) -> Result<()> {
        self.tensors.lock().remove(handle).map(|_| ()).ok_or_else(|| {
            SessionError::not_found(format!(
                "Failed to delete a tensor with handle '{}' in the session store.",
                handle
            ))
        })
    }

    pub fn get_new_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tensors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves a fed resource handle to the tensor it names.
pub fn resource_handle_to_input_tensor(state: &SessionState, tensor: &Tensor) -> Result<Tensor> {
    if tensor.dtype() != DataType::Resource {
        return Err(SessionError::invalid_argument(format!(
            "Expected a resource tensor but got {}",
            tensor.dtype()
        )));
    }
    let handle = tensor.resource_handle().ok_or_else(|| {
        SessionError::invalid_argument("Resource tensor does not hold a handle")
    })?;
    if handle.container == TENSOR_HANDLE_CONTAINER {
        state.get_tensor(&handle.name)
    } else {
        Err(SessionError::invalid_argument(format!(
            "Invalid resource container '{}' (name: {}). Perhaps a resource tensor was being \
             provided as a feed? That is not currently allowed.",
            handle.container, handle.name
        )))
    }
}

struct StoredTensor {
    handle: String,
    tensor: Tensor,
}

/// Tensors a single step asked to retain, keyed by producing node name.
#[derive(Default)]
pub struct TensorStore {
    tensors: Mutex<HashMap<String, StoredTensor>>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(&self, node: &str, handle: String, tensor: Tensor) {
        self.tensors
            .lock()
            .insert(node.to_string(), StoredTensor { handle, tensor });
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.lock().is_empty()
    }

    /// Moves the tensors whose handles appear in `fetches` into `state`.
    pub fn save_tensors(&self, fetches: &[String], state: &SessionState) -> Result<()> {
        let tensors = self.tensors.lock();
        if tensors.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        for fetch in fetches {
            let Ok(id) = TensorId::parse(fetch) else {
                continue;
            };
            if id.index != 0 || !seen.insert(id.node.clone()) {
                continue;
            }
            if let Some(stored) = tensors.get(&id.node) {
                debug!(handle = %stored.handle, "retaining tensor in session state");
                state.add_tensor(&stored.handle, stored.tensor.clone())?;
            }
        }
        Ok(())
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Step-scoped resources. Cleanups registered here run when the step's
/// container is dropped, in reverse registration order.
#[derive(Default)]
pub struct StepContainer {
    step_id: i64,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl StepContainer {
    pub fn new(step_id: i64) -> Self {
        StepContainer {
            step_id,
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn step_id(&self) -> i64 {
        self.step_id
    }

    pub fn add_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.lock().push(Box::new(cleanup));
    }
}

impl Drop for StepContainer {
    fn drop(&mut self) {
        let cleanups = std::mem::take(self.cleanups.get_mut());
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
    }
}
