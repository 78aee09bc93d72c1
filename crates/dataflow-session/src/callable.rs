//! Callables: plans made once and run by integer handle.

use std::collections::HashMap;
use std::sync::Arc;

use dataflow_ir::Tensor;
use tracing::debug;

use crate::call_frame::{CallFrame, RunCallableCallFrame};
use crate::config::RunMetadata;
use crate::error::{Result, SessionError};
use crate::executors_and_keys::{CallableOptions, ExecutorsAndKeys};
use crate::session::{internal_to_invalid_argument, next_step_id, DirectSession};

pub type CallableHandle = i64;

/// Table of live callables. Handles are never reused.
#[derive(Default)]
pub(crate) struct Callables {
    next_handle: CallableHandle,
    executors: HashMap<CallableHandle, Arc<ExecutorsAndKeys>>,
}

impl Callables {
    pub(crate) fn clear(&mut self) {
        self.executors.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.executors.len()
    }
}

impl DirectSession {
    /// Plans `options` and returns a handle that runs it.
    pub fn make_callable(&self, options: CallableOptions) -> Result<CallableHandle> {
        self.check_not_closed()?;
        self.check_graph_created("MakeCallable()")?;
        let ek = Arc::new(self.create_executors(options, false)?);
        let mut callables = self.callables.write();
        let handle = callables.next_handle;
        callables.next_handle += 1;
        callables.executors.insert(handle, ek);
        debug!(handle, "made callable");
        Ok(handle)
    }

    pub fn run_callable(
        &self,
        handle: CallableHandle,
        feeds: Vec<Tensor>,
    ) -> Result<(Vec<Tensor>, RunMetadata)> {
        self.check_not_closed()?;
        self.check_graph_created("RunCallable()")?;
        let step_id = next_step_id();

        let ek = {
            let callables = self.callables.read();
            if handle >= callables.next_handle {
                return Err(SessionError::invalid_argument(format!(
                    "No such callable handle: {}",
                    handle
                )));
            }
            callables.executors.get(&handle).cloned().ok_or_else(|| {
                SessionError::invalid_argument(format!(
                    "Attempted to run callable after handle was released: {}",
                    handle
                ))
            })?
        };

        if feeds.len() != ek.input_types.len() {
            return Err(SessionError::invalid_argument(format!(
                "Expected {} feed tensors, but got {}",
                ek.input_types.len(),
                feeds.len()
            )));
        }

        let frame = Arc::new(RunCallableCallFrame::new(
            self.session_state.clone(),
            feeds,
            ek.output_types.clone(),
        ));
        let call_frame: Arc<dyn CallFrame> = frame.clone();
        let mut metadata = RunMetadata::default();
        let run_options = ek.callable_options.run_options.clone();
        self.run_internal(step_id, &run_options, Some(call_frame), &ek, &mut metadata)?;

        let outputs = frame.consume_retvals().map_err(internal_to_invalid_argument)?;
        Ok((outputs, metadata))
    }

    /// Forgets a callable. Steps already running with it are unaffected.
    pub fn release_callable(&self, handle: CallableHandle) -> Result<()> {
        let mut callables = self.callables.write();
        if handle >= callables.next_handle {
            return Err(SessionError::invalid_argument(format!(
                "No such callable handle: {}",
                handle
            )));
        }
        callables.executors.remove(&handle);
        Ok(())
    }

    pub fn num_callables(&self) -> usize {
        self.callables.read().len()
    }
}
