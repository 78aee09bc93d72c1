//! Argument and return-value slots for steps planned with `_Arg`/`_Retval` nodes.

use std::sync::Arc;

use dataflow_ir::{DataType, Tensor};
use parking_lot::Mutex;

use crate::error::{Result, SessionError};
use crate::session_state::{resource_handle_to_input_tensor, SessionState};

pub trait CallFrame: Send + Sync {
    fn num_args(&self) -> usize;
    fn num_retvals(&self) -> usize;
    fn get_arg(&self, index: usize) -> Result<Tensor>;
    fn set_retval(&self, index: usize, value: Tensor) -> Result<()>;
}

fn take_retvals(retvals: &Mutex<Vec<Option<Tensor>>>) -> Result<Vec<Tensor>> {
    let mut retvals = retvals.lock();
    let mut out = Vec::with_capacity(retvals.len());
    for (i, slot) in retvals.iter_mut().enumerate() {
        match slot.take() {
            Some(t) => out.push(t),
            None => {
                return Err(SessionError::internal(format!(
                    "Retval[{}] does not have value",
                    i
                )))
            }
        }
    }
    Ok(out)
}

fn store_retval(
    retvals: &Mutex<Vec<Option<Tensor>>>,
    types: &[DataType],
    index: usize,
    value: Tensor,
) -> Result<()> {
    let expected = types.get(index).copied().ok_or_else(|| {
        SessionError::internal(format!("RetVal index out of bounds: {}", index))
    })?;
    if value.dtype() != expected {
        return Err(SessionError::invalid_argument(format!(
            "Expects ret[{}] to be {}, but {} is provided.",
            index,
            expected,
            value.dtype()
        )));
    }
    let mut retvals = retvals.lock();
    if retvals[index].is_some() {
        return Err(SessionError::internal(format!(
            "Retval[{}] has already been set.",
            index
        )));
    }
    retvals[index] = Some(value);
    Ok(())
}

/// Call frame used by `run`: arguments are set up front and checked against
/// the plan's input types.
pub struct FunctionCallFrame {
    arg_types: Vec<DataType>,
    ret_types: Vec<DataType>,
    args: Mutex<Vec<Tensor>>,
    retvals: Mutex<Vec<Option<Tensor>>>,
}

impl FunctionCallFrame {
    pub fn new(arg_types: Vec<DataType>, ret_types: Vec<DataType>) -> Self {
        let retvals = Mutex::new(vec![None; ret_types.len()]);
        FunctionCallFrame {
            arg_types,
            ret_types,
            args: Mutex::new(Vec::new()),
            retvals,
        }
    }

    pub fn set_args(&self, args: Vec<Tensor>) -> Result<()> {
        if args.len() != self.arg_types.len() {
            return Err(SessionError::invalid_argument(format!(
                "Expects {} arguments, but {} is provided",
                self.arg_types.len(),
                args.len()
            )));
        }
        for (i, (arg, expected)) in args.iter().zip(&self.arg_types).enumerate() {
            if arg.dtype() != *expected {
                return Err(SessionError::invalid_argument(format!(
                    "Expects arg[{}] to be {} but {} is provided",
                    i,
                    expected,
                    arg.dtype()
                )));
            }
        }
        *self.args.lock() = args;
        Ok(())
    }

    /// Takes every return value. Fails if any was never set (e.g. it was dead).
    pub fn consume_retvals(&self) -> Result<Vec<Tensor>> {
        take_retvals(&self.retvals)
    }
}

impl CallFrame for FunctionCallFrame {
    fn num_args(&self) -> usize {
        self.arg_types.len()
    }

    fn num_retvals(&self) -> usize {
        self.ret_types.len()
    }

    fn get_arg(&self, index: usize) -> Result<Tensor> {
        self.args
            .lock()
            .get(index)
            .cloned()
            .ok_or_else(|| SessionError::internal(format!("Args index out of bounds: {}", index)))
    }

    fn set_retval(&self, index: usize, value: Tensor) -> Result<()> {
        store_retval(&self.retvals, &self.ret_types, index, value)
    }
}

/// Call frame used by callables: feeds are read in place and resource handles
/// are resolved through the session's tensor table when an op asks for them.
pub struct RunCallableCallFrame {
    session_state: Arc<SessionState>,
    feeds: Vec<Tensor>,
    ret_types: Vec<DataType>,
    retvals: Mutex<Vec<Option<Tensor>>>,
}

impl RunCallableCallFrame {
    pub fn new(session_state: Arc<SessionState>, feeds: Vec<Tensor>, ret_types: Vec<DataType>) -> Self {
        let retvals = Mutex::new(vec![None; ret_types.len()]);
        RunCallableCallFrame {
            session_state,
            feeds,
            ret_types,
            retvals,
        }
    }

    pub fn consume_retvals(&self) -> Result<Vec<Tensor>> {
        take_retvals(&self.retvals)
    }
}

impl CallFrame for RunCallableCallFrame {
    fn num_args(&self) -> usize {
        self.feeds.len()
    }

    fn num_retvals(&self) -> usize {
        self.ret_types.len()
    }

    fn get_arg(&self, index: usize) -> Result<Tensor> {
        let feed = self
            .feeds
            .get(index)
            .ok_or_else(|| SessionError::internal(format!("Args index out of bounds: {}", index)))?;
        if feed.dtype() == DataType::Resource {
            resource_handle_to_input_tensor(&self.session_state, feed)
        } else {
            Ok(feed.clone())
        }
    }

    fn set_retval(&self, index: usize, value: Tensor) -> Result<()> {
        store_retval(&self.retvals, &self.ret_types, index, value)
    }
}
