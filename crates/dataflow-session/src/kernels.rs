//! Op kernels and the registry that instantiates them per node.
//!
//! Kernels return one entry per output slot; `None` marks a dead output,
//! produced on the untaken side of a `Switch` and propagated downstream.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dataflow_ir::{AttrValue, BinaryOp, DataType, Node, ResourceHandle, Tensor};
use parking_lot::Mutex;

use crate::debug::{DebugEvent, DEBUG_IDENTITY_OP};
use crate::error::{Result, SessionError};
use crate::executor::ExecutorArgs;
use crate::rendezvous::{create_key, ParsedKey, RendezvousValue};

/// Static description of the node a kernel was built for.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub op: String,
    pub attrs: BTreeMap<String, AttrValue>,
    pub input_types: Vec<DataType>,
    pub output_types: Vec<DataType>,
    pub device: String,
}

impl NodeInfo {
    pub fn from_node(node: &Node, device: &str) -> Self {
        NodeInfo {
            name: node.name.clone(),
            op: node.op.clone(),
            attrs: node.attrs.clone(),
            input_types: node.input_types.clone(),
            output_types: node.output_types.clone(),
            device: device.to_string(),
        }
    }

    fn attr(&self, key: &str) -> Result<&AttrValue> {
        self.attrs.get(key).ok_or_else(|| {
            SessionError::invalid_argument(format!(
                "Node '{}' ({}) is missing attr '{}'",
                self.name, self.op, key
            ))
        })
    }

    pub fn attr_int(&self, key: &str) -> Result<i64> {
        self.attr(key)?.as_int().ok_or_else(|| self.bad_attr(key, "int"))
    }

    pub fn attr_str(&self, key: &str) -> Result<&str> {
        self.attr(key)?.as_str().ok_or_else(|| self.bad_attr(key, "string"))
    }

    pub fn attr_type(&self, key: &str) -> Result<DataType> {
        self.attr(key)?.as_type().ok_or_else(|| self.bad_attr(key, "type"))
    }

    fn bad_attr(&self, key: &str, kind: &str) -> SessionError {
        SessionError::invalid_argument(format!(
            "Attr '{}' of node '{}' must be a {}",
            key, self.name, kind
        ))
    }
}

pub type KernelOutputs = Vec<Option<Tensor>>;

pub type KernelDone = Box<dyn FnOnce(Result<KernelOutputs>) + Send>;

/// Inputs and step resources for one kernel invocation.
pub struct OpKernelContext {
    pub node: Arc<NodeInfo>,
    /// `None` for a dead input.
    pub inputs: Vec<Option<Tensor>>,
    pub args: ExecutorArgs,
}

impl OpKernelContext {
    pub fn input(&self, index: usize) -> Result<&Tensor> {
        match self.inputs.get(index) {
            Some(Some(t)) => Ok(t),
            Some(None) => Err(SessionError::internal(format!(
                "Input {} of node '{}' is dead",
                index, self.node.name
            ))),
            None => Err(SessionError::internal(format!(
                "Node '{}' has no input {}",
                self.node.name, index
            ))),
        }
    }

    pub fn step_id(&self) -> i64 {
        self.args.step_id
    }
}

pub trait OpKernel: Send + Sync {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs>;
}

pub trait AsyncOpKernel: Send + Sync {
    fn compute_async(&self, ctx: OpKernelContext, done: KernelDone);
}

#[derive(Clone)]
pub enum Kernel {
    Sync(Arc<dyn OpKernel>),
    Async(Arc<dyn AsyncOpKernel>),
}

impl Kernel {
    pub fn sync(k: impl OpKernel + 'static) -> Self {
        Kernel::Sync(Arc::new(k))
    }

    pub fn asynchronous(k: impl AsyncOpKernel + 'static) -> Self {
        Kernel::Async(Arc::new(k))
    }
}

/// Ops that still run when some input is dead.
pub fn accepts_dead_inputs(op: &str) -> bool {
    matches!(op, "Merge" | "_Send")
}

pub type KernelFactory = Arc<dyn Fn(&NodeInfo) -> Result<Kernel> + Send + Sync>;

pub struct KernelRegistry {
    factories: HashMap<String, KernelFactory>,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl KernelRegistry {
    pub fn empty() -> Self {
        KernelRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for (op, factory) in builtin_factories() {
            registry.factories.insert(op.to_string(), factory);
        }
        registry
    }

    pub fn register<F>(&mut self, op: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&NodeInfo) -> Result<Kernel> + Send + Sync + 'static,
    {
        let op = op.into();
        if self.factories.contains_key(&op) {
            return Err(SessionError::AlreadyExists(format!(
                "A kernel is already registered for op {}",
                op
            )));
        }
        self.factories.insert(op, Arc::new(factory));
        Ok(())
    }

    pub fn create(&self, node: &NodeInfo) -> Result<Kernel> {
        let factory = self.factories.get(&node.op).ok_or_else(|| {
            SessionError::not_found(format!(
                "No kernel registered for op '{}' (node '{}') on {}",
                node.op, node.name, node.device
            ))
        })?;
        factory(node)
    }

    pub fn contains(&self, op: &str) -> bool {
        self.factories.contains_key(op)
    }
}

/// Kernels of stateful nodes, kept for the life of the session so their state
/// is shared by every plan that contains the node.
#[derive(Default)]
pub struct OpSegment {
    kernels: Mutex<HashMap<(String, String), Kernel>>,
}

impl OpSegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_or_create(
        &self,
        device: &str,
        node: &str,
        create: impl FnOnce() -> Result<Kernel>,
    ) -> Result<Kernel> {
        let mut kernels = self.kernels.lock();
        let key = (device.to_string(), node.to_string());
        if let Some(k) = kernels.get(&key) {
            return Ok(k.clone());
        }
        let kernel = create()?;
        kernels.insert(key, kernel.clone());
        Ok(kernel)
    }

    pub fn len(&self) -> usize {
        self.kernels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn factory<F>(f: F) -> KernelFactory
where
    F: Fn(&NodeInfo) -> Result<Kernel> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn builtin_factories() -> Vec<(&'static str, KernelFactory)> {
    vec![
        (
            "Const",
            factory(|n| {
                let value = n.attr("value")?.as_tensor().cloned().ok_or_else(|| {
                    SessionError::invalid_argument(format!("Const '{}' has no tensor value", n.name))
                })?;
                Ok(Kernel::sync(ConstOp { value }))
            }),
        ),
        (
            "Placeholder",
            factory(|n| {
                Ok(Kernel::sync(PlaceholderOp {
                    name: n.name.clone(),
                    dtype: n.attr_type("dtype")?,
                }))
            }),
        ),
        ("Identity", factory(|_| Ok(Kernel::sync(IdentityOp)))),
        ("NoOp", factory(|_| Ok(Kernel::sync(NoOpKernel)))),
        ("Add", factory(|_| Ok(Kernel::sync(BinaryKernel(BinaryOp::Add))))),
        ("Sub", factory(|_| Ok(Kernel::sync(BinaryKernel(BinaryOp::Sub))))),
        ("Mul", factory(|_| Ok(Kernel::sync(BinaryKernel(BinaryOp::Mul))))),
        ("Switch", factory(|_| Ok(Kernel::sync(SwitchOp)))),
        ("Merge", factory(|_| Ok(Kernel::sync(MergeOp)))),
        (
            "Counter",
            factory(|_| {
                Ok(Kernel::sync(CounterOp {
                    count: AtomicI64::new(0),
                }))
            }),
        ),
        ("GetSessionHandle", factory(|_| Ok(Kernel::sync(GetSessionHandleOp)))),
        (
            DEBUG_IDENTITY_OP,
            factory(|n| {
                let urls = n
                    .attrs
                    .get("debug_urls")
                    .and_then(AttrValue::as_list)
                    .map(|l| l.iter().filter_map(|u| u.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                Ok(Kernel::sync(DebugIdentityOp {
                    watched: n.attr_str("watched_tensor")?.to_string(),
                    debug_op: n.attr_str("debug_op").unwrap_or(DEBUG_IDENTITY_OP).to_string(),
                    urls,
                }))
            }),
        ),
        (
            "_Arg",
            factory(|n| Ok(Kernel::sync(ArgOp { index: index_attr(n)? }))),
        ),
        (
            "_Retval",
            factory(|n| Ok(Kernel::sync(RetvalOp { index: index_attr(n)? }))),
        ),
        (
            "_Send",
            factory(|n| {
                Ok(Kernel::sync(SendOp {
                    key: transfer_key(n)?,
                    dtype: n.attr_type("T")?,
                }))
            }),
        ),
        (
            "_Recv",
            factory(|n| Ok(Kernel::asynchronous(RecvOp { key: transfer_key(n)? }))),
        ),
        (
            "CollectiveReduce",
            factory(|n| {
                let group_size = n.attr_int("group_size")?;
                if group_size < 1 {
                    return Err(SessionError::invalid_argument(format!(
                        "CollectiveReduce '{}' needs group_size >= 1",
                        n.name
                    )));
                }
                Ok(Kernel::asynchronous(CollectiveReduceOp {
                    instance_key: n.attr_int("instance_key")?,
                    group_size: group_size as usize,
                }))
            }),
        ),
    ]
}

fn index_attr(n: &NodeInfo) -> Result<usize> {
    let index = n.attr_int("index")?;
    usize::try_from(index)
        .map_err(|_| SessionError::invalid_argument(format!("Negative index on '{}'", n.name)))
}

fn transfer_key(n: &NodeInfo) -> Result<ParsedKey> {
    let key = create_key(
        n.attr_str("send_device")?,
        n.attr_int("send_device_incarnation")? as u64,
        n.attr_str("recv_device")?,
        n.attr_str("tensor_name")?,
    );
    ParsedKey::parse(&key)
}

struct ConstOp {
    value: Tensor,
}

impl OpKernel for ConstOp {
    fn compute(&self, _ctx: &OpKernelContext) -> Result<KernelOutputs> {
        Ok(vec![Some(self.value.clone())])
    }
}

struct PlaceholderOp {
    name: String,
    dtype: DataType,
}

impl OpKernel for PlaceholderOp {
    fn compute(&self, _ctx: &OpKernelContext) -> Result<KernelOutputs> {
        Err(SessionError::invalid_argument(format!(
            "You must feed a value for placeholder tensor '{}' with dtype {}",
            self.name, self.dtype
        )))
    }
}

struct IdentityOp;

impl OpKernel for IdentityOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        Ok(vec![Some(ctx.input(0)?.clone())])
    }
}

struct NoOpKernel;

impl OpKernel for NoOpKernel {
    fn compute(&self, _ctx: &OpKernelContext) -> Result<KernelOutputs> {
        Ok(Vec::new())
    }
}

struct BinaryKernel(BinaryOp);

impl OpKernel for BinaryKernel {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        let out = dataflow_ir::binary_op(self.0, ctx.input(0)?, ctx.input(1)?)
            .map_err(|e| SessionError::from(e).with_context(&ctx.node.name))?;
        Ok(vec![Some(out)])
    }
}

/// Output 0 carries the data when the predicate is false, output 1 when true.
struct SwitchOp;

impl OpKernel for SwitchOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        let data = ctx.input(0)?.clone();
        let pred = ctx.input(1)?.scalar_value_bool().ok_or_else(|| {
            SessionError::invalid_argument(format!(
                "The second input of Switch '{}' must be a scalar bool",
                ctx.node.name
            ))
        })?;
        Ok(if pred {
            vec![None, Some(data)]
        } else {
            vec![Some(data), None]
        })
    }
}

/// Forwards the first live input and its index. Dead if every input is.
struct MergeOp;

impl OpKernel for MergeOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        Ok(ctx
            .inputs
            .iter()
            .enumerate()
            .find_map(|(i, t)| t.as_ref().map(|t| (i, t.clone())))
            .map(|(i, t)| vec![Some(t), Some(Tensor::scalar_i64(i as i64))])
            .unwrap_or_else(|| vec![None, None]))
    }
}

struct CounterOp {
    count: AtomicI64,
}

impl OpKernel for CounterOp {
    fn compute(&self, _ctx: &OpKernelContext) -> Result<KernelOutputs> {
        let value = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(vec![Some(Tensor::scalar_i64(value))])
    }
}

struct GetSessionHandleOp;

impl OpKernel for GetSessionHandleOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        let value = ctx.input(0)?.clone();
        let handle_name = format!("{};{}", ctx.node.name, ctx.step_id());
        ctx.args
            .tensor_store
            .add_tensor(&ctx.node.name, handle_name.clone(), value);
        let handle = ResourceHandle::session_tensor(handle_name, ctx.node.device.clone());
        Ok(vec![Some(Tensor::resource(handle))])
    }
}

struct DebugIdentityOp {
    watched: String,
    debug_op: String,
    urls: Vec<String>,
}

impl OpKernel for DebugIdentityOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        let value = ctx.input(0)?.clone();
        if let Some(sink) = &ctx.args.debug_sink {
            sink.publish_tensor(
                DebugEvent {
                    step_id: ctx.step_id(),
                    watched_tensor: self.watched.clone(),
                    debug_op: self.debug_op.clone(),
                    tensor: value.clone(),
                },
                &self.urls,
            )?;
        }
        Ok(vec![Some(value)])
    }
}

struct ArgOp {
    index: usize,
}

impl OpKernel for ArgOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        let frame = ctx.args.call_frame.as_ref().ok_or_else(|| {
            SessionError::internal(format!("_Arg '{}' ran without a call frame", ctx.node.name))
        })?;
        Ok(vec![Some(frame.get_arg(self.index)?)])
    }
}

struct RetvalOp {
    index: usize,
}

impl OpKernel for RetvalOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        let frame = ctx.args.call_frame.as_ref().ok_or_else(|| {
            SessionError::internal(format!("_Retval '{}' ran without a call frame", ctx.node.name))
        })?;
        frame.set_retval(self.index, ctx.input(0)?.clone())?;
        Ok(Vec::new())
    }
}

struct SendOp {
    key: ParsedKey,
    dtype: DataType,
}

impl OpKernel for SendOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        let value = match ctx.inputs.first() {
            Some(Some(t)) => RendezvousValue {
                tensor: t.clone(),
                is_dead: false,
            },
            _ => RendezvousValue {
                tensor: Tensor::empty(self.dtype),
                is_dead: true,
            },
        };
        ctx.args.rendezvous.send(&self.key, value)?;
        Ok(Vec::new())
    }
}

struct RecvOp {
    key: ParsedKey,
}

impl AsyncOpKernel for RecvOp {
    fn compute_async(&self, ctx: OpKernelContext, done: KernelDone) {
        ctx.args.rendezvous.recv_async(
            &self.key,
            Box::new(move |result| {
                done(result.map(|v| vec![(!v.is_dead).then_some(v.tensor)]));
            }),
        );
    }
}

struct CollectiveReduceOp {
    instance_key: i64,
    group_size: usize,
}

impl AsyncOpKernel for CollectiveReduceOp {
    fn compute_async(&self, ctx: OpKernelContext, done: KernelDone) {
        let Some(collective) = ctx.args.collective_executor.clone() else {
            done(Err(SessionError::internal(format!(
                "Collective op '{}' ran without a collective executor",
                ctx.node.name
            ))));
            return;
        };
        let input = match ctx.input(0) {
            Ok(t) => t.clone(),
            Err(e) => {
                done(Err(e));
                return;
            }
        };
        collective.reduce(
            self.instance_key,
            self.group_size,
            input,
            Box::new(move |result| done(result.map(|t| vec![Some(t)]))),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationManager;
    use crate::executor::inline_runner;
    use crate::rendezvous::{LocalRendezvous, Rendezvous};
    use crate::session_state::{SessionState, StepContainer, TensorStore};

    fn args(rendezvous: Arc<dyn Rendezvous>) -> ExecutorArgs {
        ExecutorArgs {
            step_id: 4,
            rendezvous,
            call_frame: None,
            cancellation: Arc::new(CancellationManager::new()),
            runner: inline_runner(),
            session_state: Arc::new(SessionState::new()),
            tensor_store: Arc::new(TensorStore::new()),
            step_container: Arc::new(StepContainer::new(4)),
            stats_collector: None,
            collective_executor: None,
            debug_sink: None,
        }
    }

    fn info(name: &str, op: &str) -> NodeInfo {
        NodeInfo {
            name: name.into(),
            op: op.into(),
            attrs: BTreeMap::new(),
            input_types: vec![],
            output_types: vec![],
            device: "CPU:0".into(),
        }
    }

    fn run_sync(kernel: &Kernel, node: NodeInfo, inputs: Vec<Option<Tensor>>) -> Result<KernelOutputs> {
        let Kernel::Sync(k) = kernel else {
            panic!("expected a synchronous kernel");
        };
        k.compute(&OpKernelContext {
            node: Arc::new(node),
            inputs,
            args: args(Arc::new(LocalRendezvous::new())),
        })
    }

    #[test]
    fn test_switch_and_merge() {
        let reg = KernelRegistry::with_builtins();
        let node = info("s", "Switch");
        let k = reg.create(&node).unwrap();
        let out = run_sync(
            &k,
            node,
            vec![Some(Tensor::scalar_f64(1.0)), Some(Tensor::scalar_bool(true))],
        )
        .unwrap();
        assert!(out[0].is_none());
        assert_eq!(out[1].as_ref().and_then(|t| t.scalar_value_f64()), Some(1.0));

        let node = info("m", "Merge");
        let k = reg.create(&node).unwrap();
        let out = run_sync(&k, node, vec![None, Some(Tensor::scalar_f64(2.0))]).unwrap();
        assert_eq!(out[1].as_ref().and_then(|t| t.scalar_value_i64()), Some(1));
        assert!(accepts_dead_inputs("Merge"));
        assert!(!accepts_dead_inputs("Add"));
    }

    #[test]
    fn test_placeholder_requires_feed() {
        let reg = KernelRegistry::with_builtins();
        let mut node = info("x", "Placeholder");
        node.attrs.insert("dtype".into(), AttrValue::Type(DataType::Float));
        let k = reg.create(&node).unwrap();
        let err = run_sync(&k, node, vec![]).err().unwrap();
        assert_eq!(
            err.message(),
            "You must feed a value for placeholder tensor 'x' with dtype float"
        );
    }

    #[test]
    fn test_counter_keeps_state() {
        let reg = KernelRegistry::with_builtins();
        let node = info("c", "Counter");
        let k = reg.create(&node).unwrap();
        for expected in 1..=3 {
            let out = run_sync(&k, node.clone(), vec![]).unwrap();
            assert_eq!(out[0].as_ref().and_then(|t| t.scalar_value_i64()), Some(expected));
        }
    }

    #[test]
    fn test_op_segment_shares_kernels() {
        let reg = KernelRegistry::with_builtins();
        let segment = OpSegment::new();
        let node = info("c", "Counter");
        let a = segment.find_or_create("cpu", "c", || reg.create(&node)).unwrap();
        let b = segment
            .find_or_create("cpu", "c", || Err(SessionError::internal("not called")))
            .unwrap();
        let (Kernel::Sync(a), Kernel::Sync(b)) = (a, b) else {
            panic!("expected synchronous kernels");
        };
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(segment.len(), 1);
    }

    #[test]
    fn test_unknown_op_and_duplicate_registration() {
        let mut reg = KernelRegistry::with_builtins();
        assert_eq!(
            reg.create(&info("n", "Conv2D")).err().unwrap().code(),
            crate::error::ErrorCode::NotFound
        );
        assert!(reg.register("Add", |_| Ok(Kernel::sync(NoOpKernel))).is_err());
        reg.register("Nothing", |_| Ok(Kernel::sync(NoOpKernel))).unwrap();
        assert!(reg.contains("Nothing"));
    }
}
