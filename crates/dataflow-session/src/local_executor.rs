//! Dataflow executor for one partition graph on one device.
//!
//! A node becomes ready once every data and control input has arrived. Roots
//! are always dispatched through the step's runner. Within runner work one
//! ready node keeps running on the current thread; any others go back through
//! the runner. Deadness flows along edges: a node with a dead input (or a
//! dead control predecessor) is skipped and marks all of its outputs dead,
//! except for `Merge` and `_Send` which handle dead inputs themselves.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use dataflow_ir::{Graph, Tensor};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{update_status, Result, SessionError};
use crate::executor::{DoneCallback, Executor, ExecutorArgs};
use crate::kernels::{
    accepts_dead_inputs, Kernel, KernelOutputs, KernelRegistry, NodeInfo, OpKernelContext,
    OpSegment,
};
use crate::step_stats::{now_micros, NodeExecStats};

#[derive(Debug, Clone, Copy)]
struct OutEdge {
    dst: usize,
    dst_input: usize,
}

struct ExecNode {
    info: Arc<NodeInfo>,
    kernel: Kernel,
    num_inputs: usize,
    num_pending: usize,
    /// Data consumers, per output slot.
    outputs: Vec<Vec<OutEdge>>,
    control_outputs: Vec<usize>,
    is_merge: bool,
}

pub struct LocalExecutor {
    inner: Arc<ExecutorImpl>,
}

struct ExecutorImpl {
    device: String,
    nodes: Vec<ExecNode>,
    roots: Vec<usize>,
}

impl LocalExecutor {
    /// Instantiates a kernel for every node of `graph`. Kernels of stateful
    /// nodes come from `segment` so their state outlives this executor.
    pub fn new(
        device: &str,
        graph: &Graph,
        registry: &KernelRegistry,
        segment: &OpSegment,
    ) -> Result<Self> {
        let order = graph.topological_order()?;
        let index: HashMap<_, _> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut nodes = Vec::with_capacity(order.len());
        for &id in &order {
            let node = graph
                .node(id)
                .ok_or_else(|| SessionError::internal(format!("Dangling node id {}", id)))?;
            let info = Arc::new(NodeInfo::from_node(node, device));
            let kernel = if node.is_stateful {
                segment.find_or_create(device, &node.name, || registry.create(&info))?
            } else {
                registry.create(&info)?
            };
            let num_inputs = graph.data_inputs(id).len();
            nodes.push(ExecNode {
                num_inputs,
                num_pending: graph.in_edges(id).count(),
                outputs: vec![Vec::new(); node.num_outputs()],
                control_outputs: Vec::new(),
                is_merge: node.op == "Merge",
                kernel,
                info,
            });
        }

        for edge in graph.edges() {
            let (Some(&src), Some(&dst)) = (index.get(&edge.src), index.get(&edge.dst)) else {
                continue;
            };
            if edge.is_control {
                nodes[src].control_outputs.push(dst);
            } else {
                let num_outputs = nodes[src].outputs.len();
                if edge.src_output >= num_outputs {
                    return Err(SessionError::internal(format!(
                        "Edge from output {} of '{}' which has {} outputs",
                        edge.src_output, nodes[src].info.name, num_outputs
                    )));
                }
                nodes[src].outputs[edge.src_output].push(OutEdge {
                    dst,
                    dst_input: edge.dst_input,
                });
            }
        }

        let roots = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.num_pending == 0)
            .map(|(i, _)| i)
            .collect();
        debug!(device, num_nodes = nodes.len(), "built partition executor");
        Ok(LocalExecutor {
            inner: Arc::new(ExecutorImpl {
                device: device.to_string(),
                nodes,
                roots,
            }),
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }
}

impl Executor for LocalExecutor {
    fn run_async(&self, args: ExecutorArgs, done: DoneCallback) {
        let token = args.cancellation.get_cancellation_token();
        let rendezvous = args.rendezvous.clone();
        let collective = args.collective_executor.clone();
        let registered = args.cancellation.register_callback(
            token,
            Box::new(move || {
                let status = SessionError::cancelled("Step was cancelled");
                rendezvous.start_abort(status.clone());
                if let Some(c) = collective {
                    c.start_abort(status);
                }
            }),
        );
        if !registered {
            done(Err(SessionError::cancelled("Step was cancelled")));
            return;
        }

        let exec = &self.inner;
        let frame = Frame {
            pending: exec.nodes.iter().map(|n| n.num_pending).collect(),
            inputs: exec.nodes.iter().map(|n| vec![None; n.num_inputs]).collect(),
            control_dead: vec![false; exec.nodes.len()],
            outstanding: exec.roots.len(),
            status: Ok(()),
            done: Some(done),
        };
        let state = Arc::new(ExecutorState {
            exec: exec.clone(),
            args,
            token,
            frame: Mutex::new(frame),
        });
        if exec.roots.is_empty() {
            state.finish();
            return;
        }
        // Roots go through the runner so the caller only waits on `done`.
        for &root in &exec.roots {
            let s = state.clone();
            (state.args.runner)(Box::new(move || s.process(root)));
        }
    }
}

struct Frame {
    pending: Vec<usize>,
    /// `None` until arrival, and for dead inputs.
    inputs: Vec<Vec<Option<Tensor>>>,
    control_dead: Vec<bool>,
    outstanding: usize,
    status: Result<()>,
    done: Option<DoneCallback>,
}

struct ExecutorState {
    exec: Arc<ExecutorImpl>,
    args: ExecutorArgs,
    token: u64,
    frame: Mutex<Frame>,
}

enum Outcome {
    Finished(Result<KernelOutputs>, bool),
    Pending,
}

impl ExecutorState {
    fn process(self: &Arc<Self>, start: usize) {
        let mut ready = VecDeque::from([start]);
        while let Some(id) = ready.pop_front() {
            let outcome = self.run_node(id);
            if let Outcome::Finished(result, node_dead) = outcome {
                let newly_ready = self.node_done(id, result, node_dead);
                self.schedule(newly_ready, &mut ready);
            }
        }
    }

    /// Keeps the first ready node for the current thread, hands the rest to the runner.
    fn schedule(self: &Arc<Self>, newly_ready: Vec<usize>, inline: &mut VecDeque<usize>) {
        for id in newly_ready {
            if inline.is_empty() {
                inline.push_back(id);
            } else {
                let s = self.clone();
                (self.args.runner)(Box::new(move || s.process(id)));
            }
        }
    }

    fn run_node(self: &Arc<Self>, id: usize) -> Outcome {
        let node = &self.exec.nodes[id];
        let (inputs, control_dead) = {
            let mut frame = self.frame.lock();
            if frame.status.is_err() {
                return Outcome::Finished(Ok(vec![None; node.outputs.len()]), true);
            }
            (std::mem::take(&mut frame.inputs[id]), frame.control_dead[id])
        };
        if self.args.cancellation.is_cancelling() {
            return Outcome::Finished(Err(SessionError::cancelled("Step was cancelled")), true);
        }

        let any_dead = inputs.iter().any(Option::is_none);
        let dead = if node.is_merge {
            control_dead || (!inputs.is_empty() && inputs.iter().all(Option::is_none))
        } else {
            control_dead || (any_dead && !accepts_dead_inputs(&node.info.op))
        };
        if dead {
            trace!(node = %node.info.name, "skipping dead node");
            return Outcome::Finished(Ok(vec![None; node.outputs.len()]), true);
        }

        let ctx = OpKernelContext {
            node: node.info.clone(),
            inputs,
            args: self.args.clone(),
        };
        let start_micros = now_micros();
        let started = Instant::now();
        match &node.kernel {
            Kernel::Sync(kernel) => {
                let result = kernel.compute(&ctx);
                self.record_stats(id, start_micros, started, &result);
                Outcome::Finished(result, false)
            }
            Kernel::Async(kernel) => {
                let s = self.clone();
                kernel.compute_async(
                    ctx,
                    Box::new(move |result| {
                        s.record_stats(id, start_micros, started, &result);
                        let newly_ready = s.node_done(id, result, false);
                        let mut inline = VecDeque::new();
                        s.schedule(newly_ready, &mut inline);
                        if let Some(next) = inline.pop_front() {
                            let runner_state = s.clone();
                            (s.args.runner)(Box::new(move || runner_state.process(next)));
                        }
                    }),
                );
                Outcome::Pending
            }
        }
    }

    fn record_stats(&self, id: usize, start_micros: u64, started: Instant, result: &Result<KernelOutputs>) {
        let Some(collector) = &self.args.stats_collector else {
            return;
        };
        let node = &self.exec.nodes[id];
        let output_bytes = result
            .as_ref()
            .map(|outs| outs.iter().flatten().map(Tensor::allocated_bytes).sum::<usize>())
            .unwrap_or(0);
        collector.record(
            &self.exec.device,
            NodeExecStats {
                node_name: node.info.name.clone(),
                op: node.info.op.clone(),
                start_micros,
                elapsed_micros: started.elapsed().as_micros() as u64,
                output_bytes: output_bytes as u64,
            },
        );
    }

    /// Delivers a node's outputs and returns the consumers that became ready.
    fn node_done(&self, id: usize, result: Result<KernelOutputs>, node_dead: bool) -> Vec<usize> {
        let node = &self.exec.nodes[id];
        let result = result.and_then(|outputs| {
            if outputs.len() == node.outputs.len() {
                Ok(outputs)
            } else {
                Err(SessionError::internal(format!(
                    "Kernel for '{}' produced {} outputs, expected {}",
                    node.info.name,
                    outputs.len(),
                    node.outputs.len()
                )))
            }
        });

        let mut ready = Vec::new();
        let mut failure = None;
        let finished = {
            let mut frame = self.frame.lock();
            match result {
                Err(e) => {
                    let e = e.with_context(format!("[[node {}]]", node.info.name));
                    if frame.status.is_ok() {
                        failure = Some(e.clone());
                    }
                    update_status(&mut frame.status, Err(e));
                }
                Ok(outputs) if frame.status.is_ok() => {
                    for (slot, value) in outputs.into_iter().enumerate() {
                        for edge in &node.outputs[slot] {
                            frame.inputs[edge.dst][edge.dst_input] = value.clone();
                            frame.pending[edge.dst] -= 1;
                            if frame.pending[edge.dst] == 0 {
                                ready.push(edge.dst);
                            }
                        }
                    }
                    for &dst in &node.control_outputs {
                        if node_dead {
                            frame.control_dead[dst] = true;
                        }
                        frame.pending[dst] -= 1;
                        if frame.pending[dst] == 0 {
                            ready.push(dst);
                        }
                    }
                }
                Ok(_) => {}
            }
            frame.outstanding = frame.outstanding + ready.len() - 1;
            frame.outstanding == 0
        };

        if let Some(status) = failure {
            debug!(device = %self.exec.device, error = %status, "partition failed");
            self.args.rendezvous.start_abort(status.clone());
            if let Some(c) = &self.args.collective_executor {
                c.start_abort(status);
            }
        }
        if finished {
            self.finish();
        }
        ready
    }

    fn finish(&self) {
        let (status, done) = {
            let mut frame = self.frame.lock();
            (frame.status.clone(), frame.done.take())
        };
        self.args.cancellation.try_deregister_callback(self.token);
        if let Some(done) = done {
            done(status);
        }
    }
}
