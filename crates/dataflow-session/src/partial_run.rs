//! Partial runs: one step whose feeds and fetches arrive over several calls.
//!
//! `prun_setup` starts every partition of the plan with the session's
//! rendezvous keys for the declared feeds and fetches. Each `prun` sends some
//! feeds, receives some fetches, and the step is retired once every declared
//! name has been satisfied.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dataflow_ir::{DataType, NodeId, Tensor, TensorId};
use tracing::{debug, warn};

use crate::barrier::ExecutorBarrier;
use crate::config::RunOptions;
use crate::error::{Result, SessionError};
use crate::executor::{Closure, ExecutorArgs, Runner};
use crate::executors_and_keys::ExecutorsAndKeys;
use crate::rendezvous::{ParsedKey, Rendezvous, RendezvousValue};
use crate::run_state::RunState;
use crate::session::{next_step_id, DirectSession};
use crate::session_state::resource_handle_to_input_tensor;
use crate::step_stats::StepStatsCollector;

/// The cache key a partial-run handle was minted from.
fn handle_key(handle: &str) -> &str {
    handle.rsplit_once(';').map_or(handle, |(key, _)| key)
}

fn setup_required() -> SessionError {
    SessionError::invalid_argument("Must run 'setup' before performing partial runs!")
}

impl DirectSession {
    /// Starts a partial run and returns its handle.
    pub fn prun_setup(&self, inputs: &[&str], outputs: &[&str], targets: &[&str]) -> Result<String> {
        self.check_not_closed()?;
        self.check_graph_created("PRunSetup()")?;

        let pool = self
            .thread_pools
            .first()
            .cloned()
            .ok_or_else(|| SessionError::internal("Session has no inter-op thread pool"))?;

        let input_names: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
        let output_names: Vec<String> = outputs.iter().map(|s| s.to_string()).collect();
        let target_names: Vec<String> = targets.iter().map(|s| s.to_string()).collect();
        let entry = self.get_or_create_executors(
            &input_names,
            &output_names,
            &target_names,
            true,
            &RunOptions::default(),
        )?;
        let ek = entry.value;
        let counter = self
            .handle_name_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let handle = format!("{};{}", entry.key, counter);

        let step_id = next_step_id();
        let collector = (self.config.graph_options.build_cost_model > 0)
            .then(|| Arc::new(StepStatsCollector::new()));
        let run_state = Arc::new(
            RunState::for_partial_run(step_id, &input_names, &output_names).with_collector(collector.clone()),
        );

        {
            let mut partial_runs = self.partial_runs.lock();
            if partial_runs.contains_key(&handle) {
                return Err(SessionError::internal(format!(
                    "The handle '{}' created for this partial run is not unique.",
                    handle
                )));
            }
            partial_runs.insert(handle.clone(), run_state.clone());
        }

        let barrier = ExecutorBarrier::new(
            ek.items.len(),
            run_state.rendezvous(),
            run_state.barrier_callback(),
        );
        let runner: Runner = Arc::new(move |work: Closure| pool.schedule(work));
        let args = ExecutorArgs {
            step_id,
            rendezvous: run_state.rendezvous(),
            call_frame: None,
            cancellation: self.cancellation_manager.clone(),
            runner,
            session_state: self.session_state.clone(),
            tensor_store: run_state.tensor_store.clone(),
            step_container: run_state.step_container.clone(),
            stats_collector: collector,
            collective_executor: None,
            debug_sink: self.debug_sink.read().clone(),
        };
        for item in &ek.items {
            let mut item_args = args.clone();
            if let Some(device_pool) = item.device.thread_pool() {
                item_args.runner = Arc::new(move |work: Closure| device_pool.schedule(work));
            }
            item.executor.run_async(item_args, barrier.get());
        }
        debug!(handle = %handle, step_id, "partial run started");
        Ok(handle)
    }

    /// Feeds `feeds` into, and fetches `fetches` from, the partial run `handle`.
    pub fn prun(&self, handle: &str, feeds: &[(&str, Tensor)], fetches: &[&str]) -> Result<Vec<Tensor>> {
        self.check_not_closed()?;
        let ek = self.executors.get(handle_key(handle)).ok_or_else(setup_required)?;
        let run_state = self
            .partial_runs
            .lock()
            .get(handle)
            .cloned()
            .ok_or_else(setup_required)?;

        let mut seen = HashSet::with_capacity(feeds.len());
        for (name, _) in feeds {
            if !seen.insert(*name) {
                return Err(SessionError::invalid_argument(format!(
                    "Feed '{}' is specified more than once",
                    name
                )));
            }
        }
        seen.clear();
        for name in fetches {
            if !seen.insert(*name) {
                return Err(SessionError::invalid_argument(format!(
                    "Fetch '{}' is specified more than once",
                    name
                )));
            }
        }

        {
            let pending = run_state.pending();
            for (name, _) in feeds {
                match pending.inputs.get(*name) {
                    None => {
                        return Err(SessionError::invalid_argument(format!(
                            "The feed {} was not specified in partial_run_setup.",
                            name
                        )))
                    }
                    Some(true) => {
                        return Err(SessionError::invalid_argument(format!(
                            "The feed {} has already been fed.",
                            name
                        )))
                    }
                    Some(false) => {}
                }
            }
            for name in fetches {
                match pending.outputs.get(*name) {
                    None => {
                        return Err(SessionError::invalid_argument(format!(
                            "The fetch {} was not specified in partial_run_setup.",
                            name
                        )))
                    }
                    Some(true) => {
                        return Err(SessionError::invalid_argument(format!(
                            "The fetch {} has already been fetched.",
                            name
                        )))
                    }
                    Some(false) => {}
                }
            }
        }

        self.check_fetch(feeds, fetches, &ek, &run_state)?;
        self.send_prun_inputs(feeds, &ek, &run_state)?;
        let outputs = self.recv_prun_outputs(fetches, &ek, &run_state)?;

        let output_names: Vec<String> = fetches.iter().map(|s| s.to_string()).collect();
        let saved = run_state
            .tensor_store
            .save_tensors(&output_names, &self.session_state);

        let done = match &saved {
            Ok(()) => {
                if let Err(e) = run_state.status() {
                    warn!(handle, error = %e, "An error unrelated to this prun has been detected.");
                }
                let mut pending = run_state.pending();
                for (name, _) in feeds {
                    pending.inputs.insert(name.to_string(), true);
                }
                for name in fetches {
                    pending.outputs.insert(name.to_string(), true);
                }
                pending.done()
            }
            Err(_) => true,
        };
        if done {
            self.wait_for_executors(&run_state);
            self.partial_runs.lock().remove(handle);
            debug!(handle, "partial run finished");
        }
        saved.map(|()| outputs)
    }

    fn wait_for_executors(&self, run_state: &RunState) {
        if self.operation_timeout_ms == 0 {
            run_state.executors_done.wait();
            return;
        }
        let timeout = Duration::from_millis(self.operation_timeout_ms);
        if !run_state.executors_done.wait_for_timeout(timeout) {
            let status = SessionError::deadline_exceeded("Timed out waiting for notification");
            run_state.update_status(Err(status.clone()));
            run_state.rendezvous.start_abort(status);
            run_state.executors_done.wait();
        }
    }

    /// Fails if a fetch still depends on a declared feed that has not been fed.
    fn check_fetch(
        &self,
        feeds: &[(&str, Tensor)],
        fetches: &[&str],
        ek: &ExecutorsAndKeys,
        run_state: &RunState,
    ) -> Result<()> {
        let graph = ek
            .graph
            .as_ref()
            .ok_or_else(|| SessionError::internal("Partial run plan has no client graph"))?;

        let mut pending_feeds: HashSet<TensorId> = HashSet::new();
        {
            let pending = run_state.pending();
            for (name, fed) in &pending.inputs {
                if *fed {
                    continue;
                }
                let id = TensorId::parse(name)?;
                if !ek.name_to_node.contains_key(&id.node) {
                    return Err(SessionError::not_found(format!("Feed {}: not found", name)));
                }
                pending_feeds.insert(id);
            }
        }
        for (name, _) in feeds {
            pending_feeds.remove(&TensorId::parse(name)?);
        }

        let mut stack: Vec<NodeId> = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            let id = TensorId::parse(fetch)?;
            match ek.name_to_node.get(&id.node) {
                Some(node) => stack.push(*node),
                None => return Err(SessionError::not_found(format!("Fetch {}: not found", fetch))),
            }
        }

        let mut visited: HashSet<NodeId> = HashSet::new();
        while let Some(id) = stack.pop() {
            for edge in graph.in_edges(id) {
                let Some(src) = graph.node(edge.src) else {
                    continue;
                };
                if !edge.is_control
                    && pending_feeds.contains(&TensorId::new(src.name.as_str(), edge.src_output))
                {
                    return Err(SessionError::invalid_argument(format!(
                        "Fetch {}:{} can't be computed from the feeds that have been fed so far.",
                        src.name, edge.src_output
                    )));
                }
                if visited.insert(edge.src) {
                    stack.push(edge.src);
                }
            }
        }
        Ok(())
    }

    fn send_prun_inputs(
        &self,
        feeds: &[(&str, Tensor)],
        ek: &ExecutorsAndKeys,
        run_state: &RunState,
    ) -> Result<()> {
        let rendezvous = run_state.rendezvous();
        for (name, tensor) in feeds {
            let key = ek.input_name_to_rendezvous_key.get(*name).ok_or_else(|| {
                SessionError::internal(format!("'{}' is not a pre-defined feed.", name))
            })?;
            let sent = ParsedKey::parse(key).and_then(|parsed| {
                let tensor = if tensor.dtype() == DataType::Resource {
                    resource_handle_to_input_tensor(&self.session_state, tensor)?
                } else {
                    tensor.clone()
                };
                rendezvous.send(
                    &parsed,
                    RendezvousValue {
                        tensor,
                        is_dead: false,
                    },
                )
            });
            if let Err(e) = sent {
                rendezvous.start_abort(e.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    fn recv_prun_outputs(
        &self,
        fetches: &[&str],
        ek: &ExecutorsAndKeys,
        run_state: &RunState,
    ) -> Result<Vec<Tensor>> {
        let rendezvous = run_state.rendezvous();
        let timeout = (self.operation_timeout_ms > 0).then(|| Duration::from_millis(self.operation_timeout_ms));
        let mut outputs = Vec::with_capacity(fetches.len());
        for name in fetches {
            let key = ek.output_name_to_rendezvous_key.get(*name).ok_or_else(|| {
                SessionError::internal(format!("'{}' is not a pre-defined fetch.", name))
            })?;
            let received = ParsedKey::parse(key)
                .and_then(|parsed| rendezvous.recv(&parsed, timeout))
                .and_then(|value| {
                    if value.is_dead {
                        Err(SessionError::invalid_argument(format!(
                            "The tensor returned for {} was not valid.",
                            name
                        )))
                    } else {
                        Ok(value.tensor)
                    }
                });
            match received {
                Ok(tensor) => outputs.push(tensor),
                Err(e) => {
                    rendezvous.start_abort(e.clone());
                    return Err(e);
                }
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_key_strips_counter() {
        assert_eq!(handle_key("a,b->y//1/;3"), "a,b->y//1/");
        assert_eq!(handle_key("a->y//1/x:0:DebugIdentity;Other:mem://;12"), "a->y//1/x:0:DebugIdentity;Other:mem://");
        assert_eq!(handle_key("no-counter"), "no-counter");
    }
}
