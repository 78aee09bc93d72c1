//! End-to-end tests for `DirectSession`: plain runs, partial runs, callables,
//! timeouts, cancellation and instrumentation.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dataflow_ir::{DataType, GraphDef, NodeDef, OpDef, OpRegistry, Tensor};
use dataflow_session::*;

fn session_with(config: SessionConfig, cpus: u32) -> DirectSession {
    DirectSession::new(
        config,
        Arc::new(DeviceMgr::with_cpus(cpus).unwrap()),
        SessionResources::new(),
    )
    .unwrap()
}

fn session() -> DirectSession {
    session_with(SessionConfig::default(), 1)
}

/// `y = a + b`, `z = y * y`.
fn add_graph() -> GraphDef {
    GraphDef::new()
        .with_node(NodeDef::placeholder("a", DataType::Float))
        .with_node(NodeDef::placeholder("b", DataType::Float))
        .with_node(NodeDef::binary("y", "Add", "a", "b"))
        .with_node(NodeDef::binary("z", "Mul", "y", "y"))
}

fn feeds(a: f64, b: f64) -> Vec<(&'static str, Tensor)> {
    vec![("a", Tensor::scalar_f64(a)), ("b", Tensor::scalar_f64(b))]
}

#[test]
fn test_run_add_in_any_feed_order() {
    let s = session();
    s.create(add_graph()).unwrap();

    let out = s.run(&feeds(2.0, 3.0), &["y"], &[]).unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(5.0));

    let reversed = vec![("b", Tensor::scalar_f64(3.0)), ("a", Tensor::scalar_f64(2.0))];
    let out = s.run(&reversed, &["z", "y"], &[]).unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(25.0));
    assert_eq!(out[1].scalar_value_f64(), Some(5.0));

    // Both orders share one plan.
    let out = s.run(&reversed, &["y", "z"], &[]).unwrap();
    assert_eq!(out[1].scalar_value_f64(), Some(25.0));
    assert_eq!(s.cache_stats().misses, 2);
}

#[test]
fn test_duplicate_fetch_returns_value_twice() {
    let s = session();
    s.create(add_graph()).unwrap();
    let out = s.run(&feeds(1.0, 2.0), &["y", "y:0"], &[]).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].scalar_value_f64(), Some(3.0));
    assert_eq!(out[1].scalar_value_f64(), Some(3.0));
}

#[test]
fn test_unfed_placeholder_reports_node() {
    let s = session();
    s.create(add_graph()).unwrap();
    let err = s.run(&[("a", Tensor::scalar_f64(1.0))], &["y"], &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(err.message().contains("You must feed a value for placeholder tensor 'b'"));
}

#[test]
fn test_unknown_fetch_is_not_found() {
    let s = session();
    s.create(add_graph()).unwrap();
    let err = s.run(&feeds(1.0, 1.0), &["nope"], &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn test_feed_type_mismatch() {
    let s = session();
    s.create(add_graph()).unwrap();
    let err = s
        .run(
            &[("a", Tensor::scalar_i64(1)), ("b", Tensor::scalar_f64(1.0))],
            &["y"],
            &[],
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

#[test]
fn test_extend_adds_nodes() {
    let s = session();
    s.extend(add_graph()).unwrap();
    s.extend(GraphDef::new().with_node(NodeDef::binary("w", "Sub", "z", "a")))
        .unwrap();
    let out = s.run(&feeds(1.0, 2.0), &["w"], &[]).unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(8.0));

    let err = s
        .extend(GraphDef::new().with_node(NodeDef::placeholder("a", DataType::Float)))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

#[test]
fn test_stateful_kernel_shared_across_plans() {
    let s = session();
    s.create(
        GraphDef::new()
            .with_node(NodeDef::new("c", "Counter"))
            .with_node(NodeDef::new("t", "NoOp")),
    )
    .unwrap();
    let first = s.run(&[], &["c"], &[]).unwrap();
    let second = s.run(&[], &["c"], &["t"]).unwrap();
    assert_eq!(first[0].scalar_value_i64(), Some(1));
    assert_eq!(second[0].scalar_value_i64(), Some(2));
}

#[test]
fn test_targets_only_run() {
    let s = session();
    s.create(add_graph().with_node(NodeDef::new("init", "NoOp")))
        .unwrap();
    let out = s.run(&[], &[], &["init"]).unwrap();
    assert!(out.is_empty());
}

#[test]
fn test_cross_device_transfer() {
    let s = session_with(SessionConfig::default(), 2);
    s.create(
        GraphDef::new()
            .with_node(NodeDef::placeholder("a", DataType::Float))
            .with_node(NodeDef::placeholder("b", DataType::Float))
            .with_node(NodeDef::binary("y", "Add", "a", "b").with_device("/device:CPU:1"))
            .with_node(NodeDef::binary("z", "Mul", "y", "a")),
    )
    .unwrap();
    let (out, metadata) = s
        .run_with_options(
            &RunOptions {
                output_partition_graphs: true,
                ..Default::default()
            },
            &feeds(2.0, 3.0),
            &["z"],
            &[],
        )
        .unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(10.0));
    assert_eq!(metadata.partition_graphs.len(), 2);
    let sends = metadata
        .partition_graphs
        .iter()
        .flat_map(|g| g.nodes.iter())
        .filter(|n| n.op == "_Send")
        .count();
    assert!(sends >= 2);
}

#[test]
fn test_trace_and_cost_model() {
    let mut config = SessionConfig::default();
    config.graph_options.build_cost_model = 1;
    let s = session_with(config, 1);
    s.create(add_graph()).unwrap();

    let (_, metadata) = s
        .run_with_options(
            &RunOptions {
                trace_level: TraceLevel::FullTrace,
                ..Default::default()
            },
            &feeds(1.0, 2.0),
            &["z"],
            &[],
        )
        .unwrap();
    let stats = metadata.step_stats.unwrap();
    assert!(stats.num_nodes() >= 2);
    let cost = metadata.cost_graph.unwrap();
    assert!(cost.nodes.iter().any(|n| n.name == "z"));

    let (_, untraced) = s
        .run_with_options(&RunOptions::default(), &feeds(1.0, 2.0), &["z"], &[])
        .unwrap();
    assert!(untraced.step_stats.is_none());
    assert!(untraced.cost_graph.is_some());
}

#[test]
fn test_invalid_thread_pool_index() {
    let s = session();
    s.create(add_graph()).unwrap();
    for index in [-2, 1] {
        let err = s
            .run_with_options(
                &RunOptions {
                    inter_op_thread_pool: index,
                    ..Default::default()
                },
                &feeds(1.0, 1.0),
                &["y"],
                &[],
            )
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::invalid_argument(format!("Invalid inter_op_thread_pool: {}", index))
        );
    }
}

#[test]
fn test_scheduling_variants() {
    let inline = session_with(
        SessionConfig {
            executor_policy: ExecutorPolicy::Inline,
            ..Default::default()
        },
        2,
    );
    let pooled = session_with(
        SessionConfig {
            session_inter_op_thread_pools: vec![
                ThreadPoolOptions {
                    num_threads: 2,
                    global_name: None,
                },
                ThreadPoolOptions {
                    num_threads: 1,
                    global_name: None,
                },
            ],
            ..Default::default()
        },
        1,
    );
    let options = [
        RunOptions::default(),
        RunOptions {
            inter_op_thread_pool: -1,
            ..Default::default()
        },
        RunOptions {
            use_run_handler_pool: true,
            ..Default::default()
        },
    ];
    for s in [&inline, &pooled] {
        s.create(add_graph()).unwrap();
        for run_options in &options {
            let (out, _) = s
                .run_with_options(run_options, &feeds(4.0, 5.0), &["y"], &[])
                .unwrap();
            assert_eq!(out[0].scalar_value_f64(), Some(9.0));
        }
    }
    let (out, _) = pooled
        .run_with_options(
            &RunOptions {
                inter_op_thread_pool: 1,
                use_run_handler_pool: true,
                ..Default::default()
            },
            &feeds(1.0, 1.0),
            &["y"],
            &[],
        )
        .unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(2.0));
}

#[test]
fn test_concurrent_runs_share_plans() {
    let s = session();
    s.create(add_graph()).unwrap();
    thread::scope(|scope| {
        for i in 0..8 {
            let s = &s;
            scope.spawn(move || {
                let a = i as f64;
                let order = if i % 2 == 0 {
                    vec![("a", Tensor::scalar_f64(a)), ("b", Tensor::scalar_f64(1.0))]
                } else {
                    vec![("b", Tensor::scalar_f64(1.0)), ("a", Tensor::scalar_f64(a))]
                };
                for _ in 0..10 {
                    let out = s.run(&order, &["y"], &[]).unwrap();
                    assert_eq!(out[0].scalar_value_f64(), Some(a + 1.0));
                }
            });
        }
    });
    let stats = s.cache_stats();
    assert_eq!(stats.misses, stats.builds_discarded + 1);
}

#[test]
fn test_close_cancels_later_calls() {
    let s = session();
    s.create(add_graph()).unwrap();
    s.close().unwrap();
    let closed = SessionError::cancelled("Session has been closed.");
    assert_eq!(s.run(&feeds(1.0, 1.0), &["y"], &[]).unwrap_err(), closed);
    assert_eq!(s.prun_setup(&["a"], &["y"], &[]).unwrap_err(), closed);
    assert_eq!(s.run_callable(0, Vec::new()).unwrap_err(), closed);
}

struct SleepOp(Duration);

impl OpKernel for SleepOp {
    fn compute(&self, ctx: &OpKernelContext) -> Result<KernelOutputs> {
        thread::sleep(self.0);
        Ok(vec![Some(ctx.input(0)?.clone())])
    }
}

fn sleepy_session(config: SessionConfig) -> DirectSession {
    let mut ops = OpRegistry::with_builtins();
    ops.register(OpDef::new("Sleep", 1, |ctx| Ok(vec![ctx.input_types[0]])))
        .unwrap();
    let mut kernels = KernelRegistry::with_builtins();
    kernels
        .register("Sleep", |_| Ok(Kernel::sync(SleepOp(Duration::from_millis(300)))))
        .unwrap();
    let s = DirectSession::with_registries(
        config,
        Arc::new(DeviceMgr::with_cpus(1).unwrap()),
        SessionResources::new(),
        ops,
        kernels,
    )
    .unwrap();
    s.create(
        GraphDef::new()
            .with_node(NodeDef::placeholder("a", DataType::Float))
            .with_node(NodeDef::new("s", "Sleep").with_input("a")),
    )
    .unwrap();
    s
}

#[test]
fn test_run_timeout() {
    let s = sleepy_session(SessionConfig::default());
    let err = s
        .run_with_options(
            &RunOptions {
                timeout_ms: 20,
                ..Default::default()
            },
            &[("a", Tensor::scalar_f64(1.0))],
            &["s"],
            &[],
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeadlineExceeded);

    // Only the timed-out step was cancelled.
    let out = s.run(&[("a", Tensor::scalar_f64(1.0))], &["s"], &[]).unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(1.0));
}

#[test]
fn test_operation_timeout_applies_without_run_timeout() {
    let s = sleepy_session(SessionConfig {
        operation_timeout_ms: 20,
        ..Default::default()
    });
    let err = s.run(&[("a", Tensor::scalar_f64(1.0))], &["s"], &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
}

#[test]
fn test_close_during_run() {
    let s = sleepy_session(SessionConfig::default());
    thread::scope(|scope| {
        let runner = scope.spawn(|| s.run(&[("a", Tensor::scalar_f64(1.0))], &["s"], &[]));
        thread::sleep(Duration::from_millis(50));
        s.close().unwrap();
        let err = runner.join().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    });
}

#[test]
fn test_partial_run_incremental() {
    let s = session();
    s.create(add_graph()).unwrap();
    let handle = s.prun_setup(&["a", "b"], &["y", "z"], &[]).unwrap();
    assert_eq!(s.num_partial_runs(), 1);

    let err = s.prun(&handle, &[("a", Tensor::scalar_f64(2.0))], &["y"]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(err.message().contains("can't be computed from the feeds that have been fed so far"));

    let y = s.prun(&handle, &feeds(2.0, 3.0), &["y"]).unwrap();
    assert_eq!(y[0].scalar_value_f64(), Some(5.0));
    assert_eq!(s.num_partial_runs(), 1);

    let z = s.prun(&handle, &[], &["z"]).unwrap();
    assert_eq!(z[0].scalar_value_f64(), Some(25.0));
    assert_eq!(s.num_partial_runs(), 0);
}

#[test]
fn test_partial_run_validation() {
    let s = session();
    s.create(add_graph()).unwrap();

    let err = s.prun("a->y//1/;7", &[], &["y"]).unwrap_err();
    assert_eq!(
        err,
        SessionError::invalid_argument("Must run 'setup' before performing partial runs!")
    );

    let handle = s.prun_setup(&["a", "b"], &["y", "z"], &[]).unwrap();
    let err = s.prun(&handle, &[("c", Tensor::scalar_f64(1.0))], &[]).unwrap_err();
    assert_eq!(err.message(), "The feed c was not specified in partial_run_setup.");
    let err = s.prun(&handle, &[], &["w"]).unwrap_err();
    assert_eq!(err.message(), "The fetch w was not specified in partial_run_setup.");

    s.prun(&handle, &feeds(1.0, 1.0), &["y"]).unwrap();
    let err = s.prun(&handle, &[("a", Tensor::scalar_f64(1.0))], &[]).unwrap_err();
    assert_eq!(err.message(), "The feed a has already been fed.");
    let err = s.prun(&handle, &[], &["y"]).unwrap_err();
    assert_eq!(err.message(), "The fetch y has already been fetched.");
}

#[test]
fn test_partial_run_rejects_repeated_names_in_one_call() {
    let s = session();
    s.create(add_graph()).unwrap();
    let handle = s.prun_setup(&["a", "b"], &["y"], &[]).unwrap();

    let repeated_feed = vec![
        ("a", Tensor::scalar_f64(1.0)),
        ("a", Tensor::scalar_f64(100.0)),
        ("b", Tensor::scalar_f64(3.0)),
    ];
    let err = s.prun(&handle, &repeated_feed, &["y"]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(err.message(), "Feed 'a' is specified more than once");

    let err = s.prun(&handle, &feeds(2.0, 3.0), &["y", "y"]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(err.message(), "Fetch 'y' is specified more than once");

    // Rejected calls leave the step untouched.
    let out = s.prun(&handle, &feeds(2.0, 3.0), &["y"]).unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(5.0));
    assert_eq!(s.num_partial_runs(), 0);
}

#[test]
fn test_partial_run_handles_are_unique() {
    let s = session();
    s.create(add_graph()).unwrap();
    let h1 = s.prun_setup(&["a", "b"], &["y"], &[]).unwrap();
    let h2 = s.prun_setup(&["b", "a"], &["y"], &[]).unwrap();
    assert_ne!(h1, h2);
    let y1 = s.prun(&h1, &feeds(1.0, 2.0), &["y"]).unwrap();
    let y2 = s.prun(&h2, &feeds(10.0, 20.0), &["y"]).unwrap();
    assert_eq!(y1[0].scalar_value_f64(), Some(3.0));
    assert_eq!(y2[0].scalar_value_f64(), Some(30.0));
}

#[test]
fn test_drop_with_unfinished_partial_run() {
    let s = session();
    s.create(add_graph()).unwrap();
    let handle = s.prun_setup(&["a", "b"], &["y"], &[]).unwrap();
    s.prun(&handle, &[("a", Tensor::scalar_f64(1.0))], &[]).unwrap();
    // Must not hang on the executor still waiting for `b`.
    drop(s);
}

#[test]
fn test_callable_lifecycle() {
    let s = session();
    s.create(add_graph()).unwrap();
    let handle = s
        .make_callable(CallableOptions::new(["a", "b"], ["z", "y"], Vec::<String>::new()))
        .unwrap();
    let (out, _) = s
        .run_callable(handle, vec![Tensor::scalar_f64(1.0), Tensor::scalar_f64(2.0)])
        .unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(9.0));
    assert_eq!(out[1].scalar_value_f64(), Some(3.0));

    let err = s.run_callable(handle, vec![Tensor::scalar_f64(1.0)]).unwrap_err();
    assert_eq!(err.message(), "Expected 2 feed tensors, but got 1");

    let err = s.run_callable(handle + 1, Vec::new()).unwrap_err();
    assert_eq!(err.message(), format!("No such callable handle: {}", handle + 1));

    s.release_callable(handle).unwrap();
    assert_eq!(s.num_callables(), 0);
    let err = s.run_callable(handle, Vec::new()).unwrap_err();
    assert_eq!(
        err.message(),
        format!("Attempted to run callable after handle was released: {}", handle)
    );
    assert!(s.release_callable(handle + 5).is_err());
}

#[test]
fn test_callable_with_trace_options() {
    let s = session();
    s.create(add_graph()).unwrap();
    let options = CallableOptions::new(["a", "b"], ["y"], Vec::<String>::new()).with_run_options(
        RunOptions {
            trace_level: TraceLevel::SoftwareTrace,
            ..Default::default()
        },
    );
    let handle = s.make_callable(options).unwrap();
    let (_, metadata) = s
        .run_callable(handle, vec![Tensor::scalar_f64(1.0), Tensor::scalar_f64(2.0)])
        .unwrap();
    assert!(metadata.step_stats.is_some());
}

#[test]
fn test_session_handles_roundtrip() {
    let s = session();
    s.create(add_graph().with_node(NodeDef::new("h", "GetSessionHandle").with_input("y")))
        .unwrap();
    let out = s.run(&feeds(2.0, 3.0), &["h"], &[]).unwrap();
    assert_eq!(out[0].dtype(), DataType::Resource);
    assert_eq!(s.session_state().len(), 1);

    // Feed the retained value back by handle.
    let fed = vec![("a", out[0].clone()), ("b", Tensor::scalar_f64(1.0))];
    let again = s.run(&fed, &["y"], &[]).unwrap();
    assert_eq!(again[0].scalar_value_f64(), Some(6.0));
}

#[test]
fn test_debug_watches_publish_to_sink() {
    let s = session();
    s.create(add_graph()).unwrap();
    let run_options = RunOptions {
        debug_options: DebugOptions {
            watches: vec![DebugTensorWatch {
                node_name: "y".into(),
                output_slot: 0,
                debug_ops: vec!["DebugIdentity".into()],
                debug_urls: vec!["mem://watch".into()],
            }],
            global_step: 0,
        },
        ..Default::default()
    };

    let err = s
        .run_with_options(&run_options, &feeds(1.0, 2.0), &["z"], &[])
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);

    let sink = Arc::new(InMemoryDebugSink::new());
    s.set_debug_sink(sink.clone());
    let (out, _) = s
        .run_with_options(&run_options, &feeds(1.0, 2.0), &["z"], &[])
        .unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(9.0));
    assert_eq!(sink.graphs().len(), 1);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].watched_tensor, "y:0");
    assert_eq!(events[0].tensor.scalar_value_f64(), Some(3.0));
}

fn collective_graph() -> GraphDef {
    let reduce = |name: &str, input: &str, device: &str| {
        NodeDef::new(name, "CollectiveReduce")
            .with_input(input)
            .with_device(device)
            .with_attr("instance_key", 7i64)
            .with_attr("group_size", 2i64)
    };
    GraphDef::new()
        .with_node(NodeDef::placeholder("a", DataType::Float))
        .with_node(NodeDef::placeholder("b", DataType::Float).with_device("/device:CPU:1"))
        .with_node(reduce("r0", "a", "/device:CPU:0"))
        .with_node(reduce("r1", "b", "/device:CPU:1"))
}

#[test]
fn test_collective_reduce_across_devices() {
    let s = session_with(SessionConfig::default(), 2);
    s.create(collective_graph()).unwrap();
    let out = s.run(&feeds(1.5, 2.5), &["r0", "r1"], &[]).unwrap();
    assert_eq!(out[0].scalar_value_f64(), Some(4.0));
    assert_eq!(out[1].scalar_value_f64(), Some(4.0));

    let err = s
        .run_with_options(
            &RunOptions {
                collective_graph_key: 12345,
                ..Default::default()
            },
            &feeds(1.0, 1.0),
            &["r0", "r1"],
            &[],
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.message().contains("should match collective_graph_key"));
}

#[test]
fn test_list_devices_and_config_file() {
    let s = session_with(SessionConfig::default(), 2);
    let devices = s.list_devices().unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices[1].name.ends_with("CPU:1"));

    let config = SessionConfig::from_toml_str(
        r#"
        inter_op_parallelism_threads = 2
        [graph_options.optimizer]
        do_constant_folding = false
        "#,
    )
    .unwrap();
    let s = session_with(config, 1);
    s.create(add_graph()).unwrap();
    assert_eq!(
        s.run(&feeds(1.0, 1.0), &["y"], &[]).unwrap()[0].scalar_value_f64(),
        Some(2.0)
    );
}
