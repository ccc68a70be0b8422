use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weave_core::config::{DuplicatePolicy, ExecutionMode, LockConfig, LogConfig, RuntimeConfig};
use weave_core::error::{ErrorKind, ValidationError, WeaveError};
use weave_core::types::{RunId, RunStatus, UnitStatus, WorkflowEvent};
use weave_engine::{
    open_store, ExecutionGraph, GraphBuilder, JsonStateStore, LockManager, Scheduler, StateStore,
};
use weave_test_utils::{diamond, runtime, temp_dir, tool_call, unit, workflow, ScriptedRunner, Step};
use weave_tools::{FnTool, ToolBroker};

fn graph(units: &[(&str, &[&str])]) -> ExecutionGraph {
    let mut builder = GraphBuilder::new();
    for (name, deps) in units {
        builder.add_unit(name, deps, &[]);
    }
    builder.build().unwrap()
}

fn diamond_graph() -> ExecutionGraph {
    graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])])
}

fn counting_echo(count: Arc<AtomicUsize>) -> FnTool {
    FnTool::new("echo", "Echo the arguments back", move |args| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Object(args))
        }
    })
}

#[tokio::test]
async fn sequential_runs_in_topological_order() {
    let runner = Arc::new(ScriptedRunner::new());
    let scheduler = Scheduler::new(
        "diamond",
        diamond_graph(),
        runtime(ExecutionMode::Sequential),
        runner.clone(),
    );

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(runner.probe().start_order(), vec!["a", "b", "c", "d"]);
    assert_eq!(runner.probe().max_concurrent(), 1);

    let d = &runner.requests_for("d")[0];
    assert_eq!(d.inputs.len(), 2);
    assert_eq!(d.inputs["b"], "b done");
    assert_eq!(d.inputs["c"], "c done");
    assert!(runner.requests_for("a")[0].inputs.is_empty());
    assert_eq!(run.output_of("d"), Some("d done"));
}

#[tokio::test(start_paused = true)]
async fn async_mode_never_exceeds_concurrency_cap() {
    let runner = Arc::new(ScriptedRunner::new().with_default_delay(Duration::from_millis(50)));
    let rt = RuntimeConfig {
        max_concurrent_agents: 2,
        ..runtime(ExecutionMode::Async)
    };
    let g = graph(&[("u1", &[]), ("u2", &[]), ("u3", &[]), ("u4", &[]), ("u5", &[])]);
    let scheduler = Scheduler::new("fanout", g, rt, runner.clone());

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.count(UnitStatus::Succeeded), 5);
    assert_eq!(runner.probe().max_concurrent(), 2);
}

#[tokio::test(start_paused = true)]
async fn parallel_mode_waits_for_level_barrier() {
    for (mode, c_starts_before_a_finishes) in
        [(ExecutionMode::Parallel, false), (ExecutionMode::Async, true)]
    {
        let runner = Arc::new(
            ScriptedRunner::new()
                .with_delay("a", Duration::from_millis(100))
                .with_delay("b", Duration::from_millis(10)),
        );
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &["b"])]);
        let scheduler = Scheduler::new("levels", g, runtime(mode), runner.clone());
        let mut rx = scheduler.events().subscribe();

        let run = scheduler.run().await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let c_started = events
            .iter()
            .position(|e| matches!(e, WorkflowEvent::UnitStarted { unit, .. } if unit == "c"))
            .unwrap();
        let a_finished = events
            .iter()
            .position(|e| matches!(e, WorkflowEvent::UnitFinished { unit, .. } if unit == "a"))
            .unwrap();
        assert_eq!(c_started < a_finished, c_starts_before_a_finishes, "mode {:?}", mode);
    }
}

#[tokio::test]
async fn failure_skips_only_dependents() {
    let runner = Arc::new(ScriptedRunner::new().script("b", vec![Step::Fail(ErrorKind::Tool)]));
    let g = graph(&[
        ("a", &[]),
        ("b", &["a"]),
        ("c", &["a"]),
        ("d", &["b", "c"]),
        ("e", &[]),
    ]);
    let scheduler = Scheduler::new("diamond", g, runtime(ExecutionMode::Async), runner.clone());

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.status_of("a"), Some(UnitStatus::Succeeded));
    assert_eq!(run.status_of("b"), Some(UnitStatus::Failed));
    assert_eq!(run.status_of("c"), Some(UnitStatus::Succeeded));
    assert_eq!(run.status_of("d"), Some(UnitStatus::Skipped));
    assert_eq!(run.status_of("e"), Some(UnitStatus::Succeeded));
    assert_eq!(run.outcome("b").unwrap().attempts, 1);
    assert!(run.outcome("d").unwrap().error.as_deref().unwrap().contains("'b'"));
    assert_eq!(runner.invocations("d"), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_on_error_aborts_the_run() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("a", vec![Step::Fail(ErrorKind::Tool)])
            .with_delay("b", Duration::from_secs(10)),
    );
    let rt = RuntimeConfig {
        stop_on_error: true,
        ..runtime(ExecutionMode::Async)
    };
    let g = graph(&[("a", &[]), ("b", &[]), ("c", &["a"])]);
    let scheduler = Scheduler::new("halting", g, rt, runner.clone());

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.status_of("a"), Some(UnitStatus::Failed));
    let b = run.outcome("b").unwrap();
    assert_eq!(b.status, UnitStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("Cancelled"));
    assert_eq!(run.status_of("c"), Some(UnitStatus::Skipped));
}

#[tokio::test]
async fn draining_without_continue_skips_unrelated_units() {
    let runner = Arc::new(ScriptedRunner::new().script("a", vec![Step::Fail(ErrorKind::Tool)]));
    let rt = RuntimeConfig {
        continue_on_agent_failure: false,
        ..runtime(ExecutionMode::Sequential)
    };
    let g = graph(&[("a", &[]), ("b", &[])]);
    let scheduler = Scheduler::new("drain", g, rt, runner.clone());

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.status_of("b"), Some(UnitStatus::Skipped));
    assert_eq!(runner.invocations("b"), 0);
}

#[tokio::test]
async fn retryable_failures_are_retried_until_success() {
    let runner = Arc::new(ScriptedRunner::new().script(
        "a",
        vec![
            Step::Fail(ErrorKind::RateLimit),
            Step::Fail(ErrorKind::Connection),
            Step::Complete("third time".into()),
        ],
    ));
    let scheduler = Scheduler::new(
        "flaky",
        graph(&[("a", &[])]),
        runtime(ExecutionMode::Parallel),
        runner.clone(),
    );
    let mut rx = scheduler.events().subscribe();

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    let a = run.outcome("a").unwrap();
    assert_eq!(a.attempts, 3);
    assert_eq!(a.output.as_deref(), Some("third time"));
    let attempts: Vec<u32> = runner.requests_for("a").iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);

    let mut retries = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, WorkflowEvent::UnitRetrying { .. }) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn non_retryable_failure_is_not_retried() {
    let runner = Arc::new(ScriptedRunner::new().script("a", vec![Step::Fail(ErrorKind::Validation)]));
    let scheduler = Scheduler::new(
        "strict",
        graph(&[("a", &[])]),
        runtime(ExecutionMode::Parallel),
        runner.clone(),
    );

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(runner.invocations("a"), 1);
    assert!(run.outcome("a").unwrap().error.as_deref().unwrap().contains("validation"));
}

#[tokio::test(start_paused = true)]
async fn unit_timeout_is_retried_then_exhausted() {
    let runner = Arc::new(ScriptedRunner::new().with_delay("a", Duration::from_secs(10)));
    let rt = RuntimeConfig {
        default_timeout: 1.0,
        max_retries: 1,
        ..runtime(ExecutionMode::Parallel)
    };
    let scheduler = Scheduler::new("slow", graph(&[("a", &[])]), rt, runner.clone());

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let a = run.outcome("a").unwrap();
    assert_eq!(a.attempts, 2);
    let error = a.error.as_deref().unwrap();
    assert!(error.contains("failed after 2 attempts"), "{}", error);
    assert!(error.contains("timed out"), "{}", error);
}

#[tokio::test(start_paused = true)]
async fn workflow_deadline_times_out_the_run() {
    let runner = Arc::new(ScriptedRunner::new().with_delay("a", Duration::from_secs(5)));
    let rt = RuntimeConfig {
        workflow_timeout: Some(1.0),
        ..runtime(ExecutionMode::Parallel)
    };
    let scheduler = Scheduler::new("deadline", graph(&[("a", &[]), ("b", &["a"])]), rt, runner);

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::TimedOut);
    let a = run.outcome("a").unwrap();
    assert_eq!(a.status, UnitStatus::Failed);
    assert!(a.error.as_deref().unwrap().contains("workflow 'deadline' timed out"));
    let b = run.outcome("b").unwrap();
    assert_eq!(b.status, UnitStatus::Skipped);
    assert_eq!(b.error.as_deref(), Some("workflow deadline elapsed"));
}

#[tokio::test(start_paused = true)]
async fn abort_handle_cancels_in_flight_units() {
    let runner = Arc::new(ScriptedRunner::new().with_delay("a", Duration::from_secs(60)));
    let scheduler = Scheduler::new(
        "abortable",
        graph(&[("a", &[]), ("b", &["a"])]),
        runtime(ExecutionMode::Parallel),
        runner,
    );
    let abort = scheduler.abort_handle();

    let (run, _) = tokio::join!(scheduler.run(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        abort.cancel();
    });
    let run = run.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.outcome("a").unwrap().error.as_deref(), Some("Cancelled"));
    assert_eq!(run.status_of("b"), Some(UnitStatus::Skipped));
}

#[tokio::test]
async fn tool_results_feed_the_next_round() {
    let count = Arc::new(AtomicUsize::new(0));
    let mut broker = ToolBroker::new(DuplicatePolicy::Reject, Duration::from_secs(5));
    broker.register(counting_echo(count.clone())).unwrap();

    let runner = Arc::new(ScriptedRunner::new().script(
        "a",
        vec![
            Step::ToolCalls(vec![
                tool_call("echo", serde_json::json!({"n": 1})),
                tool_call("echo", serde_json::json!({"n": 2})),
            ]),
            Step::Complete("summarised".into()),
        ],
    ));
    let mut builder = GraphBuilder::new();
    builder.add_unit("a", &[], &["echo"]);
    let scheduler = Scheduler::new(
        "tools",
        builder.build().unwrap(),
        runtime(ExecutionMode::Parallel),
        runner.clone(),
    )
    .with_broker(Arc::new(broker));

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(count.load(Ordering::SeqCst), 2);
    let a = run.outcome("a").unwrap();
    assert_eq!(a.tool_calls.len(), 2);
    assert!(a.tool_calls.iter().all(|r| r.success));

    let requests = runner.requests_for("a");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[1].round, 1);
    assert_eq!(requests[1].tool_results.len(), 2);
    assert_eq!(requests[1].tool_results[1].value, Some(serde_json::json!({"n": 2})));
}

#[tokio::test]
async fn undeclared_tool_never_reaches_its_handler() {
    let count = Arc::new(AtomicUsize::new(0));
    let mut broker = ToolBroker::new(DuplicatePolicy::Reject, Duration::from_secs(5));
    broker.register(counting_echo(count.clone())).unwrap();

    let runner = Arc::new(ScriptedRunner::new().script(
        "a",
        vec![
            Step::ToolCalls(vec![tool_call("echo", serde_json::json!({}))]),
            Step::Complete("carried on".into()),
        ],
    ));
    let scheduler = Scheduler::new(
        "sandboxed",
        graph(&[("a", &[])]),
        runtime(ExecutionMode::Parallel),
        runner.clone(),
    )
    .with_broker(Arc::new(broker));

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    let result = &run.outcome("a").unwrap().tool_calls[0];
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("not declared"));
    assert!(runner.requests_for("a")[0].tools.is_empty());
}

#[tokio::test]
async fn endless_tool_rounds_fail_the_unit() {
    let runner = Arc::new(ScriptedRunner::new().script(
        "a",
        vec![
            Step::ToolCalls(vec![tool_call("missing", serde_json::json!({}))]),
            Step::ToolCalls(vec![tool_call("missing", serde_json::json!({}))]),
        ],
    ));
    let rt = RuntimeConfig {
        max_tool_rounds: 1,
        ..runtime(ExecutionMode::Parallel)
    };
    let scheduler = Scheduler::new("loopy", graph(&[("a", &[])]), rt, runner.clone());

    let run = scheduler.run().await.unwrap();

    let a = run.outcome("a").unwrap();
    assert_eq!(a.status, UnitStatus::Failed);
    assert_eq!(a.attempts, 1);
    assert!(a.error.as_deref().unwrap().contains("exceeded 1 tool rounds"));
    assert_eq!(runner.invocations("a"), 2);
}

#[tokio::test]
async fn panicking_runner_fails_only_its_unit() {
    let runner = Arc::new(ScriptedRunner::new().script("a", vec![Step::Panic]));
    let scheduler = Scheduler::new(
        "panicky",
        graph(&[("a", &[]), ("b", &[])]),
        runtime(ExecutionMode::Parallel),
        runner,
    );

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.outcome("a").unwrap().error.as_deref(), Some("unit runner panicked"));
    assert_eq!(run.status_of("b"), Some(UnitStatus::Succeeded));
}

#[tokio::test]
async fn lock_contention_is_raised_before_any_unit_runs() {
    let dir = temp_dir();
    let holder = LockManager::new(dir.path(), &LockConfig::default());
    let guard = holder
        .acquire_lock("locked", &RunId::from_string("run-holding"))
        .unwrap();

    let runner = Arc::new(ScriptedRunner::new());
    let scheduler = Scheduler::new(
        "locked",
        graph(&[("a", &[])]),
        runtime(ExecutionMode::Parallel),
        runner.clone(),
    )
    .with_lock_manager(LockManager::new(dir.path(), &LockConfig::default()));

    match scheduler.run().await {
        Err(WeaveError::LockContention { holder_run, .. }) => assert_eq!(holder_run, "run-holding"),
        other => panic!("expected lock contention, got {:?}", other.map(|r| r.status)),
    }
    assert_eq!(runner.invocations("a"), 0);

    guard.release().unwrap();
    let run = scheduler.run().await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(holder.inspect("locked").unwrap().is_none());
}

#[tokio::test]
async fn partial_results_are_saved_and_reloadable() {
    let dir = temp_dir();
    let store = Arc::new(JsonStateStore::new(dir.path()).unwrap());
    let runner = Arc::new(ScriptedRunner::new().script("b", vec![Step::Fail(ErrorKind::Tool)]));
    let scheduler = Scheduler::new(
        "partial",
        graph(&[("a", &[]), ("b", &["a"])]),
        runtime(ExecutionMode::Parallel),
        runner,
    )
    .with_state_store(store.clone());

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.output_of("a"), Some("a done"));
    let loaded = store.load_state(&run.id).unwrap();
    assert_eq!(loaded, run);
    assert_eq!(store.list_runs("partial").unwrap()[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn outputs_are_dropped_when_partial_results_are_off() {
    let runner = Arc::new(ScriptedRunner::new().script("b", vec![Step::Fail(ErrorKind::Tool)]));
    let rt = RuntimeConfig {
        save_partial_results: false,
        ..runtime(ExecutionMode::Parallel)
    };
    let scheduler = Scheduler::new("lean", graph(&[("a", &[]), ("b", &[])]), rt, runner);

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.output_of("a"), None);
    assert_eq!(run.status_of("a"), Some(UnitStatus::Succeeded));
}

#[tokio::test]
async fn from_config_wires_state_locks_and_run_log() {
    let dir = temp_dir();
    let mut config = workflow("configured", runtime(ExecutionMode::Async), diamond(), dir.path());
    config.log = Some(LogConfig {
        enabled: true,
        dir: dir.path().join("logs").display().to_string(),
    });

    let runner = Arc::new(ScriptedRunner::new());
    let scheduler = Scheduler::from_config(&config, runner).unwrap();
    let run = scheduler.run().await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    let listed = open_store(&config.state).unwrap().list_runs("configured").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, run.id);

    let log = dir
        .path()
        .join("logs")
        .join("configured")
        .join(format!("{}.jsonl", run.id));
    let content = std::fs::read_to_string(log).unwrap();
    let last: serde_json::Value = serde_json::from_str(content.lines().last().unwrap()).unwrap();
    assert_eq!(last["event_type"], "run_finished");
    assert_eq!(content.lines().filter(|l| l.contains("unit_finished")).count(), 4);

    assert!(LockManager::from_config(&config.state)
        .inspect("configured")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn cyclic_workflow_is_rejected_at_construction() {
    let dir = temp_dir();
    let config = workflow(
        "cyclic",
        runtime(ExecutionMode::Parallel),
        vec![unit("a", &["b"]), unit("b", &["a"])],
        dir.path(),
    );

    match Scheduler::from_config(&config, Arc::new(ScriptedRunner::new())) {
        Err(WeaveError::Validation(ValidationError::Cycle { path })) => {
            assert_eq!(path.first(), path.last());
        }
        Err(other) => panic!("expected cycle, got {}", other),
        Ok(_) => panic!("expected cycle"),
    }
}
