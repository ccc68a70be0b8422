use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weave_core::config::{ExecutionMode, StateBackend, WorkflowConfig};
use weave_core::error::ErrorKind;
use weave_core::types::{RunStatus, UnitStatus};
use weave_engine::{open_store, Scheduler};
use weave_test_utils::{runtime, temp_dir, tool_call, unit, workflow, ScriptedRunner, Step};
use weave_tools::{FnTool, ToolBroker};

fn research_pipeline(dir: &std::path::Path, backend: StateBackend) -> WorkflowConfig {
    let mut config = workflow(
        "research",
        runtime(ExecutionMode::Parallel),
        vec![
            unit("gather", &[]).with_tools(&["lookup"]),
            unit("summarise", &["gather"]),
            unit("cite", &["gather"]),
            unit("publish", &["summarise", "cite"]),
        ],
        dir,
    );
    config.state.backend = backend;
    config
}

fn lookup_broker(config: &WorkflowConfig, hits: Arc<AtomicUsize>) -> ToolBroker {
    let mut broker = ToolBroker::new(
        config.tools.on_duplicate,
        config.runtime.tool_timeout_duration(),
    );
    broker
        .register(FnTool::new("lookup", "Look up a topic", move |args| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let topic = args.get("topic").and_then(|v| v.as_str()).unwrap_or("?");
                Ok(serde_json::json!(format!("facts about {}", topic)))
            }
        }))
        .unwrap();
    broker
}

#[tokio::test]
async fn test_pipeline_runs_and_persists_with_both_backends() {
    for backend in [StateBackend::Json, StateBackend::Sqlite] {
        let dir = temp_dir();
        let config = research_pipeline(dir.path(), backend);
        let hits = Arc::new(AtomicUsize::new(0));

        let runner = Arc::new(ScriptedRunner::new().script(
            "gather",
            vec![
                Step::ToolCalls(vec![tool_call("lookup", serde_json::json!({"topic": "rust"}))]),
                Step::Complete("gathered".into()),
            ],
        ));
        let scheduler = Scheduler::from_config(&config, runner.clone())
            .unwrap()
            .with_broker(Arc::new(lookup_broker(&config, hits.clone())));

        let run = scheduler.run().await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            runner.requests_for("summarise")[0].inputs["gather"],
            "gathered"
        );

        let store = open_store(&config.state).unwrap();
        let loaded = store.load_state(&run.id).unwrap();
        assert_eq!(loaded, run);
        let gather = loaded.outcome("gather").unwrap();
        assert_eq!(
            gather.tool_calls[0].value,
            Some(serde_json::json!("facts about rust"))
        );
    }
}

#[tokio::test]
async fn test_branch_failure_is_recorded_and_listed() {
    let dir = temp_dir();
    let config = research_pipeline(dir.path(), StateBackend::Json);
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("cite", vec![Step::Fail(ErrorKind::Tool)])
            .with_delay("summarise", Duration::from_millis(5)),
    );

    let first = Scheduler::from_config(&config, runner.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(first.status_of("summarise"), Some(UnitStatus::Succeeded));
    assert_eq!(first.status_of("publish"), Some(UnitStatus::Skipped));

    let second = Scheduler::from_config(&config, runner)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Succeeded);

    let listed = open_store(&config.state)
        .unwrap()
        .list_runs("research")
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].started_at >= listed[1].started_at);
    assert_eq!(listed[0].id, second.id);
}
