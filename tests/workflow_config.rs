use std::io::Write;

use weave_core::config::{BackoffStrategy, DuplicatePolicy, ExecutionMode, LockLiveness, StateBackend, WorkflowConfig};
use weave_core::error::{ErrorKind, ValidationError, WeaveError};
use weave_engine::GraphBuilder;

#[test]
fn test_load_full_workflow_from_file() {
    std::env::set_var("WEAVE_TEST_PROVIDER_ROOT", "/srv/docs");
    let toml_content = r#"
name = "research-report"
description = "Gather, draft and review"

[runtime]
mode = "async"
max_concurrent_agents = 3
max_retries = 2
retry_delay = 0.5
retry_backoff = "linear"
retry_backoff_multiplier = 3.0
retry_on_errors = ["timeout", "server"]
retry_jitter = true
default_timeout = 60
workflow_timeout = 600
tool_timeout = 10
enable_rate_limiting = true
requests_per_minute = 30
tokens_per_minute = 50000
stop_on_error = false
continue_on_agent_failure = true
save_partial_results = false
max_tool_rounds = 4

[[agents]]
name = "gather"
tools = ["files_read"]

[[agents]]
name = "draft"
depends_on = ["gather"]
timeout = 120

[[agents]]
name = "review"
depends_on = ["draft"]

[tools]
on_duplicate = "reject"

[mcp.servers.files]
command = "files-provider"
args = ["--root", "${WEAVE_TEST_PROVIDER_ROOT}"]
startup_timeout = 5
shutdown_grace = 1
restart_on_exit = false

[mcp.servers.files.env]
LOG_LEVEL = "debug"

[state]
dir = "/tmp/weave-state"
backend = "sqlite"

[state.lock]
liveness = "timeout"
stale_after = 120
grace = 5

[log]
dir = "/tmp/weave-logs"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WorkflowConfig::load(tmp.path()).expect("load workflow");
    std::env::remove_var("WEAVE_TEST_PROVIDER_ROOT");

    assert_eq!(config.name, "research-report");
    let rt = &config.runtime;
    assert_eq!(rt.mode, ExecutionMode::Async);
    assert_eq!(rt.concurrency_cap(), 3);
    assert_eq!(rt.retry_backoff, BackoffStrategy::Linear);
    assert!(rt.is_retryable(ErrorKind::Server));
    assert!(!rt.is_retryable(ErrorKind::RateLimit));
    assert!(rt.retry_jitter);
    assert_eq!(rt.workflow_timeout, Some(600.0));
    assert!(!rt.save_partial_results);
    assert_eq!(rt.max_tool_rounds, 4);

    assert_eq!(config.tools.on_duplicate, DuplicatePolicy::Reject);

    let files = &config.mcp.servers["files"];
    assert_eq!(files.args, vec!["--root", "/srv/docs"]);
    assert_eq!(files.env["LOG_LEVEL"], "debug");
    assert!(!files.restart_on_exit);

    assert_eq!(config.state.backend, StateBackend::Sqlite);
    assert_eq!(config.state.lock.liveness, LockLiveness::Timeout);
    let log = config.log.as_ref().expect("log section");
    assert!(log.enabled);

    let graph = GraphBuilder::from_config(&config).build().expect("valid graph");
    assert_eq!(
        graph.level_names(),
        vec![vec!["gather"], vec!["draft"], vec!["review"]]
    );
    let draft = graph.unit(graph.index_of("draft").unwrap());
    assert_eq!(draft.timeout, Some(std::time::Duration::from_secs(120)));
}

#[test]
fn test_missing_workflow_file() {
    let err = WorkflowConfig::load(std::path::Path::new("/nonexistent/weave.toml")).unwrap_err();
    assert!(matches!(err, WeaveError::ConfigNotFound(_)));
}

#[test]
fn test_unknown_dependency_in_file() {
    let config = WorkflowConfig::parse(
        r#"
name = "broken"

[[agents]]
name = "draft"
depends_on = ["gather"]
"#,
    )
    .unwrap();

    let err = GraphBuilder::from_config(&config).build().unwrap_err();
    assert_eq!(
        err,
        ValidationError::UnknownDependency {
            unit: "draft".into(),
            dependency: "gather".into(),
        }
    );
}

#[test]
fn test_empty_workflow_is_rejected() {
    let config = WorkflowConfig::parse("name = \"empty\"").unwrap();
    assert_eq!(
        GraphBuilder::from_config(&config).build().unwrap_err(),
        ValidationError::EmptyWorkflow
    );
}
