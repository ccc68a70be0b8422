//! Scripted unit runners, concurrency probes and workflow fixtures shared
//! by the Weave test suites.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use weave_core::config::{ExecutionMode, RuntimeConfig, UnitConfig, WorkflowConfig};
use weave_core::error::{ErrorKind, Result, WeaveError};
use weave_core::traits::UnitRunner;
use weave_core::types::{ToolCall, UnitRequest, UnitResponse};

/// One scripted reply of a [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub enum Step {
    /// Finish with this output.
    Complete(String),
    /// Fail with a runner error of this kind.
    Fail(ErrorKind),
    /// Sleep, then finish with the default output.
    Sleep(Duration),
    /// Ask for these tools to be executed.
    ToolCalls(Vec<ToolCall>),
    /// Panic inside the runner.
    Panic,
}

/// Tracks how many invocations overlap.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    starts: Mutex<Vec<String>>,
}

impl ConcurrencyProbe {
    pub fn enter(&self, unit: &str) -> ProbeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.starts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(unit.to_string());
        ProbeGuard { probe: self }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Units in the order their invocations began.
    pub fn start_order(&self) -> Vec<String> {
        self.starts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

pub struct ProbeGuard<'a> {
    probe: &'a ConcurrencyProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`UnitRunner`] that replays per-unit scripts.
///
/// Each invocation pops the next step of its unit's script. An exhausted
/// or missing script completes with `"<unit> done"`. Every request is
/// recorded for later inspection.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    requests: Mutex<Vec<UnitRequest>>,
    probe: Arc<ConcurrencyProbe>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, unit: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(unit.to_string(), steps.into());
        self
    }

    /// Sleep this long in every invocation of `unit` before replying.
    pub fn with_delay(mut self, unit: &str, delay: Duration) -> Self {
        self.delays.insert(unit.to_string(), delay);
        self
    }

    /// Sleep this long in every invocation without a unit-specific delay.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn probe(&self) -> Arc<ConcurrencyProbe> {
        self.probe.clone()
    }

    pub fn requests(&self) -> Vec<UnitRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn requests_for(&self, unit: &str) -> Vec<UnitRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.unit_id == unit)
            .collect()
    }

    pub fn invocations(&self, unit: &str) -> usize {
        self.requests_for(unit).len()
    }

    fn next_step(&self, unit: &str) -> Option<Step> {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(unit)
            .and_then(|steps| steps.pop_front())
    }
}

impl UnitRunner for ScriptedRunner {
    fn run(&self, request: UnitRequest) -> BoxFuture<'_, Result<UnitResponse>> {
        Box::pin(async move {
            let unit = request.unit_id.clone();
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request);
            let _guard = self.probe.enter(&unit);

            let delay = self.delays.get(&unit).copied().unwrap_or(self.default_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let done = format!("{} done", unit);
            match self.next_step(&unit) {
                None => Ok(UnitResponse::complete(done)),
                Some(Step::Complete(output)) => Ok(UnitResponse::complete(output)),
                Some(Step::Fail(kind)) => Err(WeaveError::Runner {
                    kind,
                    message: format!("scripted {} failure in '{}'", kind, unit),
                }),
                Some(Step::Sleep(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(UnitResponse::complete(done))
                }
                Some(Step::ToolCalls(calls)) => Ok(UnitResponse::ToolCalls {
                    calls,
                    tokens_used: 0,
                }),
                Some(Step::Panic) => panic!("scripted panic in '{}'", unit),
            }
        })
    }
}

/// Build a tool call with JSON object arguments.
pub fn tool_call(name: &str, arguments: serde_json::Value) -> ToolCall {
    let arguments = match arguments {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    ToolCall::new(name, arguments)
}

pub fn unit(name: &str, depends_on: &[&str]) -> UnitConfig {
    UnitConfig::new(name).depends_on(depends_on)
}

/// Runtime with zero retry delay so failing tests stay fast.
pub fn runtime(mode: ExecutionMode) -> RuntimeConfig {
    RuntimeConfig {
        mode,
        retry_delay: 0.0,
        ..Default::default()
    }
}

/// A workflow whose state and logs live under `dir`.
pub fn workflow(name: &str, runtime: RuntimeConfig, units: Vec<UnitConfig>, dir: &Path) -> WorkflowConfig {
    let toml_str = format!(
        "name = \"{}\"\n[state]\ndir = \"{}\"\n",
        name,
        dir.join("state").display()
    );
    let mut config: WorkflowConfig = toml::from_str(&toml_str).unwrap_or_else(|e| {
        panic!("fixture workflow did not parse: {}", e)
    });
    config.runtime = runtime;
    config.agents = units;
    config
}

/// The classic diamond: `a -> {b, c} -> d`.
pub fn diamond() -> Vec<UnitConfig> {
    vec![
        unit("a", &[]),
        unit("b", &["a"]),
        unit("c", &["a"]),
        unit("d", &["b", "c"]),
    ]
}

/// Temporary directory that lives for the test.
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap_or_else(|e| panic!("failed to create temp dir: {}", e))
}
