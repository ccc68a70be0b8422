//! The orchestrator.
//!
//! One driver loop owns all run state. It admits ready units through a
//! shared semaphore, spawns each onto a `JoinSet`, and reacts to
//! completions, the workflow deadline and the abort signal. Units never
//! touch run state directly; they hand back a [`UnitOutcome`].

mod unit;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use weave_core::config::{ExecutionMode, RuntimeConfig, WorkflowConfig};
use weave_core::error::{Result, WeaveError};
use weave_core::event::EventBus;
use weave_core::traits::UnitRunner;
use weave_core::types::{RunId, RunStatus, UnitStatus, WorkflowEvent};
use weave_tools::ToolBroker;

use crate::graph::{ExecutionGraph, GraphBuilder};
use crate::lock::LockManager;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryController;
use crate::run::{Run, UnitOutcome};
use crate::run_log::RunLogger;
use crate::state::{open_store, StateStore};

use unit::UnitTask;

/// Why the driver stopped admitting units.
#[derive(Debug, Clone)]
enum Halt {
    /// `stop_on_error` tripped on this unit.
    StopOnError(String),
    /// Abort signal fired.
    Aborted,
    /// Workflow deadline elapsed.
    TimedOut,
    /// A unit failed with both `stop_on_error` and
    /// `continue_on_agent_failure` off: drain in-flight work only.
    Drain(String),
}

impl Halt {
    fn run_status(&self) -> RunStatus {
        match self {
            Halt::StopOnError(_) | Halt::Aborted => RunStatus::Aborted,
            Halt::TimedOut => RunStatus::TimedOut,
            Halt::Drain(_) => RunStatus::Failed,
        }
    }

    fn skip_reason(&self) -> String {
        match self {
            Halt::StopOnError(unit) => format!("run aborted after unit '{}' failed", unit),
            Halt::Aborted => "run aborted".to_string(),
            Halt::TimedOut => "workflow deadline elapsed".to_string(),
            Halt::Drain(unit) => format!("run stopped after unit '{}' failed", unit),
        }
    }
}

pub struct Scheduler {
    workflow: String,
    graph: ExecutionGraph,
    runtime: Arc<RuntimeConfig>,
    runner: Arc<dyn UnitRunner>,
    broker: Arc<ToolBroker>,
    events: Arc<EventBus>,
    store: Option<Arc<dyn StateStore>>,
    locks: Option<LockManager>,
    run_log: Option<PathBuf>,
    abort: CancellationToken,
}

impl Scheduler {
    pub fn new(
        workflow: impl Into<String>,
        graph: ExecutionGraph,
        runtime: RuntimeConfig,
        runner: Arc<dyn UnitRunner>,
    ) -> Self {
        let broker = ToolBroker::new(Default::default(), runtime.tool_timeout_duration());
        Self {
            workflow: workflow.into(),
            graph,
            runtime: Arc::new(runtime),
            runner,
            broker: Arc::new(broker),
            events: Arc::new(EventBus::default()),
            store: None,
            locks: None,
            run_log: None,
            abort: CancellationToken::new(),
        }
    }

    /// Build the graph, state store, lock manager and run log from a
    /// workflow file. Tools are registered separately via [`Self::with_broker`].
    pub fn from_config(config: &WorkflowConfig, runner: Arc<dyn UnitRunner>) -> Result<Self> {
        let graph = GraphBuilder::from_config(config).build()?;
        let store: Arc<dyn StateStore> = Arc::from(open_store(&config.state)?);
        let broker = ToolBroker::new(
            config.tools.on_duplicate,
            config.runtime.tool_timeout_duration(),
        );

        let mut scheduler = Self::new(&config.name, graph, config.runtime.clone(), runner)
            .with_broker(Arc::new(broker))
            .with_state_store(store)
            .with_lock_manager(LockManager::from_config(&config.state));
        if let Some(log) = config.log.as_ref().filter(|l| l.enabled) {
            scheduler = scheduler.with_run_log(log.log_dir());
        }
        Ok(scheduler)
    }

    pub fn with_broker(mut self, broker: Arc<ToolBroker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_run_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_log = Some(dir.into());
        self
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn broker(&self) -> &Arc<ToolBroker> {
        &self.broker
    }

    /// Token that aborts the current run when cancelled. Once cancelled,
    /// later runs on this scheduler abort immediately.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub async fn run(&self) -> Result<Run> {
        self.run_with_id(RunId::new()).await
    }

    /// Execute the workflow. Only configuration-time failures (validation,
    /// lock contention) are returned as errors; everything else is
    /// reported in the returned [`Run`].
    pub async fn run_with_id(&self, run_id: RunId) -> Result<Run> {
        self.graph.validate()?;

        let lock = match &self.locks {
            Some(locks) => Some(locks.acquire_lock(&self.workflow, &run_id)?),
            None => None,
        };

        let logger = self.run_log.as_ref().map(|dir| {
            tokio::spawn(RunLogger::new(dir.clone()).run(
                self.events.subscribe(),
                self.workflow.clone(),
                run_id.clone(),
                CancellationToken::new(),
            ))
        });

        let mut run = Run::with_id(run_id.clone(), &self.workflow);
        info!(
            workflow = %self.workflow,
            run_id = %run_id,
            mode = ?self.runtime.mode,
            units = self.graph.len(),
            "Run started"
        );
        self.events.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            workflow: self.workflow.clone(),
        });
        self.save(&run);

        let status = self.drive(&mut run).await;

        if !self.runtime.save_partial_results && status != RunStatus::Succeeded {
            for outcome in &mut run.outcomes {
                outcome.output = None;
            }
        }
        run.finish(status);
        self.save(&run);

        info!(
            workflow = %self.workflow,
            run_id = %run_id,
            status = %status,
            succeeded = run.count(UnitStatus::Succeeded),
            failed = run.count(UnitStatus::Failed),
            skipped = run.count(UnitStatus::Skipped),
            "Run finished"
        );
        self.events.publish(WorkflowEvent::RunFinished {
            run_id: run_id.clone(),
            status,
        });

        if let Some(handle) = logger {
            if let Err(e) = handle.await {
                warn!(error = %e, "Run log task failed");
            }
        }
        if let Some(guard) = lock {
            if let Err(e) = guard.release() {
                warn!(workflow = %self.workflow, error = %e, "Failed to release lock");
            }
        }
        Ok(run)
    }

    /// Persist a snapshot. Failures are logged; they never fail the run.
    fn save(&self, run: &Run) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_state(run) {
                warn!(run_id = %run.id, error = %e, "Failed to save run state");
            }
        }
    }

    fn record(&self, graph: &mut ExecutionGraph, run: &mut Run, idx: usize, outcome: UnitOutcome) {
        graph.set_status(idx, outcome.status);
        self.events.publish(WorkflowEvent::UnitFinished {
            run_id: run.id.clone(),
            unit: outcome.unit.clone(),
            status: outcome.status,
            duration_ms: outcome.duration_ms,
        });
        run.outcomes.push(outcome);
    }

    async fn drive(&self, run: &mut Run) -> RunStatus {
        let mut graph = self.graph.clone();
        let order: Vec<usize> = graph.levels().iter().flatten().copied().collect();
        let level_count = graph.levels().len();
        let barrier = !matches!(self.runtime.mode, ExecutionMode::Async);

        let gate = Arc::new(Semaphore::new(self.runtime.concurrency_cap()));
        let cancel = self.abort.child_token();
        let deadline = self.runtime.workflow_deadline().map(|d| Instant::now() + d);
        let limiter = RateLimiter::from_runtime(&self.runtime).map(Arc::new);
        let retry = RetryController::from_runtime(&self.runtime);

        let mut outputs: Vec<Option<String>> = vec![None; graph.len()];
        let mut tasks: JoinSet<(usize, UnitOutcome)> = JoinSet::new();
        let mut level = 0usize;
        let mut halt: Option<Halt> = None;

        loop {
            if halt.is_none() {
                if self.abort.is_cancelled() {
                    halt = Some(Halt::Aborted);
                    cancel.cancel();
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    halt = Some(Halt::TimedOut);
                    cancel.cancel();
                }
            }

            if halt.is_none() {
                if barrier {
                    while level < level_count
                        && graph.levels()[level]
                            .iter()
                            .all(|&i| graph.status(i).is_terminal())
                    {
                        level += 1;
                    }
                }

                for &idx in &order {
                    if graph.status(idx) != UnitStatus::Pending {
                        continue;
                    }
                    if barrier && graph.level_of(idx) != level {
                        continue;
                    }
                    let ready = graph
                        .dependencies(idx)
                        .iter()
                        .all(|&d| graph.status(d) == UnitStatus::Succeeded);
                    if !ready {
                        continue;
                    }
                    let Ok(permit) = gate.clone().try_acquire_owned() else {
                        break;
                    };

                    let inputs: BTreeMap<String, String> = graph
                        .dependencies(idx)
                        .iter()
                        .map(|&d| {
                            (
                                graph.unit(d).id.clone(),
                                outputs[d].clone().unwrap_or_default(),
                            )
                        })
                        .collect();
                    let task = UnitTask {
                        run_id: run.id.clone(),
                        unit: graph.unit(idx).clone(),
                        inputs,
                        runner: self.runner.clone(),
                        broker: self.broker.clone(),
                        events: self.events.clone(),
                        limiter: limiter.clone(),
                        retry: retry.clone(),
                        runtime: self.runtime.clone(),
                        deadline,
                        cancel: cancel.child_token(),
                    };
                    graph.set_status(idx, UnitStatus::Running);
                    let unit_id = graph.unit(idx).id.clone();
                    tasks.spawn(async move {
                        let outcome = match AssertUnwindSafe(task.run()).catch_unwind().await {
                            Ok(outcome) => outcome,
                            Err(_) => UnitOutcome {
                                unit: unit_id,
                                status: UnitStatus::Failed,
                                output: None,
                                error: Some("unit runner panicked".into()),
                                attempts: 1,
                                duration_ms: 0,
                                tool_calls: Vec::new(),
                            },
                        };
                        drop(permit);
                        (idx, outcome)
                    });
                }
            }

            if tasks.is_empty() {
                break;
            }

            let sleep_until = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                _ = self.abort.cancelled(), if halt.is_none() => {
                    warn!(workflow = %self.workflow, "Abort requested, cancelling in-flight units");
                    halt = Some(Halt::Aborted);
                    cancel.cancel();
                }
                _ = tokio::time::sleep_until(sleep_until), if halt.is_none() && deadline.is_some() => {
                    warn!(
                        workflow = %self.workflow,
                        timeout_secs = self.runtime.workflow_timeout.unwrap_or_default(),
                        "Workflow deadline elapsed, cancelling in-flight units"
                    );
                    halt = Some(Halt::TimedOut);
                    cancel.cancel();
                }
                joined = tasks.join_next() => {
                    let (idx, mut outcome) = match joined {
                        Some(Ok(done)) => done,
                        Some(Err(e)) => {
                            error!(error = %e, "Unit task lost");
                            continue;
                        }
                        None => continue,
                    };

                    if outcome.status == UnitStatus::Failed
                        && matches!(halt, Some(Halt::TimedOut))
                        && outcome.error.as_deref() == Some(WeaveError::Cancelled.to_string().as_str())
                    {
                        outcome.error = Some(
                            WeaveError::Timeout {
                                what: format!("workflow '{}'", self.workflow),
                                secs: self.runtime.workflow_timeout.unwrap_or_default(),
                            }
                            .to_string(),
                        );
                    }

                    outputs[idx] = outcome.output.clone();
                    let failed = outcome.status == UnitStatus::Failed;
                    let unit_id = outcome.unit.clone();
                    self.record(&mut graph, run, idx, outcome);

                    if failed && halt.is_none() {
                        if self.runtime.stop_on_error {
                            warn!(unit = %unit_id, "stop_on_error set, aborting run");
                            halt = Some(Halt::StopOnError(unit_id));
                            cancel.cancel();
                        } else if self.runtime.continue_on_agent_failure {
                            for dep in graph.transitive_dependents(idx) {
                                if graph.status(dep) == UnitStatus::Pending {
                                    let reason = format!("dependency '{}' did not succeed", unit_id);
                                    let skipped = UnitOutcome::skipped(&graph.unit(dep).id, reason);
                                    self.record(&mut graph, run, dep, skipped);
                                }
                            }
                        } else {
                            warn!(unit = %unit_id, "Unit failed, finishing in-flight units only");
                            halt = Some(Halt::Drain(unit_id));
                        }
                    }

                    if self.runtime.save_partial_results {
                        self.save(run);
                    }
                }
            }
        }

        // Whatever never started is skipped; anything still marked running
        // lost its task.
        let reason = halt
            .as_ref()
            .map(Halt::skip_reason)
            .unwrap_or_else(|| "dependencies did not succeed".to_string());
        for &idx in &order {
            match graph.status(idx) {
                UnitStatus::Pending => {
                    let skipped = UnitOutcome::skipped(&graph.unit(idx).id, reason.clone());
                    self.record(&mut graph, run, idx, skipped);
                }
                UnitStatus::Running => {
                    let lost = UnitOutcome {
                        unit: graph.unit(idx).id.clone(),
                        status: UnitStatus::Failed,
                        output: None,
                        error: Some("unit task was lost".into()),
                        attempts: 0,
                        duration_ms: 0,
                        tool_calls: Vec::new(),
                    };
                    self.record(&mut graph, run, idx, lost);
                }
                _ => {}
            }
        }

        match halt {
            Some(h) => h.run_status(),
            None if run.outcomes.iter().all(|o| o.status == UnitStatus::Succeeded) => {
                RunStatus::Succeeded
            }
            None => RunStatus::Failed,
        }
    }
}
