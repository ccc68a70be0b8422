//! One unit's attempt loop: rate-limit admission, unit timeout, tool
//! rounds and retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weave_core::config::RuntimeConfig;
use weave_core::error::{Result, WeaveError};
use weave_core::event::EventBus;
use weave_core::traits::UnitRunner;
use weave_core::types::{
    RunId, ToolCall, ToolResult, UnitRequest, UnitResponse, UnitStatus, WorkflowEvent,
};
use weave_tools::ToolBroker;

use crate::graph::WorkflowUnit;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryController;
use crate::run::UnitOutcome;

/// Everything a spawned unit task needs. Cheap to build per unit.
pub(crate) struct UnitTask {
    pub run_id: RunId,
    pub unit: WorkflowUnit,
    pub inputs: BTreeMap<String, String>,
    pub runner: Arc<dyn UnitRunner>,
    pub broker: Arc<ToolBroker>,
    pub events: Arc<EventBus>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub retry: RetryController,
    pub runtime: Arc<RuntimeConfig>,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl UnitTask {
    pub async fn run(self) -> UnitOutcome {
        let start = Instant::now();
        let mut tool_log: Vec<ToolResult> = Vec::new();
        let mut attempt: u32 = 0;

        let (status, output, error) = loop {
            self.events.publish(WorkflowEvent::UnitStarted {
                run_id: self.run_id.clone(),
                unit: self.unit.id.clone(),
                attempt,
            });
            info!(unit = %self.unit.id, attempt, "Unit started");

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(WeaveError::Cancelled),
                r = self.attempt(attempt, &mut tool_log) => r,
            };

            let err = match result {
                Ok(output) => break (UnitStatus::Succeeded, Some(output), None),
                Err(WeaveError::Cancelled) => {
                    break (UnitStatus::Failed, None, Some(WeaveError::Cancelled))
                }
                Err(e) => e,
            };

            let attempts_made = attempt + 1;
            let retryable = matches!(err, WeaveError::Timeout { .. })
                || self.runtime.is_retryable(err.kind());
            if !retryable {
                warn!(unit = %self.unit.id, attempt, error = %err, "Unit failed with non-retryable error");
                break (UnitStatus::Failed, None, Some(err));
            }
            if !self.retry.should_retry(attempts_made) {
                let err = self.retry.exhausted(&self.unit.id, attempts_made, err);
                warn!(unit = %self.unit.id, error = %err, "Retries exhausted");
                break (UnitStatus::Failed, None, Some(err));
            }

            let remaining = self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()));
            let delay = self.retry.delay(attempt, remaining);
            warn!(
                unit = %self.unit.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Unit failed, retrying"
            );
            self.events.publish(WorkflowEvent::UnitRetrying {
                run_id: self.run_id.clone(),
                unit: self.unit.id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    break (UnitStatus::Failed, None, Some(WeaveError::Cancelled));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(unit = %self.unit.id, status = %status, duration_ms, "Unit finished");
        UnitOutcome {
            unit: self.unit.id.clone(),
            status,
            output,
            error: error.map(|e| e.to_string()),
            attempts: attempt + 1,
            duration_ms,
            tool_calls: tool_log,
        }
    }

    fn unit_timeout(&self) -> Duration {
        self.unit.timeout.unwrap_or_else(|| self.runtime.unit_timeout())
    }

    /// One invocation, bounded by the unit timeout once admitted.
    async fn attempt(&self, attempt: u32, tool_log: &mut Vec<ToolResult>) -> Result<String> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let timeout = self.unit_timeout();
        match tokio::time::timeout(timeout, self.invoke(attempt, tool_log)).await {
            Ok(result) => result,
            Err(_) => Err(WeaveError::Timeout {
                what: format!("unit '{}'", self.unit.id),
                secs: timeout.as_secs_f64(),
            }),
        }
    }

    /// Call the runner, executing requested tools between rounds until it
    /// produces a final output.
    async fn invoke(&self, attempt: u32, tool_log: &mut Vec<ToolResult>) -> Result<String> {
        let tools = self.broker.definitions_for(&self.unit.tools);
        let max_rounds = self.runtime.max_tool_rounds;
        let mut results: Vec<ToolResult> = Vec::new();

        for round in 0..=max_rounds {
            if round > 0 {
                if let Some(limiter) = &self.limiter {
                    limiter.acquire().await;
                }
            }

            let request = UnitRequest {
                run_id: self.run_id.clone(),
                unit_id: self.unit.id.clone(),
                attempt,
                round,
                tools: tools.clone(),
                inputs: self.inputs.clone(),
                tool_results: results.clone(),
            };
            let response = self.runner.run(request).await?;
            if let Some(limiter) = &self.limiter {
                limiter.record_tokens(response.tokens_used());
            }

            let calls = match response {
                UnitResponse::Complete { output, .. } => return Ok(output),
                UnitResponse::ToolCalls { calls, .. } => calls,
            };
            if round == max_rounds {
                break;
            }

            debug!(unit = %self.unit.id, round, calls = calls.len(), "Executing tool calls");
            let batch =
                futures::future::join_all(calls.iter().map(|call| self.execute_tool(call))).await;
            tool_log.extend(batch.iter().cloned());
            results.extend(batch);
        }

        Err(WeaveError::ToolRoundsExceeded {
            unit: self.unit.id.clone(),
            rounds: max_rounds,
        })
    }

    async fn execute_tool(&self, call: &ToolCall) -> ToolResult {
        if !self.unit.tools.iter().any(|t| t == &call.name) {
            warn!(unit = %self.unit.id, tool = %call.name, "Unit called an undeclared tool");
            return ToolResult::failure(
                call,
                format!(
                    "Tool '{}' is not declared for unit '{}'",
                    call.name, self.unit.id
                ),
                0,
            );
        }

        self.events.publish(WorkflowEvent::ToolStarted {
            run_id: self.run_id.clone(),
            unit: self.unit.id.clone(),
            call: call.clone(),
        });
        let result = self.broker.execute(call).await;
        self.events.publish(WorkflowEvent::ToolFinished {
            run_id: self.run_id.clone(),
            unit: self.unit.id.clone(),
            result: result.clone(),
        });
        result
    }
}
