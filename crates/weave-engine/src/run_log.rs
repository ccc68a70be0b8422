use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weave_core::types::{RunId, WorkflowEvent};

use crate::lock::file_safe_name;

/// JSONL run logger.
///
/// Consumes workflow events for one run and appends one JSON object per
/// line to `{log_dir}/{workflow}/{run_id}.jsonl`, flushing after every
/// entry so a crash loses nothing already written. Both path components
/// are percent-encoded the same way lock file names are.
pub struct RunLogger {
    log_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn log_path(&self, workflow: &str, run_id: &RunId) -> PathBuf {
        self.log_dir
            .join(file_safe_name(workflow))
            .join(format!("{}.jsonl", file_safe_name(run_id.as_str())))
    }

    /// Write entries until this run's `RunFinished`, cancellation, or the
    /// bus closing. Events of other runs are ignored.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        workflow: String,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        let log_path = self.log_path(&workflow, &run_id);
        if let Some(parent) = log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, "Failed to create run log directory");
                return;
            }
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open run log");
                return;
            }
        };

        info!(path = %log_path.display(), "Run log started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Run log cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        if event.run_id() != &run_id {
                            continue;
                        }
                        let entry = event_to_entry(&event);
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write run log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush run log");
                            }
                        }
                        if matches!(event, WorkflowEvent::RunFinished { .. }) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Run log lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed, run log stopping");
                        break;
                    }
                },
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Run log finished");
    }
}

fn event_to_entry(event: &WorkflowEvent) -> LogEntry {
    let mut entry = LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        run_id: event.run_id().to_string(),
        event_type: "",
        unit: None,
        attempt: None,
        detail: None,
    };

    match event {
        WorkflowEvent::RunStarted { workflow, .. } => {
            entry.event_type = "run_started";
            entry.detail = Some(serde_json::json!({ "workflow": workflow }));
        }
        WorkflowEvent::UnitStarted { unit, attempt, .. } => {
            entry.event_type = "unit_started";
            entry.unit = Some(unit.clone());
            entry.attempt = Some(*attempt);
        }
        WorkflowEvent::UnitRetrying {
            unit,
            attempt,
            delay_ms,
            error,
            ..
        } => {
            entry.event_type = "unit_retrying";
            entry.unit = Some(unit.clone());
            entry.attempt = Some(*attempt);
            entry.detail = Some(serde_json::json!({
                "delay_ms": delay_ms,
                "error": truncate_str(error, 500),
            }));
        }
        WorkflowEvent::ToolStarted { unit, call, .. } => {
            entry.event_type = "tool_started";
            entry.unit = Some(unit.clone());
            entry.detail = Some(serde_json::json!({
                "tool": call.name,
                "call_id": call.id,
                "arguments": truncate_json(&serde_json::Value::Object(call.arguments.clone()), 500),
            }));
        }
        WorkflowEvent::ToolFinished { unit, result, .. } => {
            entry.event_type = "tool_finished";
            entry.unit = Some(unit.clone());
            entry.detail = Some(serde_json::json!({
                "tool": result.tool,
                "call_id": result.call_id,
                "success": result.success,
                "duration_ms": result.duration_ms,
                "error": result.error.as_deref().map(|e| truncate_str(e, 200)),
            }));
        }
        WorkflowEvent::UnitFinished {
            unit,
            status,
            duration_ms,
            ..
        } => {
            entry.event_type = "unit_finished";
            entry.unit = Some(unit.clone());
            entry.detail = Some(serde_json::json!({
                "status": status,
                "duration_ms": duration_ms,
            }));
        }
        WorkflowEvent::RunFinished { status, .. } => {
            entry.event_type = "run_finished";
            entry.detail = Some(serde_json::json!({ "status": status }));
        }
    }
    entry
}

fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        s
    } else {
        format!("{}...", truncate_str(&s, max_len))
    }
}

/// Truncate on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
