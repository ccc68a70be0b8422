use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, WeaveError};

/// Top-level workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Units in declaration order.
    #[serde(default)]
    pub agents: Vec<UnitConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// One schedulable unit as declared in the workflow file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Tool names this unit may call.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Per-unit timeout override in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl UnitConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            depends_on: vec![],
            tools: vec![],
            timeout: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// The override as a duration, or `None` when absent or not a positive
    /// finite number of seconds.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.filter(|t| positive(*t)).map(secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One unit at a time in topological order.
    Sequential,
    /// Levels run one after another; units within a level run concurrently.
    #[default]
    Parallel,
    /// Units start as soon as their own dependencies are done.
    Async,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// Scheduling, retry, timeout, rate-limit and error policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_agents: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base retry delay in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default)]
    pub retry_backoff: BackoffStrategy,
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    #[serde(default = "default_retry_on_errors")]
    pub retry_on_errors: HashSet<ErrorKind>,
    /// Scale each delay by a random factor in 0.8..1.2.
    #[serde(default)]
    pub retry_jitter: bool,
    /// Per-unit timeout in seconds.
    #[serde(default = "default_unit_timeout")]
    pub default_timeout: f64,
    /// Whole-run deadline in seconds.
    #[serde(default)]
    pub workflow_timeout: Option<f64>,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout: f64,
    #[serde(default)]
    pub enable_rate_limiting: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default = "default_true")]
    pub continue_on_agent_failure: bool,
    #[serde(default = "default_true")]
    pub save_partial_results: bool,
    /// Maximum runner/tool round trips within one attempt.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_concurrent_agents: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            retry_backoff: BackoffStrategy::default(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            retry_on_errors: default_retry_on_errors(),
            retry_jitter: false,
            default_timeout: default_unit_timeout(),
            workflow_timeout: None,
            tool_timeout: default_tool_timeout(),
            enable_rate_limiting: false,
            requests_per_minute: default_requests_per_minute(),
            tokens_per_minute: default_tokens_per_minute(),
            stop_on_error: false,
            continue_on_agent_failure: true,
            save_partial_results: true,
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

impl RuntimeConfig {
    /// Concurrency cap after applying the mode.
    pub fn concurrency_cap(&self) -> usize {
        match self.mode {
            ExecutionMode::Sequential => 1,
            _ => self.max_concurrent_agents.max(1),
        }
    }

    pub fn retry_delay_duration(&self) -> Duration {
        secs(self.retry_delay)
    }

    pub fn unit_timeout(&self) -> Duration {
        secs(self.default_timeout)
    }

    pub fn workflow_deadline(&self) -> Option<Duration> {
        self.workflow_timeout.map(secs)
    }

    pub fn tool_timeout_duration(&self) -> Duration {
        secs(self.tool_timeout)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retry_on_errors.contains(&kind)
    }

    /// Reject values that cannot be scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_agents == 0 {
            return Err(WeaveError::Config(
                "max_concurrent_agents must be at least 1".into(),
            ));
        }
        if !self.retry_delay.is_finite() || self.retry_delay < 0.0 {
            return Err(WeaveError::Config("retry_delay must be >= 0".into()));
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier <= 0.0 {
            return Err(WeaveError::Config(
                "retry_backoff_multiplier must be > 0".into(),
            ));
        }
        for (name, value) in [
            ("default_timeout", Some(self.default_timeout)),
            ("tool_timeout", Some(self.tool_timeout)),
            ("workflow_timeout", self.workflow_timeout),
        ] {
            if let Some(v) = value {
                if !positive(v) {
                    return Err(WeaveError::Config(format!("{} must be > 0", name)));
                }
            }
        }
        if self.enable_rate_limiting && self.requests_per_minute == 0 {
            return Err(WeaveError::Config(
                "requests_per_minute must be > 0 when rate limiting is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Upper bound for any configured duration, about a century.
const MAX_SECS: f64 = 100.0 * 365.0 * 24.0 * 3600.0;

/// Seconds to a duration. Negative and NaN become zero, huge values saturate.
fn secs(value: f64) -> Duration {
    if value.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_SECS)).unwrap_or(Duration::ZERO)
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn default_true() -> bool { true }
fn default_max_concurrent() -> usize { 4 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> f64 { 1.0 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_unit_timeout() -> f64 { 300.0 }
fn default_tool_timeout() -> f64 { 30.0 }
fn default_requests_per_minute() -> u32 { 60 }
fn default_tokens_per_minute() -> u64 { 100_000 }
fn default_max_tool_rounds() -> usize { 10 }

fn default_retry_on_errors() -> HashSet<ErrorKind> {
    [
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::Connection,
        ErrorKind::Server,
    ]
    .into_iter()
    .collect()
}

/// What the broker does when a tool name is registered twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Last registration wins (logged).
    #[default]
    Overwrite,
    /// Second registration fails with `DuplicateTool`.
    Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,
}

/// Remote tool providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// A subprocess speaking newline-delimited JSON-RPC on stdio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Seconds allowed for spawn + `initialize`.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: f64,
    /// Seconds to wait for a graceful exit before killing.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: f64,
    /// Start a fresh session on the next call after the provider died.
    #[serde(default = "default_true")]
    pub restart_on_exit: bool,
}

impl McpServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![],
            env: HashMap::new(),
            enabled: true,
            description: None,
            startup_timeout: default_startup_timeout(),
            shutdown_grace: default_shutdown_grace(),
            restart_on_exit: true,
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn startup_timeout_duration(&self) -> Duration {
        secs(self.startup_timeout)
    }

    pub fn shutdown_grace_duration(&self) -> Duration {
        secs(self.shutdown_grace)
    }
}

fn default_startup_timeout() -> f64 { 30.0 }
fn default_shutdown_grace() -> f64 { 5.0 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// One JSON file per run, replaced atomically.
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: String,
    #[serde(default)]
    pub backend: StateBackend,
    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            backend: StateBackend::default(),
            lock: LockConfig::default(),
        }
    }
}

impl StateConfig {
    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

fn default_state_dir() -> String { ".weave/state".to_string() }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockLiveness {
    /// Holder is live while its process exists (same host only).
    #[default]
    Process,
    /// Holder is live until the lock is older than `stale_after`.
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub liveness: LockLiveness,
    /// Age in seconds after which a lock counts as stale.
    #[serde(default = "default_stale_after")]
    pub stale_after: f64,
    /// Minimum age in seconds before a dead holder's lock may be reclaimed.
    #[serde(default = "default_lock_grace")]
    pub grace: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            liveness: LockLiveness::default(),
            stale_after: default_stale_after(),
            grace: default_lock_grace(),
        }
    }
}

impl LockConfig {
    pub fn stale_after_duration(&self) -> Duration {
        secs(self.stale_after)
    }

    pub fn grace_duration(&self) -> Duration {
        secs(self.grace)
    }
}

fn default_stale_after() -> f64 { 3600.0 }
fn default_lock_grace() -> f64 { 30.0 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_log_dir(),
        }
    }
}

impl LogConfig {
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

fn default_log_dir() -> String { ".weave/logs".to_string() }

impl WorkflowConfig {
    /// Load a workflow from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaveError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject any duration the scheduler, lock manager or provider client
    /// could not turn into a timer.
    pub fn validate(&self) -> Result<()> {
        self.runtime.validate()?;
        for unit in &self.agents {
            if let Some(t) = unit.timeout {
                if !positive(t) {
                    return Err(WeaveError::Config(format!(
                        "agent '{}': timeout must be > 0 (got {})",
                        unit.name, t
                    )));
                }
            }
        }
        for (name, server) in &self.mcp.servers {
            if !positive(server.startup_timeout) {
                return Err(WeaveError::Config(format!(
                    "mcp server '{}': startup_timeout must be > 0",
                    name
                )));
            }
            if !non_negative(server.shutdown_grace) {
                return Err(WeaveError::Config(format!(
                    "mcp server '{}': shutdown_grace must be >= 0",
                    name
                )));
            }
        }
        let lock = &self.state.lock;
        if !positive(lock.stale_after) {
            return Err(WeaveError::Config("state.lock.stale_after must be > 0".into()));
        }
        if !non_negative(lock.grace) {
            return Err(WeaveError::Config("state.lock.grace must be >= 0".into()));
        }
        Ok(())
    }

    pub fn unit(&self, name: &str) -> Option<&UnitConfig> {
        self.agents.iter().find(|u| u.name == name)
    }

    /// Enabled remote providers, sorted by name.
    pub fn enabled_servers(&self) -> Vec<(&str, &McpServerConfig)> {
        let mut servers: Vec<_> = self
            .mcp
            .servers
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(n, s)| (n.as_str(), s))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(b.0));
        servers
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
