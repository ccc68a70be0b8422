use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Graph validation failures. Always fatal and raised before any unit runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Unit '{0}' is declared more than once")]
    DuplicateUnit(String),

    #[error("Workflow declares no units")]
    EmptyWorkflow,

    #[error("Unit '{unit}' has an unusable timeout of {value} seconds")]
    InvalidTimeout { unit: String, value: String },
}

#[derive(Debug, Error)]
pub enum WeaveError {
    // Graph errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // Lock / state errors
    #[error("Workflow '{workflow}' is locked by run {holder_run}")]
    LockContention { workflow: String, holder_run: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State store error: {0}")]
    State(String),

    // Execution errors
    #[error("{what} timed out after {secs:.1}s")]
    Timeout { what: String, secs: f64 },

    #[error("Unit '{unit}' failed after {attempts} attempts: {last}")]
    RetryExhausted {
        unit: String,
        attempts: u32,
        last: Box<WeaveError>,
    },

    #[error("Unit runner error ({kind}): {message}")]
    Runner { kind: ErrorKind, message: String },

    #[error("Unit '{unit}' exceeded {rounds} tool rounds")]
    ToolRoundsExceeded { unit: String, rounds: usize },

    #[error("Cancelled")]
    Cancelled,

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    // Protocol errors
    #[error("Protocol error: {server}: {message}")]
    Protocol { server: String, message: String },

    #[error("Tool provider '{server}' exited: {status}")]
    ProcessExited { server: String, status: String },

    #[error("Remote error from '{server}' ({code}): {message}")]
    Remote {
        server: String,
        code: i64,
        message: String,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeaveError>;

/// Coarse classification of failures, matched against `retry_on_errors`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    Connection,
    Server,
    Protocol,
    Tool,
    Cancelled,
    Validation,
    Lock,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Connection => "connection",
            Self::Server => "server",
            Self::Protocol => "protocol",
            Self::Tool => "tool",
            Self::Cancelled => "cancelled",
            Self::Validation => "validation",
            Self::Lock => "lock",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WeaveError {
    /// Convenience constructor for collaborator failures.
    pub fn runner(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Runner {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::LockContention { .. } => ErrorKind::Lock,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RetryExhausted { last, .. } => last.kind(),
            Self::Runner { kind, .. } => *kind,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ToolNotFound(_) | Self::ToolExecution { .. } | Self::Remote { .. } => {
                ErrorKind::Tool
            }
            Self::Protocol { .. } | Self::ProcessExited { .. } => ErrorKind::Protocol,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => ErrorKind::Connection,
                _ => ErrorKind::Other,
            },
            Self::Config(_) | Self::ConfigNotFound(_) => ErrorKind::Validation,
            _ => ErrorKind::Other,
        }
    }

    /// Errors raised while configuring a run rather than executing it.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::LockContention { .. }
                | Self::Config(_)
                | Self::ConfigNotFound(_)
        )
    }
}
