//! Weave execution engine: graph validation and leveling, the scheduler,
//! retry and rate-limit policy, durable run state, workflow locks and the
//! JSONL run log.

pub mod graph;
pub mod lock;
pub mod rate_limit;
pub mod retry;
pub mod run;
pub mod run_log;
pub mod scheduler;
pub mod state;

pub use graph::{ExecutionGraph, GraphBuilder, WorkflowUnit};
pub use lock::{LockGuard, LockInfo, LockManager, LockRecord};
pub use rate_limit::RateLimiter;
pub use retry::RetryController;
pub use run::{Run, UnitOutcome};
pub use run_log::RunLogger;
pub use scheduler::Scheduler;
pub use state::{open_store, JsonStateStore, RunSummary, SqliteStateStore, StateStore};
