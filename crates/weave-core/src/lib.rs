pub mod config;
pub mod env;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::WorkflowConfig;
pub use error::{ErrorKind, Result, ValidationError, WeaveError};
pub use event::EventBus;
pub use types::*;
