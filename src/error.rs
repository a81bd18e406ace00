pub use anyhow::Error as ElementError;
use thiserror::Error;

use crate::task::TaskId;

/// Reasons a schedule request can be rejected.
///
/// The infallible `Scheduler::schedule*` entry points log these and hand back
/// [`TaskId::INVALID`], because callers routinely schedule speculatively.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("the scheduler is shutting down")]
    ShuttingDown,

    #[error("dependency {0} was never issued by this scheduler")]
    UnknownDependency(TaskId),

    #[error("task #{task} of the compiled graph refers to missing task #{index}")]
    InvalidDependency { task: usize, index: usize },

    #[error("compiled graph output index {0} is out of range")]
    InvalidOutput(usize),

    #[error("compiled graph contains a dependency cycle")]
    Cycle,

    #[error("compiled graph has no tasks")]
    EmptyGraph,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse scheduler configuration.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration value for '{0}': {1}")]
    Invalid(&'static str, String),

    #[error("Couldn't build the worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
