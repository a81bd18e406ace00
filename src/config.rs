use serde::Deserialize;

use crate::error::ConfigError;

/// Tie-breaker applied among tasks that are Ready at the same time.
///
/// Correctness never depends on it; it only changes which of several
/// independent tasks gets a worker first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityPolicy {
    /// First promoted, first dispatched.
    #[default]
    Fifo,
    /// Deeper tasks (longer dependency chain behind them) go first, which
    /// tends to drain a graph towards its output.
    Depth,
    /// The explicit priority tag on the task decides, higher first.
    Explicit,
}

/// Result cache bounds.
///
/// The cache is unbounded unless one of the limits is set, which is a known
/// memory-growth risk for long sessions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of entries before least-recently-used ones are evicted.
    pub max_entries: Option<usize>,
    /// Maximum total size hint of stored collections, in bytes.
    pub max_bytes: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: None,
            max_bytes: None,
        }
    }
}

/// Settings for a [`Scheduler`](crate::Scheduler).
///
/// # Example
///
/// ```rust
/// use tsumiki::SchedulerConfig;
///
/// let config = SchedulerConfig::from_json(r#"{ "concurrency": false, "priority": "depth" }"#).unwrap();
/// assert!(!config.concurrency);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global switch for running tasks on worker threads. When off, every
    /// task runs synchronously inside `Scheduler::execute`.
    pub concurrency: bool,
    /// Size of the worker pool. `None` lets rayon decide.
    pub worker_threads: Option<usize>,
    /// Number of tasks that may execute on workers at once.
    pub max_concurrent_tasks: usize,
    pub priority: PriorityPolicy,
    pub cache: CacheConfig,
    /// Record start time and duration of every finished task.
    pub diagnostics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: true,
            worker_threads: None,
            max_concurrent_tasks: default_parallelism(),
            priority: PriorityPolicy::default(),
            cache: CacheConfig::default(),
            diagnostics: false,
        }
    }
}

impl SchedulerConfig {
    /// A configuration that never leaves the calling thread.
    pub fn synchronous() -> Self {
        Self {
            concurrency: false,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tasks",
                "must be at least 1".into(),
            ));
        }

        if self.worker_threads == Some(0) {
            return Err(ConfigError::Invalid(
                "worker_threads",
                "must be at least 1 when set".into(),
            ));
        }

        Ok(())
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
