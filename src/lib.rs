#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod compiler;
mod config;
mod context;
mod core;
mod data;
mod element;
mod error;
mod fingerprint;
#[cfg(feature = "logging")]
mod logging;
mod output;
mod scheduler;
mod task;

pub use crate::cache::{CachedResult, ResultCache, StoreOutcome};
pub use crate::compiler::{CompiledGraph, CompiledInput, CompiledTask, CompilerCache};
pub use crate::config::{CacheConfig, PriorityPolicy, SchedulerConfig};
pub use crate::context::{AbortContext, ExecutionContext, Waker};
pub use crate::core::Hash32;
pub use crate::data::{DataCollection, MAX_PINS, PinMask, TaggedData};
pub use crate::element::{Capabilities, Element, ElementId, FnElement};
pub use crate::error::{ConfigError, ElementError, ScheduleError};
pub use crate::fingerprint::Fingerprint;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::scheduler::{
    CancelFilter, Diagnostics, Scheduler, TaskExecution, TaskState, TickReport,
};
pub use crate::task::{
    DataDependency, ExecutionSource, GenericTask, GraphId, Stack, StackFrame, Task, TaskId,
};
