//! Processing units.
//!
//! An [`Element`] is the domain-specific callable a task wraps. The scheduler
//! treats it as opaque apart from its [`Capabilities`], which are read once
//! when the task is created and stored on the task, so scheduling decisions
//! never call back into the element.

use std::borrow::Cow;
use std::sync::Arc;

use crate::context::{AbortContext, ExecutionContext};
use crate::core::Hash32;

/// Stable identity of a processing unit, independent of its settings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(Hash32);

impl ElementId {
    pub fn new(name: &str) -> Self {
        ElementId(Hash32::hash(name))
    }

    pub fn hash(&self) -> Hash32 {
        self.0
    }
}

impl std::fmt::Debug for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ElementId({})", self.0)
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The capability flags of a processing unit.
///
/// Built once when the element is registered:
///
/// ```rust
/// use tsumiki::Capabilities;
///
/// let caps = Capabilities::new().cacheable().supports_abort();
/// assert!(caps.is_cacheable());
/// assert!(!caps.is_main_thread_only());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capabilities {
    cacheable: bool,
    main_thread_only: bool,
    cancellable: bool,
    supports_abort: bool,
    tolerates_missing_inputs: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl Capabilities {
    /// Not cacheable, runs anywhere, cancellable, no abort callback, and
    /// substitutes empty data for cancelled inputs.
    pub const fn new() -> Self {
        Self {
            cacheable: false,
            main_thread_only: false,
            cancellable: true,
            supports_abort: false,
            tolerates_missing_inputs: true,
        }
    }

    pub const fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub const fn main_thread_only(mut self) -> Self {
        self.main_thread_only = true;
        self
    }

    pub const fn not_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    pub const fn supports_abort(mut self) -> Self {
        self.supports_abort = true;
        self
    }

    /// A cancelled data input cancels this element instead of being replaced
    /// by an empty collection.
    pub const fn requires_all_inputs(mut self) -> Self {
        self.tolerates_missing_inputs = false;
        self
    }

    pub const fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub const fn is_main_thread_only(&self) -> bool {
        self.main_thread_only
    }

    pub const fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    pub const fn has_abort(&self) -> bool {
        self.supports_abort
    }

    pub const fn tolerates_missing_inputs(&self) -> bool {
        self.tolerates_missing_inputs
    }
}

/// A processing unit.
///
/// `execute` may be called repeatedly for the same task until it returns
/// `Ok(true)`, which allows time-sliced work. Per-execution state belongs in
/// the context (see [`ExecutionContext::state_mut`]), never in `self`, since
/// one element instance can back many tasks at once.
pub trait Element: Send + Sync {
    fn name(&self) -> &str;

    fn identity(&self) -> ElementId {
        ElementId::new(self.name())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Hash of the effective settings, folded into the cache fingerprint.
    fn settings_identity(&self) -> Hash32 {
        Hash32::default()
    }

    fn execute(&self, context: &mut ExecutionContext) -> anyhow::Result<bool>;

    /// Called at most once, when a running task is cancelled and the
    /// capabilities declare abort support.
    ///
    /// Runs synchronously on the thread that called `Scheduler::cancel`,
    /// before that call returns and with no scheduler lock held. This holds
    /// for main-thread-only elements too, so an abort that touches
    /// main-thread state has to hand the work over itself.
    fn abort(&self, _context: &AbortContext) -> anyhow::Result<()> {
        Ok(())
    }
}

type ExecuteFn = dyn Fn(&mut ExecutionContext) -> anyhow::Result<bool> + Send + Sync;
type AbortFn = dyn Fn(&AbortContext) -> anyhow::Result<()> + Send + Sync;

/// An element backed by closures.
pub struct FnElement {
    name: Cow<'static, str>,
    capabilities: Capabilities,
    settings: Hash32,
    execute: Box<ExecuteFn>,
    abort: Option<Box<AbortFn>>,
}

impl FnElement {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, execute: F) -> Self
    where
        F: Fn(&mut ExecutionContext) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            capabilities: Capabilities::default(),
            settings: Hash32::default(),
            execute: Box::new(execute),
            abort: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Folds arbitrary settings into the fingerprint of every task running
    /// this element.
    pub fn with_settings<S: std::hash::Hash>(mut self, settings: &S) -> Self {
        self.settings = Hash32::of(settings);
        self
    }

    pub fn on_abort<F>(mut self, abort: F) -> Self
    where
        F: Fn(&AbortContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.abort = Some(Box::new(abort));
        self
    }

    pub fn into_arc(self) -> Arc<dyn Element> {
        Arc::new(self)
    }
}

impl Element for FnElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn settings_identity(&self) -> Hash32 {
        self.settings
    }

    fn execute(&self, context: &mut ExecutionContext) -> anyhow::Result<bool> {
        (self.execute)(context)
    }

    fn abort(&self, context: &AbortContext) -> anyhow::Result<()> {
        match &self.abort {
            Some(abort) => abort(context),
            None => Ok(()),
        }
    }
}
