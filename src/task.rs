//! Scheduled units of work and the identifiers that group them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::ExecutionContext;
use crate::core::{ArcStr, Hash32};
use crate::data::PinMask;
use crate::element::{Capabilities, Element};

/// Identifier of a scheduled task.
///
/// Ids increase monotonically within a scheduling session and are never
/// reused while anything still refers to them. `TaskId::INVALID` is what
/// rejected schedule requests hand back.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TaskId(u64);

impl TaskId {
    pub const INVALID: TaskId = TaskId(0);

    pub(crate) const FIRST: TaskId = TaskId(1);

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub(crate) const fn next(self) -> TaskId {
        self.offset(1)
    }

    pub(crate) const fn offset(self, n: u64) -> TaskId {
        TaskId(self.0 + n)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_SOURCE: AtomicU64 = AtomicU64::new(1);

/// The external requester of a schedule, e.g. one generation request.
///
/// Only used to group tasks for cancellation and reporting; it never affects
/// scheduling order. Two sources compare equal only if one is a clone of the
/// other.
#[derive(Clone)]
pub struct ExecutionSource {
    id: u64,
    name: ArcStr,
}

impl ExecutionSource {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        Self {
            id: NEXT_SOURCE.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ExecutionSource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ExecutionSource {}

impl std::hash::Hash for ExecutionSource {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for ExecutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutionSource({}:{})", self.name, self.id)
    }
}

impl std::fmt::Display for ExecutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

/// Identity of a compiled graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct GraphId(u64);

impl GraphId {
    pub const fn new(id: u64) -> Self {
        GraphId(id)
    }

    /// Derives a graph id from a name, e.g. an asset path.
    pub fn from_name(name: &str) -> Self {
        let hash = Hash32::hash(name);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        GraphId(u64::from_le_bytes(bytes))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// One level of the path from a top-level graph to a task.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StackFrame {
    Graph(GraphId),
    Node(ArcStr),
    LoopIndex(u32),
}

/// Correlates a task back to the graph frames it originated from.
///
/// Cancelling a graph matches every task whose stack passes through it, so
/// tasks of a sub-graph are cancelled together with their parent graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Stack {
    frames: Vec<StackFrame>,
}

impl Stack {
    pub fn root(graph: GraphId) -> Self {
        Self {
            frames: vec![StackFrame::Graph(graph)],
        }
    }

    /// A child stack with one more frame.
    pub fn push(&self, frame: StackFrame) -> Self {
        let mut frames = self.frames.clone();
        frames.push(frame);
        Self { frames }
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn graphs(&self) -> impl Iterator<Item = GraphId> + '_ {
        self.frames.iter().filter_map(|frame| match frame {
            StackFrame::Graph(graph) => Some(*graph),
            _ => None,
        })
    }

    pub fn contains_graph(&self, graph: GraphId) -> bool {
        self.graphs().any(|g| g == graph)
    }
}

impl std::fmt::Display for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match frame {
                StackFrame::Graph(graph) => write!(f, "graph:{:x}", graph.get())?,
                StackFrame::Node(name) => f.write_str(name)?,
                StackFrame::LoopIndex(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// A dependency whose output is consumed as input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataDependency {
    /// The producing task.
    pub task: TaskId,
    /// Output pins of the producer that are read.
    pub pins: PinMask,
    /// Input pin of the consumer the data lands on.
    pub input_pin: u8,
}

impl DataDependency {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            pins: PinMask::ALL,
            input_pin: 0,
        }
    }

    pub fn from_pins(mut self, pins: PinMask) -> Self {
        self.pins = pins;
        self
    }

    pub fn into_pin(mut self, pin: u8) -> Self {
        self.input_pin = pin;
        self
    }
}

impl From<TaskId> for DataDependency {
    fn from(task: TaskId) -> Self {
        DataDependency::new(task)
    }
}

type GenericFn = dyn FnMut(&mut ExecutionContext) -> bool + Send;
type GenericAbortFn = dyn Fn() + Send + Sync;

/// An arbitrary unit of work without a processing-unit identity.
///
/// Generic tasks are never cached. The operation is called repeatedly until
/// it returns `true`.
pub struct GenericTask {
    name: ArcStr,
    operation: Box<GenericFn>,
    abort: Option<Box<GenericAbortFn>>,
    main_thread_only: bool,
    retain_output: bool,
}

impl GenericTask {
    pub fn new<F>(mut operation: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::with_context(move |_| operation())
    }

    /// A generic operation that can read its inputs and write an output.
    pub fn with_context<F>(operation: F) -> Self
    where
        F: FnMut(&mut ExecutionContext) -> bool + Send + 'static,
    {
        Self {
            name: "generic".into(),
            operation: Box::new(operation),
            abort: None,
            main_thread_only: false,
            retain_output: false,
        }
    }

    pub fn named(mut self, name: impl Into<ArcStr>) -> Self {
        self.name = name.into();
        self
    }

    /// Called when the task is cancelled while running, on the cancelling
    /// thread (see [`Element::abort`]).
    pub fn on_abort<F>(mut self, abort: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.abort = Some(Box::new(abort));
        self
    }

    pub fn main_thread_only(mut self) -> Self {
        self.main_thread_only = true;
        self
    }

    /// Keeps the output until it is cleared explicitly, as for the output
    /// task of a compiled graph.
    pub fn retain_output(mut self) -> Self {
        self.retain_output = true;
        self
    }

    pub(crate) fn retains_output(&self) -> bool {
        self.retain_output
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::new();
        if self.main_thread_only {
            caps = caps.main_thread_only();
        }
        if self.abort.is_some() {
            caps = caps.supports_abort();
        }
        caps
    }
}

pub(crate) struct GenericOperation {
    name: ArcStr,
    operation: Mutex<Box<GenericFn>>,
    abort: Option<Box<GenericAbortFn>>,
}

impl GenericOperation {
    pub(crate) fn run(&self, context: &mut ExecutionContext) -> bool {
        let mut operation = self.operation.lock().unwrap_or_else(PoisonError::into_inner);
        operation(context)
    }

    pub(crate) fn abort(&self) {
        if let Some(abort) = &self.abort {
            abort();
        }
    }
}

impl From<GenericTask> for GenericOperation {
    fn from(task: GenericTask) -> Self {
        Self {
            name: task.name,
            operation: Mutex::new(task.operation),
            abort: task.abort,
        }
    }
}

pub(crate) enum TaskKind {
    Element(Arc<dyn Element>),
    Generic(GenericOperation),
}

/// One scheduled unit of work. Immutable once created.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) capabilities: Capabilities,
    pub(crate) execution_dependencies: Vec<TaskId>,
    pub(crate) data_dependencies: Vec<DataDependency>,
    pub(crate) source: ExecutionSource,
    pub(crate) stack: Option<Arc<Stack>>,
    pub(crate) priority: i32,
    pub(crate) depth: u32,
    pub(crate) retain_output: bool,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            TaskKind::Element(element) => element.name(),
            TaskKind::Generic(generic) => &generic.name,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn execution_dependencies(&self) -> &[TaskId] {
        &self.execution_dependencies
    }

    pub fn data_dependencies(&self) -> &[DataDependency] {
        &self.data_dependencies
    }

    pub fn source(&self) -> &ExecutionSource {
        &self.source
    }

    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Length of the longest dependency chain ending at this task.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Every distinct dependency, execution and data alike.
    pub fn dependencies(&self) -> Vec<TaskId> {
        let mut all: Vec<TaskId> = self
            .execution_dependencies
            .iter()
            .copied()
            .chain(self.data_dependencies.iter().map(|dep| dep.task))
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    /// Distinct producers whose output this task consumes.
    pub fn producers(&self) -> Vec<TaskId> {
        let mut producers: Vec<TaskId> = self.data_dependencies.iter().map(|d| d.task).collect();
        producers.sort_unstable();
        producers.dedup();
        producers
    }

    /// Whether any dependency on `producer` reads a pin outside `inactive`.
    pub(crate) fn reads_active_pin(&self, producer: TaskId, inactive: PinMask) -> bool {
        self.data_dependencies
            .iter()
            .filter(|d| d.task == producer)
            .any(|d| !(d.pins & !inactive).is_empty())
    }

    pub(crate) fn element(&self) -> Option<&Arc<dyn Element>> {
        match &self.kind {
            TaskKind::Element(element) => Some(element),
            TaskKind::Generic(_) => None,
        }
    }

    pub(crate) fn in_graph(&self, graph: GraphId) -> bool {
        self.stack
            .as_deref()
            .is_some_and(|stack| stack.contains_graph(graph))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("execution_dependencies", &self.execution_dependencies)
            .field("data_dependencies", &self.data_dependencies)
            .field("source", &self.source)
            .finish()
    }
}
