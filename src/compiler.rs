//! Interface to the graph compiler.
//!
//! The compiler flattens an authored node graph into a [`CompiledGraph`]: an
//! ordered list of tasks whose dependencies are indices into the same list.
//! How that happens is not this crate's business; the scheduler only checks
//! that the list is well formed before turning it into live tasks.

use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::data::PinMask;
use crate::element::Element;
use crate::error::ScheduleError;
use crate::task::{GraphId, Stack};

/// A data dependency between two compiled tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompiledInput {
    pub task: usize,
    pub pins: PinMask,
    pub input_pin: u8,
}

pub struct CompiledTask {
    pub element: Arc<dyn Element>,
    pub execution_dependencies: Vec<usize>,
    pub data_dependencies: Vec<CompiledInput>,
    /// Frames this task originates from. Tasks without one get the root
    /// frame of their graph.
    pub stack: Option<Stack>,
    pub priority: i32,
}

impl CompiledTask {
    pub fn new(element: Arc<dyn Element>) -> Self {
        Self {
            element,
            execution_dependencies: Vec::new(),
            data_dependencies: Vec::new(),
            stack: None,
            priority: 0,
        }
    }

    /// Runs after `task` without reading its output.
    pub fn after(mut self, task: usize) -> Self {
        self.execution_dependencies.push(task);
        self
    }

    /// Reads every output pin of `task` on input pin 0.
    pub fn input(self, task: usize) -> Self {
        self.input_pins(task, PinMask::ALL, 0)
    }

    pub fn input_pins(mut self, task: usize, pins: PinMask, input_pin: u8) -> Self {
        self.data_dependencies.push(CompiledInput {
            task,
            pins,
            input_pin,
        });
        self
    }

    pub fn with_stack(mut self, stack: Stack) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn dependencies(&self) -> impl Iterator<Item = usize> + '_ {
        self.execution_dependencies
            .iter()
            .copied()
            .chain(self.data_dependencies.iter().map(|input| input.task))
    }
}

/// The flat output of compiling one graph.
pub struct CompiledGraph {
    pub graph: GraphId,
    pub tasks: Vec<CompiledTask>,
    /// Index of the task whose completion means "graph is done".
    pub output: usize,
}

impl CompiledGraph {
    pub fn new(graph: GraphId) -> Self {
        Self {
            graph,
            tasks: Vec::new(),
            output: 0,
        }
    }

    /// Appends a task and returns its index.
    pub fn push(&mut self, task: CompiledTask) -> usize {
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    pub fn set_output(&mut self, index: usize) {
        self.output = index;
    }

    /// Checks indices and acyclicity. Returns the task indices in a valid
    /// execution order.
    pub fn validate(&self) -> Result<Vec<usize>, ScheduleError> {
        if self.tasks.is_empty() {
            return Err(ScheduleError::EmptyGraph);
        }

        if self.output >= self.tasks.len() {
            return Err(ScheduleError::InvalidOutput(self.output));
        }

        let mut graph = DiGraph::<usize, ()>::with_capacity(self.tasks.len(), 0);
        let nodes: Vec<NodeIndex> = (0..self.tasks.len()).map(|i| graph.add_node(i)).collect();

        for (index, task) in self.tasks.iter().enumerate() {
            for dependency in task.dependencies() {
                let Some(&from) = nodes.get(dependency) else {
                    return Err(ScheduleError::InvalidDependency {
                        task: index,
                        index: dependency,
                    });
                };
                graph.add_edge(from, nodes[index], ());
            }
        }

        let order = toposort(&graph, None).map_err(|_| ScheduleError::Cycle)?;
        Ok(order.into_iter().map(|node| graph[node]).collect())
    }
}

/// Compiled-task caches owned by the graph compiler.
///
/// Registered with the scheduler so that flushing the result cache also
/// drops compiled task lists, which would otherwise resurrect stale results.
pub trait CompilerCache: Send + Sync {
    fn clear(&self);
}
