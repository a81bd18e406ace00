use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;

use crate::data::DataCollection;
use crate::fingerprint::Fingerprint;
use crate::task::{Task, TaskId};

/// Observable state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// At least one dependency has not reached a terminal state.
    Waiting,
    /// Every dependency is settled; queued for a cache lookup.
    Ready,
    /// Inputs gathered, waiting on another task building the same
    /// fingerprint.
    Preparing,
    Executing,
    /// Suspended until its waker fires.
    Paused,
    /// Finished; the output is still retained.
    Done,
    /// Finished by inheriting cancellation; the cancelled output is still
    /// retained.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled)
    }

    pub(crate) fn is_running(self) -> bool {
        matches!(self, TaskState::Executing | TaskState::Paused)
    }
}

/// How a dependent relates to its producer. Both flags can be set when a
/// task lists the same producer twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Edge {
    pub data: bool,
    pub execution: bool,
}

/// Inputs resolved for a task, kept so that a task re-queued after losing a
/// fingerprint race does not gather again from outputs it already released.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub inputs: DataCollection,
    pub fingerprint: Option<Fingerprint>,
}

pub(crate) struct TaskRecord {
    pub task: Arc<Task>,
    pub state: TaskState,
    /// Distinct dependencies not yet settled.
    pub waiting_on: usize,
    pub inherit_cancel: bool,
    /// Producers whose consumer count includes this task.
    pub counted_by: Vec<TaskId>,
    /// Dependencies removed by cancellation or pruning.
    pub removed_deps: HashSet<TaskId>,
    /// Data producers that were removed or left every consumed pin inactive.
    pub dead_producers: HashSet<TaskId>,
    pub prepared: Option<Prepared>,
}

impl TaskRecord {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            state: TaskState::Waiting,
            waiting_on: 0,
            inherit_cancel: false,
            counted_by: Vec::new(),
            removed_deps: HashSet::new(),
            dead_producers: HashSet::new(),
            prepared: None,
        }
    }

    /// Every dependency was removed.
    pub(crate) fn is_orphaned(&self) -> bool {
        let dependencies = self.task.dependencies();
        !dependencies.is_empty() && dependencies.iter().all(|d| self.removed_deps.contains(d))
    }

    /// Nothing this task reads will ever arrive: every data producer is dead,
    /// or, lacking data dependencies, every dependency was removed.
    pub(crate) fn is_starved(&self) -> bool {
        let producers = self.task.producers();
        if producers.is_empty() {
            return self.is_orphaned();
        }
        producers.iter().all(|p| self.dead_producers.contains(p))
    }
}

/// Every known task, indexed by id, with a reverse index from each producer to
/// its dependents.
#[derive(Default)]
pub(crate) struct TaskStore {
    records: HashMap<TaskId, TaskRecord>,
    successors: DiGraphMap<TaskId, Edge>,
}

impl TaskStore {
    pub(crate) fn insert(&mut self, record: TaskRecord) {
        let id = record.task.id;
        self.successors.add_node(id);
        self.records.insert(id, record);
    }

    /// Records that `dependent` relies on `producer`.
    pub(crate) fn link(&mut self, producer: TaskId, dependent: TaskId, edge: Edge) {
        match self.successors.edge_weight_mut(producer, dependent) {
            Some(existing) => {
                existing.data |= edge.data;
                existing.execution |= edge.execution;
            }
            None => {
                self.successors.add_edge(producer, dependent, edge);
            }
        }
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.records.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> Option<TaskRecord> {
        self.successors.remove_node(id);
        self.records.remove(&id)
    }

    /// Drops finished records whose output has been released.
    pub(crate) fn remove_released(&mut self, released: impl IntoIterator<Item = TaskId>) {
        for id in released {
            if self.get(id).is_some_and(|r| r.state.is_terminal()) {
                self.remove(id);
            }
        }
    }

    pub(crate) fn successors(&self, id: TaskId) -> Vec<(TaskId, Edge)> {
        if !self.successors.contains_node(id) {
            return Vec::new();
        }

        self.successors
            .edges_directed(id, Direction::Outgoing)
            .map(|(_, to, edge)| (to, *edge))
            .collect()
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records.values()
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = (TaskId, TaskId, &Edge)> {
        self.successors.all_edges()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
