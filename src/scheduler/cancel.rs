use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::context::AbortContext;
use crate::data::PinMask;
use crate::scheduler::Scheduler;
use crate::scheduler::live::Live;
use crate::scheduler::store::{TaskRecord, TaskState, TaskStore};
use crate::task::{ExecutionSource, GraphId, Task, TaskId, TaskKind};

/// Selects the tasks a cancellation applies to.
#[derive(Debug, Clone)]
pub enum CancelFilter {
    All,
    /// Tasks scheduled on behalf of one requester.
    Source(ExecutionSource),
    /// Tasks of a graph, including tasks of its sub-graphs.
    Graph(GraphId),
}

impl CancelFilter {
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            CancelFilter::All => true,
            CancelFilter::Source(source) => task.source() == source,
            CancelFilter::Graph(graph) => task.in_graph(*graph),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prune {
    /// Dependents go when every dependency was removed.
    Cancel,
    /// Waiting dependents go when nothing they read can arrive.
    Cull,
}

type PendingAbort = (Arc<Task>, AbortContext);

impl Scheduler {
    /// Removes every unfinished task matching `filter`, then every dependent
    /// left without a single live dependency. Returns the sources of all
    /// removed tasks.
    ///
    /// Running executions cannot be stopped: cancellable ones are signalled
    /// and get their abort callback, and whatever they return is dropped.
    pub fn cancel(&self, filter: CancelFilter) -> HashSet<ExecutionSource> {
        self.cancel_where(|task| filter.matches(task))
    }

    pub fn cancel_all(&self) -> HashSet<ExecutionSource> {
        self.cancel(CancelFilter::All)
    }

    /// Like [`Scheduler::cancel`] with an arbitrary predicate.
    pub fn cancel_where<F>(&self, predicate: F) -> HashSet<ExecutionSource>
    where
        F: Fn(&Task) -> bool,
    {
        let mut aborts = Vec::new();

        let (removed, sources) = {
            let mut store = self.store.lock();
            let seeds: Vec<TaskId> = store
                .records()
                .filter(|r| !r.state.is_terminal() && predicate(&r.task))
                .map(|r| r.task.id)
                .collect();

            if seeds.is_empty() {
                return HashSet::new();
            }

            let before = store.live_count();
            let sources = self.remove_cascade(&mut store, seeds, Prune::Cancel, &mut aborts);
            (before.saturating_sub(store.live_count()), sources)
        };

        let aborted = aborts.len();
        run_aborts(aborts);

        info!(removed, aborted, sources = sources.len(), "cancelled tasks");
        sources
    }

    /// Drops the dependents of `producer` that read nothing but pins it left
    /// inactive, and whatever depended only on them. Called with the task
    /// store locked, before the producer's consumers are counted.
    pub(crate) fn cull_inactive_downstream(&self, store: &mut TaskStore, producer: TaskId, inactive: PinMask) {
        let mut seeds = Vec::new();

        for (successor, edge) in store.successors(producer) {
            if !edge.data {
                continue;
            }
            let Some(dependent) = store.get_mut(successor) else {
                continue;
            };
            if dependent.state != TaskState::Waiting {
                continue;
            }

            if dependent.task.reads_active_pin(producer, inactive) {
                continue;
            }

            dependent.dead_producers.insert(producer);
            if dependent.is_starved() {
                seeds.push(successor);
            }
        }

        if seeds.is_empty() {
            return;
        }

        let mut aborts = Vec::new();
        let culled = seeds.len();
        self.remove_cascade(store, seeds, Prune::Cull, &mut aborts);
        debug_assert!(aborts.is_empty(), "culled a task that was already running");

        debug!(task = %producer, inactive = ?inactive, culled, "culled inactive branch");
    }

    /// Drops freshly scheduled tasks that read nothing but inactive pins of
    /// producers which already finished, and whatever depended only on them.
    /// Called with the task store locked.
    pub(crate) fn cull_late_readers(&self, store: &mut TaskStore, seeds: Vec<TaskId>) {
        let mut aborts = Vec::new();
        let culled = seeds.len();
        self.remove_cascade(store, seeds, Prune::Cull, &mut aborts);
        debug_assert!(aborts.is_empty(), "culled a task that was already running");

        debug!(culled, "culled readers of inactive pins");
    }

    /// Breadth-first removal along the successor index. Dependents that
    /// survive a removed dependency stop waiting for it.
    fn remove_cascade(
        &self,
        store: &mut TaskStore,
        seeds: Vec<TaskId>,
        mode: Prune,
        aborts: &mut Vec<PendingAbort>,
    ) -> HashSet<ExecutionSource> {
        let mut live = self.live.lock();
        let mut sources = HashSet::new();
        let mut doomed: HashSet<TaskId> = seeds.iter().copied().collect();
        let mut queue = VecDeque::from(seeds);

        while let Some(id) = queue.pop_front() {
            let successors = store.successors(id);
            let Some(record) = store.remove(id) else {
                continue;
            };

            sources.insert(record.task.source.clone());
            self.release_running(store, &mut live, &record, aborts);

            if !record.counted_by.is_empty() {
                let released: Vec<TaskId> = {
                    let mut outputs = self.outputs.lock();
                    record
                        .counted_by
                        .iter()
                        .copied()
                        .filter(|&p| outputs.remove_consumer(p, mode == Prune::Cull))
                        .collect()
                };
                store.remove_released(released);
            }

            trace!(task = %id, name = record.task.name(), state = ?record.state, "task removed");

            for (successor, edge) in successors {
                if doomed.contains(&successor) {
                    continue;
                }
                let Some(dependent) = store.get_mut(successor) else {
                    continue;
                };

                dependent.removed_deps.insert(id);
                if edge.data {
                    dependent.dead_producers.insert(id);
                }

                let remove = match mode {
                    Prune::Cancel => dependent.is_orphaned(),
                    Prune::Cull => dependent.state == TaskState::Waiting && dependent.is_starved(),
                };
                if remove {
                    doomed.insert(successor);
                    queue.push_back(successor);
                    continue;
                }

                if dependent.state == TaskState::Waiting {
                    dependent.waiting_on = dependent.waiting_on.saturating_sub(1);
                    if dependent.waiting_on == 0 {
                        dependent.state = TaskState::Ready;
                        let task = dependent.task.clone();
                        live.push_ready(successor, self.priority_key(&task), self.needs_worker(&task));
                    }
                }
            }
        }

        sources
    }

    /// Detaches a removed task from the live sets.
    fn release_running(
        &self,
        store: &mut TaskStore,
        live: &mut Live,
        record: &TaskRecord,
        aborts: &mut Vec<PendingAbort>,
    ) {
        let id = record.task.id;

        match record.state {
            TaskState::Preparing => live.remove_waiter(id),
            state if state.is_running() => {
                live.forget_resume(id);
                let Some(active) = live.active.remove(&id) else {
                    return;
                };

                if active.context.is_none() {
                    // still inside execute; the result is dropped on arrival
                    self.aborting.lock().insert(id);
                }

                if let Some(fingerprint) = active.fingerprint {
                    for waiter in live.release_fingerprint(fingerprint, id) {
                        let Some(waiting) = store.get_mut(waiter) else {
                            continue;
                        };
                        if waiting.state != TaskState::Preparing {
                            continue;
                        }
                        waiting.state = TaskState::Ready;
                        let task = waiting.task.clone();
                        live.push_ready(waiter, self.priority_key(&task), self.needs_worker(&task));
                    }
                }

                let capabilities = record.task.capabilities;
                if capabilities.is_cancellable() {
                    active.signal.raise();
                    if capabilities.has_abort() {
                        aborts.push((
                            record.task.clone(),
                            AbortContext::new(id, record.task.source.clone()),
                        ));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Runs abort callbacks with no lock held. Failures are logged and do not
/// stop the remaining callbacks.
fn run_aborts(aborts: Vec<PendingAbort>) {
    for (task, context) in aborts {
        let result = catch_unwind(AssertUnwindSafe(|| match &task.kind {
            TaskKind::Element(element) => element.abort(&context),
            TaskKind::Generic(generic) => {
                generic.abort();
                Ok(())
            }
        }));

        match result {
            Ok(Ok(())) => debug!(task = %task.id, name = task.name(), "abort callback finished"),
            Ok(Err(err)) => warn!(task = %task.id, name = task.name(), "abort callback failed: {err:#}"),
            Err(_) => warn!(task = %task.id, name = task.name(), "abort callback panicked"),
        }
    }
}
