//! The executor.
//!
//! [`Scheduler::schedule`] and friends, [`Scheduler::cancel`] and the query
//! methods may be called from any thread. [`Scheduler::execute`] advances the
//! task graph and must only ever be called from one thread, once per tick.
//!
//! Shared state is split over four lock levels (see [`lock::LockLevel`]) that
//! are always acquired outermost first:
//!
//! 1. the scheduling queue (id allocation, shutdown flag),
//! 2. the task store and its successor index,
//! 3. the live sets (ready, active, paused, fingerprint owners),
//! 4. leaves (output store, result cache, abort tracking, completion inbox).

mod cancel;
mod diagnostics;
mod live;
mod lock;
mod store;
mod tick;
mod worker;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use tracing::{debug, info, trace, warn};

use crate::cache::ResultCache;
use crate::compiler::{CompiledGraph, CompilerCache};
use crate::config::{PriorityPolicy, SchedulerConfig};
use crate::data::{DataCollection, PinMask};
use crate::element::ElementId;
use crate::error::{ConfigError, ScheduleError};
use crate::output::OutputStore;
use crate::task::{
    DataDependency, ExecutionSource, GenericOperation, GenericTask, GraphId, Stack, Task, TaskId,
    TaskKind,
};

pub use cancel::CancelFilter;
pub use diagnostics::{Diagnostics, TaskExecution};
pub use store::TaskState;
pub use tick::TickReport;

use live::Live;
use lock::{LockLevel, Leveled};
use store::{Edge, TaskRecord, TaskStore};
use worker::Completion;

struct Queue {
    next_id: TaskId,
    shutting_down: bool,
}

/// Schedules, executes, caches and retires tasks.
///
/// # Example
///
/// ```rust
/// use std::time::{Duration, Instant};
/// use tsumiki::{
///     CompiledGraph, CompiledTask, ExecutionSource, FnElement, GraphId, Scheduler,
///     SchedulerConfig, TaggedData,
/// };
///
/// let scheduler = Scheduler::new(SchedulerConfig::synchronous()).unwrap();
///
/// let mut graph = CompiledGraph::new(GraphId::new(1));
/// let seed = graph.push(CompiledTask::new(
///     FnElement::new("seed", |ctx| {
///         ctx.push_output(TaggedData::new(0, 21u32));
///         Ok(true)
///     })
///     .into_arc(),
/// ));
/// let double = graph.push(
///     CompiledTask::new(
///         FnElement::new("double", |ctx| {
///             let value = *ctx.input::<u32>(0).unwrap();
///             ctx.push_output(TaggedData::new(0, value * 2));
///             Ok(true)
///         })
///         .into_arc(),
///     )
///     .input(seed),
/// );
/// graph.set_output(double);
///
/// let done = scheduler.schedule(graph, &[], &ExecutionSource::new("example"));
/// scheduler.execute(Instant::now() + Duration::from_secs(1));
///
/// let output = scheduler.get_output_data(done).unwrap();
/// assert_eq!(output.values::<u32>(0).next(), Some(&42));
/// ```
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Leveled<Queue>,
    store: Leveled<TaskStore>,
    live: Leveled<Live>,
    outputs: Leveled<OutputStore>,
    cache: Leveled<ResultCache>,
    aborting: Leveled<HashSet<TaskId>>,
    diagnostics: Leveled<Diagnostics>,
    inbox: Leveled<Receiver<Completion>>,
    compiler_caches: Leveled<Vec<Arc<dyn CompilerCache>>>,
    sender: Sender<Completion>,
    pool: Option<rayon::ThreadPool>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let pool = if config.concurrency {
            let mut builder = rayon::ThreadPoolBuilder::new()
                .thread_name(|index| format!("tsumiki-worker-{index}"));
            if let Some(threads) = config.worker_threads {
                builder = builder.num_threads(threads);
            }
            Some(builder.build()?)
        } else {
            None
        };

        let (sender, receiver) = channel();

        debug!(
            concurrency = config.concurrency,
            slots = config.max_concurrent_tasks,
            priority = ?config.priority,
            "scheduler created"
        );

        Ok(Self {
            cache: Leveled::new(LockLevel::Leaf, "cache", ResultCache::new(config.cache.clone())),
            queue: Leveled::new(
                LockLevel::Queue,
                "queue",
                Queue {
                    next_id: TaskId::FIRST,
                    shutting_down: false,
                },
            ),
            store: Leveled::new(LockLevel::Tasks, "tasks", TaskStore::default()),
            live: Leveled::new(LockLevel::Live, "live", Live::default()),
            outputs: Leveled::new(LockLevel::Leaf, "outputs", OutputStore::default()),
            aborting: Leveled::new(LockLevel::Leaf, "aborting", HashSet::new()),
            diagnostics: Leveled::new(LockLevel::Leaf, "diagnostics", Diagnostics::default()),
            inbox: Leveled::new(LockLevel::Leaf, "inbox", receiver),
            compiler_caches: Leveled::new(LockLevel::Leaf, "compiler caches", Vec::new()),
            sender,
            pool,
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Schedules a compiled graph and returns the id of the task whose
    /// completion means the graph is done, or [`TaskId::INVALID`] if the
    /// request was rejected.
    ///
    /// `dependencies` become execution dependencies of every task of the
    /// graph that has none of its own.
    pub fn schedule(
        &self,
        graph: CompiledGraph,
        dependencies: &[TaskId],
        source: &ExecutionSource,
    ) -> TaskId {
        self.try_schedule(graph, dependencies, source)
            .unwrap_or_else(|err| {
                warn!(%source, "rejected schedule request: {err}");
                TaskId::INVALID
            })
    }

    pub fn try_schedule(
        &self,
        graph: CompiledGraph,
        dependencies: &[TaskId],
        source: &ExecutionSource,
    ) -> Result<TaskId, ScheduleError> {
        let order = graph.validate()?;

        let mut queue = self.queue.lock();
        if queue.shutting_down {
            return Err(ScheduleError::ShuttingDown);
        }
        check_issued(&queue, dependencies)?;

        let base = queue.next_id;
        let id_of = |index: usize| base.offset(index as u64);

        let CompiledGraph {
            graph: graph_id,
            tasks,
            output,
        } = graph;

        let mut slots: Vec<Option<_>> = tasks.into_iter().map(Some).collect();
        let mut created = Vec::with_capacity(slots.len());

        for index in order {
            let Some(compiled) = slots[index].take() else {
                continue;
            };

            let mut execution_dependencies: Vec<TaskId> = compiled
                .execution_dependencies
                .iter()
                .map(|&i| id_of(i))
                .collect();
            if compiled.execution_dependencies.is_empty() && compiled.data_dependencies.is_empty() {
                execution_dependencies.extend_from_slice(dependencies);
            }

            let data_dependencies = compiled
                .data_dependencies
                .iter()
                .map(|input| DataDependency {
                    task: id_of(input.task),
                    pins: input.pins,
                    input_pin: input.input_pin,
                })
                .collect();

            let stack = compiled.stack.unwrap_or_else(|| Stack::root(graph_id));

            created.push(Task {
                id: id_of(index),
                capabilities: compiled.element.capabilities(),
                kind: TaskKind::Element(compiled.element),
                execution_dependencies,
                data_dependencies,
                source: source.clone(),
                stack: Some(Arc::new(stack)),
                priority: compiled.priority,
                depth: 0,
                retain_output: index == output,
            });
        }

        queue.next_id = base.offset(created.len() as u64);
        debug!(%source, graph = graph_id.get(), tasks = created.len(), "scheduled graph");
        self.insert(created);

        Ok(id_of(output))
    }

    /// Schedules an arbitrary operation. Generic tasks are never cached.
    pub fn schedule_generic(
        &self,
        task: GenericTask,
        source: &ExecutionSource,
        execution_dependencies: &[TaskId],
        data_dependencies: &[DataDependency],
    ) -> TaskId {
        self.try_schedule_generic(task, source, execution_dependencies, data_dependencies)
            .unwrap_or_else(|err| {
                warn!(%source, "rejected generic schedule request: {err}");
                TaskId::INVALID
            })
    }

    pub fn try_schedule_generic(
        &self,
        task: GenericTask,
        source: &ExecutionSource,
        execution_dependencies: &[TaskId],
        data_dependencies: &[DataDependency],
    ) -> Result<TaskId, ScheduleError> {
        let mut queue = self.queue.lock();
        if queue.shutting_down {
            return Err(ScheduleError::ShuttingDown);
        }
        check_issued(&queue, execution_dependencies)?;
        check_issued(
            &queue,
            &data_dependencies.iter().map(|d| d.task).collect::<Vec<_>>(),
        )?;

        let id = queue.next_id;
        queue.next_id = id.next();

        let retain_output = task.retains_output();
        let capabilities = task.capabilities();
        self.insert(vec![Task {
            id,
            kind: TaskKind::Generic(GenericOperation::from(task)),
            capabilities,
            execution_dependencies: execution_dependencies.to_vec(),
            data_dependencies: data_dependencies.to_vec(),
            source: source.clone(),
            stack: None,
            priority: 0,
            depth: 0,
            retain_output,
        }]);

        Ok(id)
    }

    /// Adds freshly built tasks, dependencies first. Called with the queue
    /// lock held.
    fn insert(&self, tasks: Vec<Task>) {
        let mut store = self.store.lock();
        let mut late_consumers = Vec::new();
        let mut ready = Vec::new();
        let mut culled = Vec::new();

        for mut task in tasks {
            let dependencies = task.dependencies();

            task.depth = dependencies
                .iter()
                .filter_map(|&d| store.get(d))
                .map(|r| r.task.depth + 1)
                .max()
                .unwrap_or(0);

            let task = Arc::new(task);
            let id = task.id;
            let mut record = TaskRecord::new(task.clone());

            for dependency in dependencies {
                let edge = Edge {
                    data: task.data_dependencies.iter().any(|d| d.task == dependency),
                    execution: task.execution_dependencies.contains(&dependency),
                };

                let Some(producer) = store.get(dependency) else {
                    // finished and released, or removed
                    continue;
                };

                match producer.state {
                    TaskState::Done | TaskState::Cancelled => {
                        let inherits = edge.execution
                            || !task.capabilities.tolerates_missing_inputs();
                        if producer.state == TaskState::Cancelled && inherits {
                            record.inherit_cancel = true;
                        }
                        if edge.data {
                            late_consumers.push(dependency);
                            record.counted_by.push(dependency);

                            let inactive = self
                                .outputs
                                .lock()
                                .get(dependency)
                                .map_or(PinMask::NONE, |data| data.inactive_pins());
                            if !inactive.is_empty() && !task.reads_active_pin(dependency, inactive) {
                                record.dead_producers.insert(dependency);
                            }
                        }
                    }
                    _ => record.waiting_on += 1,
                }

                store.link(dependency, id, edge);
            }

            if !record.dead_producers.is_empty() && record.is_starved() {
                culled.push(id);
            } else if record.waiting_on == 0 {
                record.state = TaskState::Ready;
                ready.push(task.clone());
            }

            trace!(task = %id, name = task.name(), waiting_on = record.waiting_on, "task added");
            store.insert(record);
        }

        if !late_consumers.is_empty() {
            let mut outputs = self.outputs.lock();
            for producer in late_consumers {
                outputs.add_consumer(producer);
            }
        }

        if !culled.is_empty() {
            self.cull_late_readers(&mut store, culled);
        }

        if !ready.is_empty() {
            let mut live = self.live.lock();
            for task in ready {
                live.push_ready(task.id, self.priority_key(&task), self.needs_worker(&task));
            }
        }
    }

    /// The retained output of a finished task, if any.
    pub fn get_output_data(&self, id: TaskId) -> Option<DataCollection> {
        self.outputs.lock().get(id)
    }

    /// Releases a retained output regardless of pending consumers. Returns
    /// whether anything was released.
    pub fn clear_output_data(&self, id: TaskId) -> bool {
        let mut store = self.store.lock();
        let cleared = self.outputs.lock().clear_output_data(id);
        if cleared {
            store.remove_released([id]);
        }
        cleared
    }

    pub fn is_output_retained(&self, id: TaskId) -> bool {
        self.outputs.lock().is_retained(id)
    }

    /// Dependents that still have to read a retained output, or `None` if
    /// nothing is retained for `id`.
    pub fn pending_consumers(&self, id: TaskId) -> Option<usize> {
        self.outputs.lock().remaining(id)
    }

    /// True if a dependent of this retained output was pruned because it read
    /// only pins the task left inactive.
    pub fn was_output_culled(&self, id: TaskId) -> bool {
        self.outputs.lock().was_culled(id)
    }

    /// `None` once a task has been removed or its output released.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.store.lock().get(id).map(|r| r.state)
    }

    /// True while any unfinished task originates from the given graph or one
    /// of its sub-graphs.
    pub fn is_graph_currently_executing(&self, graph: GraphId) -> bool {
        self.store
            .lock()
            .records()
            .any(|r| !r.state.is_terminal() && r.task.in_graph(graph))
    }

    /// Number of tasks that have not finished yet.
    pub fn live_task_count(&self) -> usize {
        self.store.lock().live_count()
    }

    /// True while cancelled executions are still running on a worker.
    pub fn has_pending_cleanup(&self) -> bool {
        !self.aborting.lock().is_empty()
    }

    pub fn cache_entry_count(&self) -> usize {
        self.cache.lock().entry_count()
    }

    pub fn cache_entry_count_for(&self, element: ElementId) -> usize {
        self.cache.lock().entry_count_for(element)
    }

    pub fn cache_total_bytes(&self) -> u64 {
        self.cache.lock().total_bytes()
    }

    /// Drops every cached result of one processing unit.
    pub fn clean_from_cache(&self, element: ElementId) -> usize {
        self.cache.lock().clean_element(element)
    }

    /// Drops every cached result, leaving compiler caches alone.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Drops every cached result and every registered compiler cache.
    pub fn flush_cache(&self) {
        self.clear_cache();

        let caches = self.compiler_caches.lock().clone();
        for cache in &caches {
            cache.clear();
        }

        info!(compiler_caches = caches.len(), "flushed caches");
    }

    pub fn register_compiler_cache(&self, cache: Arc<dyn CompilerCache>) {
        self.compiler_caches.lock().push(cache);
    }

    /// Snapshot of the execution metrics collected so far.
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.lock().clone()
    }

    pub fn take_diagnostics(&self) -> Diagnostics {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    /// Renders every known task as a Mermaid graph, colour-coded by state.
    pub fn render_mermaid(&self) -> String {
        let store = self.store.lock();
        let diagnostics = self.diagnostics.lock();
        diagnostics::render_mermaid(&store, &diagnostics)
    }

    /// Rejects every later schedule request and cancels everything. Returns
    /// the affected sources.
    pub fn shutdown(&self) -> HashSet<ExecutionSource> {
        {
            let mut queue = self.queue.lock();
            if !queue.shutting_down {
                info!("shutting down scheduler");
            }
            queue.shutting_down = true;
        }

        self.cancel(CancelFilter::All)
    }

    fn priority_key(&self, task: &Task) -> i64 {
        match self.config.priority {
            PriorityPolicy::Fifo => 0,
            PriorityPolicy::Depth => i64::from(task.depth),
            PriorityPolicy::Explicit => i64::from(task.priority),
        }
    }

    fn needs_worker(&self, task: &Task) -> bool {
        self.pool.is_some() && !task.capabilities.is_main_thread_only()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_issued(queue: &Queue, ids: &[TaskId]) -> Result<(), ScheduleError> {
    match ids.iter().find(|id| !id.is_valid() || **id >= queue.next_id) {
        Some(&id) => Err(ScheduleError::UnknownDependency(id)),
        None => Ok(()),
    }
}
