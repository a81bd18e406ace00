use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::context::{AbortSignal, ExecutionContext};
use crate::data::{DataCollection, TaggedData};
use crate::fingerprint::Fingerprint;
use crate::scheduler::Scheduler;
use crate::scheduler::diagnostics::TaskExecution;
use crate::scheduler::live::{ActiveTask, Job};
use crate::scheduler::store::{Prepared, TaskState, TaskStore};
use crate::scheduler::worker::{self, Completion, Outcome};
use crate::task::{Task, TaskId};

/// What one call to [`Scheduler::execute`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Executions started. Cache hits are not executions.
    pub started: usize,
    /// Tasks that finished with an output, cache hits included.
    pub completed: usize,
    /// Tasks that got their output from the cache or from another task
    /// building the same fingerprint.
    pub cache_hits: usize,
    /// Tasks that finished with a cancelled output.
    pub cancelled: usize,
    /// Unfinished tasks left after the tick.
    pub remaining: usize,
}

pub(crate) enum Finish {
    Done { data: DataCollection, cached: bool },
    Cancelled,
}

enum Prepare {
    Execute(Arc<Task>),
    Settled,
    Stale,
}

impl Scheduler {
    /// Advances the task graph. Must be called from one thread only.
    ///
    /// Results of finished workers are collected, woken tasks resumed, and
    /// ready tasks started until `deadline`. The first piece of work is
    /// always done so that a tick never stalls; no new work starts after the
    /// deadline has passed. The tick never waits for workers: it returns as
    /// soon as nothing can start, and results that arrive later are picked up
    /// by the next tick.
    pub fn execute(&self, deadline: Instant) -> TickReport {
        let span = tracing::info_span!("tick");
        let _enter = span.enter();

        let mut report = TickReport::default();
        self.drain_completions(&mut report);
        self.wake_paused();

        let mut worked = false;
        loop {
            if worked && Instant::now() >= deadline {
                break;
            }

            let job = self.live.lock().next_job(self.config.max_concurrent_tasks);
            match job {
                Some(Job::Start(id)) => match self.prepare(id, &mut report) {
                    Prepare::Execute(task) => {
                        report.started += 1;
                        worked = true;
                        self.dispatch(task, &mut report);
                    }
                    Prepare::Settled => worked = true,
                    Prepare::Stale => {}
                },
                Some(Job::Resume(id)) => {
                    worked = true;
                    let task = self.store.lock().get(id).map(|r| r.task.clone());
                    if let Some(task) = task {
                        self.dispatch(task, &mut report);
                    }
                }
                None => {
                    if self.drain_completions(&mut report) > 0 {
                        continue;
                    }
                    break;
                }
            }
        }

        self.drain_completions(&mut report);
        self.reset_ids_if_idle();

        report.remaining = self.store.lock().live_count();
        debug!(
            started = report.started,
            completed = report.completed,
            cache_hits = report.cache_hits,
            cancelled = report.cancelled,
            remaining = report.remaining,
            "tick finished"
        );

        report
    }

    /// Runs one tick with a budget instead of a deadline.
    pub fn execute_for(&self, budget: Duration) -> TickReport {
        self.execute(Instant::now() + budget)
    }

    fn drain_completions(&self, report: &mut TickReport) -> usize {
        let mut handled = 0;
        loop {
            let next = self.inbox.lock().try_recv();
            match next {
                Ok(completion) => {
                    self.handle_completion(completion, report);
                    handled += 1;
                }
                Err(_) => return handled,
            }
        }
    }

    fn wake_paused(&self) {
        let mut store = self.store.lock();
        let mut live = self.live.lock();

        for id in live.woken() {
            let Some(active) = live.active.get_mut(&id) else {
                continue;
            };
            active.pause = None;
            let needs_worker = active.needs_worker;
            live.push_resume(id, needs_worker);

            if let Some(record) = store.get_mut(id) {
                record.state = TaskState::Executing;
            }
            trace!(task = %id, "task resumed");
        }
    }

    /// Settles a Ready task: inherited cancellation, cache hit, or joining
    /// another task building the same fingerprint. Otherwise the task becomes
    /// Executing and is handed back for dispatch.
    fn prepare(&self, id: TaskId, report: &mut TickReport) -> Prepare {
        let mut store = self.store.lock();

        let Some(record) = store.get_mut(id) else {
            return Prepare::Stale;
        };
        if record.state != TaskState::Ready {
            return Prepare::Stale;
        }

        let task = record.task.clone();
        let prepared = match record.prepared.clone() {
            Some(prepared) => prepared,
            None => {
                let counted = std::mem::take(&mut record.counted_by);
                let (inputs, released) = {
                    let mut outputs = self.outputs.lock();
                    let inputs = gather_inputs(&task, |producer| outputs.get(producer));
                    (inputs, outputs.mark_input_results(counted))
                };
                store.remove_released(released);

                let fingerprint = self.fingerprint_for(&task, &inputs);
                Prepared {
                    inputs,
                    fingerprint,
                }
            }
        };

        let inherit_cancel = store.get(id).is_some_and(|r| r.inherit_cancel);
        if inherit_cancel {
            debug!(task = %id, name = task.name(), "task inherits cancellation");
            self.finish(&mut store, id, Finish::Cancelled, report);
            return Prepare::Settled;
        }

        if let Some(fingerprint) = prepared.fingerprint {
            let hit = self.cache.lock().get(&fingerprint);
            if let Some(data) = hit {
                report.cache_hits += 1;
                self.finish(&mut store, id, Finish::Done { data, cached: true }, report);
                return Prepare::Settled;
            }
        }

        let mut live = self.live.lock();
        if let Some(fingerprint) = prepared.fingerprint {
            match live.owner_of(&fingerprint) {
                Some(owner) if owner != id => {
                    live.add_waiter(owner, id);
                    drop(live);

                    if let Some(record) = store.get_mut(id) {
                        record.state = TaskState::Preparing;
                        record.prepared = Some(prepared);
                    }
                    trace!(task = %id, owner = %owner, "waiting on task with same fingerprint");
                    return Prepare::Settled;
                }
                _ => live.claim(fingerprint, id),
            }
        }

        let signal = AbortSignal::default();
        let context = ExecutionContext::new(
            id,
            task.source.clone(),
            task.stack.clone(),
            prepared.inputs.clone(),
            signal.clone(),
        );

        live.active.insert(
            id,
            ActiveTask {
                signal,
                context: Some(context),
                pause: None,
                fingerprint: prepared.fingerprint,
                started: Instant::now(),
                needs_worker: self.needs_worker(&task),
            },
        );
        drop(live);

        if let Some(record) = store.get_mut(id) {
            record.state = TaskState::Executing;
            record.prepared = Some(prepared);
        }
        trace!(task = %id, name = task.name(), "task started");

        Prepare::Execute(task)
    }

    fn fingerprint_for(&self, task: &Task, inputs: &DataCollection) -> Option<Fingerprint> {
        if !task.capabilities.is_cacheable() || !self.config.cache.enabled {
            return None;
        }

        let element = task.element()?;
        Some(Fingerprint::compute(
            element.identity(),
            element.settings_identity(),
            inputs,
        ))
    }

    /// Lends the task's context to a worker, or runs one call right here.
    fn dispatch(&self, task: Arc<Task>, report: &mut TickReport) {
        let id = task.id;

        let lent = {
            let mut live = self.live.lock();
            let lent = live.active.get_mut(&id).and_then(|active| {
                let context = active.context.take()?;
                Some((context, active.needs_worker))
            });
            if let Some((_, true)) = &lent {
                live.busy_workers += 1;
            }
            lent
        };

        let Some((mut context, on_worker)) = lent else {
            return;
        };

        match &self.pool {
            Some(pool) if on_worker => {
                worker::spawn(pool, task, context, self.sender.clone());
            }
            _ => {
                let outcome = worker::run_once(&task, &mut context);
                self.handle_completion(
                    Completion {
                        id,
                        context,
                        outcome,
                        on_worker: false,
                    },
                    report,
                );
            }
        }
    }

    fn handle_completion(&self, completion: Completion, report: &mut TickReport) {
        let Completion {
            id,
            mut context,
            outcome,
            on_worker,
        } = completion;

        let mut store = self.store.lock();

        if on_worker {
            let mut live = self.live.lock();
            live.busy_workers = live.busy_workers.saturating_sub(1);
        }

        if self.aborting.lock().remove(&id) {
            debug!(task = %id, "discarding result of a cancelled task");
            return;
        }

        match outcome {
            Outcome::Done => {
                let data = context.take_output();
                let finish = if data.is_cancelled() {
                    Finish::Cancelled
                } else {
                    Finish::Done { data, cached: false }
                };
                self.finish(&mut store, id, finish, report);
            }
            Outcome::Failed(err) => {
                let data = context.take_output().into_failed(format!("{err:#}"));
                self.finish(&mut store, id, Finish::Done { data, cached: false }, report);
            }
            Outcome::NotDone => {
                let mut live = self.live.lock();
                if let Some(active) = live.active.get_mut(&id) {
                    active.context = Some(context);
                    let needs_worker = active.needs_worker;
                    live.push_resume(id, needs_worker);
                }
            }
            Outcome::Paused(pause) => {
                debug!(task = %id, reason = %pause.reason, "task paused");
                {
                    let mut live = self.live.lock();
                    if let Some(active) = live.active.get_mut(&id) {
                        active.context = Some(context);
                        active.pause = Some(pause);
                    }
                }
                if let Some(record) = store.get_mut(id) {
                    record.state = TaskState::Paused;
                }
            }
        }
    }

    /// Settles a task: its output is stored, dependents are re-evaluated and
    /// tasks that waited on its fingerprint receive the same output. Called
    /// with the task store locked.
    pub(crate) fn finish(&self, store: &mut TaskStore, id: TaskId, finish: Finish, report: &mut TickReport) {
        let mut work = VecDeque::from([(id, finish)]);

        while let Some((id, finish)) = work.pop_front() {
            let Some(record) = store.get(id) else {
                continue;
            };
            let task = record.task.clone();
            let fingerprint = record.prepared.as_ref().and_then(|p| p.fingerprint);

            let (data, cached, cancelled) = match finish {
                Finish::Done { data, cached } => (data, cached, false),
                Finish::Cancelled => (DataCollection::cancelled(), false, true),
            };

            if !cancelled && !data.inactive_pins().is_empty() {
                self.cull_inactive_downstream(store, id, data.inactive_pins());
            }

            let mut consumers = 0;
            let mut ready = Vec::new();
            for (successor, edge) in store.successors(id) {
                let Some(dependent) = store.get_mut(successor) else {
                    continue;
                };
                if dependent.state != TaskState::Waiting {
                    continue;
                }

                if edge.data {
                    consumers += 1;
                    dependent.counted_by.push(id);
                }

                let tolerated = !edge.execution && dependent.task.capabilities.tolerates_missing_inputs();
                if cancelled && !tolerated {
                    dependent.inherit_cancel = true;
                }

                debug_assert!(dependent.waiting_on > 0);
                dependent.waiting_on = dependent.waiting_on.saturating_sub(1);
                if dependent.waiting_on == 0 {
                    dependent.state = TaskState::Ready;
                    ready.push(dependent.task.clone());
                }
            }

            let (waiters, started) = {
                let mut live = self.live.lock();
                let active = live.active.remove(&id);
                let waiters = match fingerprint {
                    Some(fingerprint) => live.release_fingerprint(fingerprint, id),
                    None => Vec::new(),
                };
                for task in &ready {
                    live.push_ready(task.id, self.priority_key(task), self.needs_worker(task));
                }
                (waiters, active.map(|a| a.started))
            };

            for waiter in waiters {
                if cancelled {
                    self.requeue(store, waiter);
                } else {
                    report.cache_hits += 1;
                    work.push_back((
                        waiter,
                        Finish::Done {
                            data: data.clone(),
                            cached: true,
                        },
                    ));
                }
            }

            let retained = self
                .outputs
                .lock()
                .store_result(id, data.clone(), task.retain_output, consumers);

            if let (Some(fingerprint), Some(element)) = (fingerprint, task.element())
                && !cached
                && !cancelled
                && !data.is_failed()
                && task.capabilities.is_cacheable()
            {
                self.cache
                    .lock()
                    .store(fingerprint, element.identity(), data.clone(), task.stack.clone());
            }

            if self.config.diagnostics {
                let now = Instant::now();
                let start = started.unwrap_or(now);
                self.diagnostics.lock().record(
                    id,
                    TaskExecution {
                        start,
                        duration: now.duration_since(start),
                        cached,
                    },
                );
            }

            if cancelled {
                report.cancelled += 1;
            } else {
                report.completed += 1;
            }

            if retained {
                if let Some(record) = store.get_mut(id) {
                    record.state = if cancelled {
                        TaskState::Cancelled
                    } else {
                        TaskState::Done
                    };
                    record.prepared = None;
                }
            } else {
                store.remove(id);
            }

            debug!(
                task = %id,
                name = task.name(),
                cached,
                cancelled,
                failed = data.is_failed(),
                consumers,
                "task finished"
            );
        }
    }

    /// Puts a task that waited on a fingerprint back in the ready queue.
    pub(crate) fn requeue(&self, store: &mut TaskStore, id: TaskId) {
        let Some(record) = store.get_mut(id) else {
            return;
        };
        if record.state != TaskState::Preparing {
            return;
        }

        record.state = TaskState::Ready;
        let task = record.task.clone();
        self.live
            .lock()
            .push_ready(id, self.priority_key(&task), self.needs_worker(&task));
        trace!(task = %id, "task re-queued");
    }

    /// Restarts id allocation once nothing refers to any issued id.
    fn reset_ids_if_idle(&self) {
        let mut queue = self.queue.lock();
        if queue.next_id == TaskId::FIRST {
            return;
        }

        let store = self.store.lock();
        if !store.is_empty() {
            return;
        }
        let live = self.live.lock();
        if live.has_runnable() || !live.active.is_empty() {
            return;
        }
        if !self.outputs.lock().is_empty() || !self.aborting.lock().is_empty() {
            return;
        }

        queue.next_id = TaskId::FIRST;
        trace!("task ids reset");
    }
}

/// Collects what the data dependencies produced onto the consumer's input
/// pins. Cancelled outputs contribute nothing; missing ones are reported.
fn gather_inputs<F>(task: &Task, output_of: F) -> DataCollection
where
    F: Fn(TaskId) -> Option<DataCollection>,
{
    let mut items: Vec<TaggedData> = Vec::new();

    for dependency in &task.data_dependencies {
        match output_of(dependency.task) {
            Some(output) if output.is_cancelled() => {}
            Some(output) => {
                items.extend(
                    output
                        .items()
                        .iter()
                        .filter(|item| dependency.pins.contains(item.pin()))
                        .map(|item| item.on_pin(dependency.input_pin)),
                );
            }
            None if task.capabilities.tolerates_missing_inputs() => {
                trace!(task = %task.id, producer = %dependency.task, "missing input replaced by empty data");
            }
            None => {
                warn!(
                    task = %task.id,
                    name = task.name(),
                    producer = %dependency.task,
                    "missing dependency data, substituting empty input"
                );
            }
        }
    }

    DataCollection::new(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataCollection, PinMask};
    use crate::element::{Capabilities, FnElement};
    use crate::task::{DataDependency, ExecutionSource, TaskKind};

    #[test]
    fn test_gather_moves_items_to_input_pins() {
        let producer = TaskId::FIRST;
        let task = Task {
            id: producer.next(),
            kind: TaskKind::Element(FnElement::new("consumer", |_| Ok(true)).into_arc()),
            capabilities: Capabilities::default(),
            execution_dependencies: Vec::new(),
            data_dependencies: vec![
                DataDependency::new(producer).from_pins(PinMask::pin(1)).into_pin(3),
            ],
            source: ExecutionSource::new("test"),
            stack: None,
            priority: 0,
            depth: 0,
            retain_output: false,
        };

        let output = DataCollection::new(vec![
            TaggedData::new(0, 10u8),
            TaggedData::new(1, 11u8),
            TaggedData::new(1, 12u8),
        ]);

        let inputs = gather_inputs(&task, |_| Some(output.clone()));
        let values: Vec<u8> = inputs.values::<u8>(3).copied().collect();
        assert_eq!(values, vec![11, 12]);
        assert_eq!(inputs.len(), 2);

        let inputs = gather_inputs(&task, |_| Some(DataCollection::cancelled()));
        assert!(inputs.is_empty());

        let inputs = gather_inputs(&task, |_| None);
        assert!(inputs.is_empty());
    }
}
