use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tsumiki::{
    CancelFilter, Capabilities, CompiledGraph, CompiledTask, DataDependency, Element, ElementId,
    ExecutionSource, FnElement, GenericTask, GraphId, PinMask, PriorityPolicy, Scheduler,
    SchedulerConfig, TaggedData, TaskId, TaskState, TickReport, Waker,
};

fn synchronous() -> Scheduler {
    Scheduler::new(SchedulerConfig::synchronous()).unwrap()
}

fn threaded(workers: usize) -> Scheduler {
    Scheduler::new(SchedulerConfig {
        worker_threads: Some(workers),
        max_concurrent_tasks: workers,
        ..SchedulerConfig::default()
    })
    .unwrap()
}

fn tick(scheduler: &Scheduler) -> TickReport {
    scheduler.execute(Instant::now() + Duration::from_secs(5))
}

/// Ticks until nothing is left, polling while workers are busy.
fn run_until_idle(scheduler: &Scheduler) {
    let give_up = Instant::now() + Duration::from_secs(10);
    while Instant::now() < give_up {
        if scheduler.live_task_count() == 0 && !scheduler.has_pending_cleanup() {
            return;
        }
        scheduler.execute_for(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(1));
    }
    panic!("scheduler did not settle");
}

fn constant(name: &'static str, value: u32) -> Arc<dyn Element> {
    FnElement::new(name, move |ctx| {
        ctx.push_output(TaggedData::new(0, value));
        Ok(true)
    })
    .into_arc()
}

fn counting(name: &'static str, runs: Arc<AtomicUsize>) -> FnElement {
    FnElement::new(name, move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        ctx.push_output(TaggedData::new(0, 7u32));
        Ok(true)
    })
}

type Slot = Arc<Mutex<Option<Waker>>>;

/// Pauses on the first call and finishes once woken.
fn gate(slot: Slot) -> GenericTask {
    GenericTask::with_context(move |ctx| {
        if std::mem::replace(ctx.state_mut::<bool>(), true) {
            return true;
        }
        *slot.lock().unwrap() = Some(ctx.pause("waiting for the test"));
        false
    })
    .named("gate")
}

fn open(slot: &Slot) {
    slot.lock().unwrap().take().expect("gate never paused").wake();
}

fn single(graph: GraphId, element: Arc<dyn Element>) -> CompiledGraph {
    let mut compiled = CompiledGraph::new(graph);
    let task = compiled.push(CompiledTask::new(element));
    compiled.set_output(task);
    compiled
}

#[test]
fn cached_results_are_shared_not_recomputed() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("cache");
    let runs = Arc::new(AtomicUsize::new(0));
    let element = counting("expensive", runs.clone())
        .with_capabilities(Capabilities::new().cacheable())
        .into_arc();

    let first = scheduler.schedule(single(GraphId::new(1), element.clone()), &[], &source);
    let report = tick(&scheduler);
    assert_eq!(report.started, 1);
    assert_eq!(report.cache_hits, 0);

    let second = scheduler.schedule(single(GraphId::new(1), element), &[], &source);
    let report = tick(&scheduler);
    assert_eq!(report.started, 0);
    assert_eq!(report.cache_hits, 1);
    assert_eq!(report.completed, 1);

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.cache_entry_count(), 1);

    let a = scheduler.get_output_data(first).unwrap();
    let b = scheduler.get_output_data(second).unwrap();
    assert!(a.same_as(&b));
}

#[test]
fn same_fingerprint_in_flight_is_built_once() {
    let scheduler = threaded(2);
    let runs = Arc::new(AtomicUsize::new(0));
    let slow = {
        let runs = runs.clone();
        FnElement::new("slow", move |ctx| {
            runs.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            ctx.push_output(TaggedData::new(0, 1u64));
            Ok(true)
        })
        .with_capabilities(Capabilities::new().cacheable())
        .into_arc()
    };
    let join = FnElement::new("join", |ctx| {
        let items = ctx.inputs().items();
        let shared = items.len() == 2 && items[0].same_payload(&items[1]);
        ctx.push_output(TaggedData::new(0, (items.len() as u32, shared)));
        Ok(true)
    })
    .into_arc();

    let mut graph = CompiledGraph::new(GraphId::new(2));
    let a = graph.push(CompiledTask::new(slow.clone()));
    let b = graph.push(CompiledTask::new(slow));
    let out = graph.push(CompiledTask::new(join).input(a).input(b));
    graph.set_output(out);

    let out = scheduler.schedule(graph, &[], &ExecutionSource::new("twins"));
    run_until_idle(&scheduler);

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let output = scheduler.get_output_data(out).unwrap();
    assert_eq!(output.values::<(u32, bool)>(0).next(), Some(&(2, true)));
}

#[test]
fn tasks_start_after_their_dependencies_finish() {
    let scheduler = threaded(4);
    let clock = Arc::new(AtomicU64::new(1));
    let violations = Arc::new(AtomicUsize::new(0));

    let stamped = |name: &'static str| {
        let clock = clock.clone();
        let violations = violations.clone();
        FnElement::new(name, move |ctx| {
            let start = clock.fetch_add(1, Ordering::SeqCst);
            if ctx.inputs().values::<u64>(0).any(|&end| end >= start) {
                violations.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(5));
            ctx.push_output(TaggedData::new(0, clock.fetch_add(1, Ordering::SeqCst)));
            Ok(true)
        })
        .into_arc()
    };

    let mut graph = CompiledGraph::new(GraphId::new(3));
    let a = graph.push(CompiledTask::new(stamped("a")));
    let b = graph.push(CompiledTask::new(stamped("b")).input(a));
    let c = graph.push(CompiledTask::new(stamped("c")).input(a));
    let d = graph.push(CompiledTask::new(stamped("d")).input(b).input(c));
    let e = graph.push(CompiledTask::new(stamped("e")).input(d));
    let f = graph.push(CompiledTask::new(stamped("f")));
    let g = graph.push(CompiledTask::new(stamped("g")).input(e).input(f));
    let h = graph.push(CompiledTask::new(stamped("h")).input(g).after(a));
    graph.set_output(h);

    let out = scheduler.schedule(graph, &[], &ExecutionSource::new("order"));
    run_until_idle(&scheduler);

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.task_state(out), Some(TaskState::Done));
    assert!(!scheduler.get_output_data(out).unwrap().is_failed());
}

#[test]
fn outputs_live_until_the_last_consumer() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("outputs");
    let doomed = ExecutionSource::new("doomed");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let consumer = |seen: &Arc<Mutex<Vec<Option<u32>>>>| {
        let seen = seen.clone();
        GenericTask::with_context(move |ctx| {
            seen.lock().unwrap().push(ctx.input::<u32>(0).copied());
            true
        })
    };

    let producer = scheduler.schedule_generic(
        GenericTask::with_context(|ctx| {
            ctx.push_output(TaggedData::new(0, 5u32));
            true
        }),
        &source,
        &[],
        &[],
    );
    let first = scheduler.schedule_generic(consumer(&seen), &source, &[], &[producer.into()]);

    let slot: Slot = Arc::default();
    let gated = scheduler.schedule_generic(gate(slot.clone()), &source, &[], &[]);
    let second = scheduler.schedule_generic(
        consumer(&seen).retain_output(),
        &source,
        &[gated],
        &[producer.into()],
    );

    let doomed_slot: Slot = Arc::default();
    let doomed_gate = scheduler.schedule_generic(gate(doomed_slot), &doomed, &[], &[]);
    let third = scheduler.schedule_generic(
        consumer(&seen),
        &doomed,
        &[doomed_gate],
        &[producer.into()],
    );

    tick(&scheduler);
    assert_eq!(scheduler.task_state(first), None);
    assert_eq!(scheduler.task_state(producer), Some(TaskState::Done));
    assert!(scheduler.is_output_retained(producer));

    let cancelled = scheduler.cancel(CancelFilter::Source(doomed.clone()));
    assert_eq!(cancelled, HashSet::from([doomed]));
    assert_eq!(scheduler.task_state(third), None);
    assert!(scheduler.is_output_retained(producer));

    open(&slot);
    tick(&scheduler);
    assert!(!scheduler.is_output_retained(producer));
    assert_eq!(scheduler.task_state(producer), None);
    assert_eq!(scheduler.task_state(second), Some(TaskState::Done));
    assert_eq!(*seen.lock().unwrap(), vec![Some(5), Some(5)]);

    assert!(scheduler.clear_output_data(second));
    assert_eq!(scheduler.live_task_count(), 0);
}

#[test]
fn late_consumer_reads_retained_output() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("late");

    let out = scheduler.schedule(single(GraphId::new(4), constant("answer", 42)), &[], &source);
    tick(&scheduler);

    let seen = Arc::new(Mutex::new(None));
    let reader = {
        let seen = seen.clone();
        GenericTask::with_context(move |ctx| {
            *seen.lock().unwrap() = ctx.input::<u32>(0).copied();
            true
        })
    };
    scheduler.schedule_generic(reader, &source, &[], &[out.into()]);
    tick(&scheduler);

    assert_eq!(*seen.lock().unwrap(), Some(42));
    assert!(scheduler.is_output_retained(out));
}

#[test]
fn cancellation_spares_tasks_with_a_live_dependency() {
    let scheduler = synchronous();
    let requester_a = ExecutionSource::new("a");
    let requester_b = ExecutionSource::new("b");
    let runs = Arc::new(AtomicUsize::new(0));

    let slot_a: Slot = Arc::default();
    let slot_b: Slot = Arc::default();
    let a = scheduler.schedule_generic(gate(slot_a), &requester_a, &[], &[]);
    let b = scheduler.schedule_generic(gate(slot_b.clone()), &requester_b, &[], &[]);

    let shared = {
        let runs = runs.clone();
        GenericTask::new(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            true
        })
        .retain_output()
    };
    let both = scheduler.schedule_generic(shared, &requester_b, &[a, b], &[]);
    let only_a = scheduler.schedule_generic(GenericTask::new(|| true), &requester_b, &[a], &[]);

    tick(&scheduler);
    assert_eq!(scheduler.task_state(a), Some(TaskState::Paused));

    let affected = scheduler.cancel(CancelFilter::Source(requester_a.clone()));
    assert_eq!(affected, HashSet::from([requester_a, requester_b.clone()]));
    assert_eq!(scheduler.task_state(a), None);
    assert_eq!(scheduler.task_state(only_a), None);
    assert_eq!(scheduler.task_state(both), Some(TaskState::Waiting));
    assert!(!scheduler.has_pending_cleanup());

    open(&slot_b);
    tick(&scheduler);
    assert_eq!(scheduler.task_state(both), Some(TaskState::Done));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_by_graph_reaches_sub_graphs() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("graphs");
    let parent = GraphId::from_name("parent");
    let child = GraphId::from_name("child");
    let other = GraphId::from_name("other");

    let mut graph = CompiledGraph::new(parent);
    let root = graph.push(CompiledTask::new(constant("root", 1)));
    let nested = graph.push(
        CompiledTask::new(constant("nested", 2))
            .input(root)
            .with_stack(tsumiki::Stack::root(parent).push(tsumiki::StackFrame::Graph(child))),
    );
    graph.set_output(nested);

    let gate_slot: Slot = Arc::default();
    let gated = scheduler.schedule_generic(gate(gate_slot), &source, &[], &[]);
    scheduler.schedule(graph, &[gated], &source);
    scheduler.schedule(single(other, constant("elsewhere", 3)), &[gated], &source);

    assert!(scheduler.is_graph_currently_executing(child));
    let affected = scheduler.cancel(CancelFilter::Graph(child));
    assert_eq!(affected, HashSet::from([source.clone()]));
    assert!(!scheduler.is_graph_currently_executing(child));
    assert!(scheduler.is_graph_currently_executing(parent));

    scheduler.cancel(CancelFilter::Graph(parent));
    assert!(!scheduler.is_graph_currently_executing(parent));
    assert!(scheduler.is_graph_currently_executing(other));
}

#[test]
fn chain_never_starts_early() {
    let scheduler = threaded(2);
    let source = ExecutionSource::new("chain");
    let log = Arc::new(Mutex::new(Vec::new()));

    let step = |name: &'static str, pause: u64| {
        let log = log.clone();
        GenericTask::new(move || {
            thread::sleep(Duration::from_millis(pause));
            log.lock().unwrap().push(name);
            true
        })
        .named(name)
    };

    let a = scheduler.schedule_generic(step("a", 150), &source, &[], &[]);
    let b = scheduler.schedule_generic(step("b", 0), &source, &[a], &[]);
    let c = scheduler.schedule_generic(step("c", 0).retain_output(), &source, &[], &[b.into()]);

    let report = scheduler.execute_for(Duration::from_millis(20));
    assert_eq!(report.started, 1);
    assert_eq!(scheduler.task_state(a), Some(TaskState::Executing));
    assert_eq!(scheduler.task_state(b), Some(TaskState::Waiting));
    assert_eq!(scheduler.task_state(c), Some(TaskState::Waiting));

    run_until_idle(&scheduler);
    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(scheduler.task_state(c), Some(TaskState::Done));
}

#[test]
fn ticks_do_not_wait_for_busy_workers() {
    let scheduler = threaded(2);
    let slow = scheduler.schedule_generic(
        GenericTask::new(|| {
            thread::sleep(Duration::from_millis(300));
            true
        })
        .retain_output(),
        &ExecutionSource::new("slow"),
        &[],
        &[],
    );

    let begun = Instant::now();
    let report = scheduler.execute_for(Duration::from_secs(2));
    assert_eq!(report.started, 1);
    assert_eq!(report.completed, 0);

    let report = scheduler.execute_for(Duration::from_secs(2));
    assert_eq!(report.started, 0);
    assert!(begun.elapsed() < Duration::from_millis(250), "ticks took {:?}", begun.elapsed());
    assert_eq!(scheduler.task_state(slow), Some(TaskState::Executing));

    run_until_idle(&scheduler);
    assert_eq!(scheduler.task_state(slow), Some(TaskState::Done));
}

#[test]
fn tick_budget_limits_new_work() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("budget");
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let runs = runs.clone();
        scheduler.schedule_generic(
            GenericTask::new(move || {
                thread::sleep(Duration::from_millis(20));
                runs.fetch_add(1, Ordering::SeqCst);
                true
            }),
            &source,
            &[],
            &[],
        );
    }

    // an expired deadline still makes progress
    let report = scheduler.execute(Instant::now());
    assert_eq!(report.started, 1);
    assert_eq!(report.remaining, 4);

    let report = scheduler.execute_for(Duration::from_millis(30));
    assert!((1..=2).contains(&report.started), "started {}", report.started);

    run_until_idle(&scheduler);
    assert_eq!(runs.load(Ordering::SeqCst), 5);
}

#[test]
fn inactive_pins_prune_their_readers() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("branch");
    let pruned_runs = Arc::new(AtomicUsize::new(0));
    let live_runs = Arc::new(AtomicUsize::new(0));

    let counter = |runs: &Arc<AtomicUsize>| {
        let runs = runs.clone();
        GenericTask::new(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            true
        })
    };

    let branch = scheduler.schedule_generic(
        GenericTask::with_context(|ctx| {
            ctx.push_output(TaggedData::new(0, true));
            ctx.deactivate_output_pin(1);
            true
        }),
        &source,
        &[],
        &[],
    );

    let on_false = scheduler.schedule_generic(
        counter(&pruned_runs),
        &source,
        &[],
        &[DataDependency::new(branch).from_pins(PinMask::pin(1))],
    );
    let after_false = scheduler.schedule_generic(
        counter(&pruned_runs),
        &source,
        &[],
        &[on_false.into()],
    );
    let on_true = scheduler.schedule_generic(
        counter(&live_runs).retain_output(),
        &source,
        &[],
        &[DataDependency::new(branch).from_pins(PinMask::pin(0))],
    );
    let on_any = scheduler.schedule_generic(
        counter(&live_runs),
        &source,
        &[],
        &[DataDependency::new(branch)],
    );

    tick(&scheduler);

    assert_eq!(pruned_runs.load(Ordering::SeqCst), 0);
    assert_eq!(live_runs.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.task_state(on_false), None);
    assert_eq!(scheduler.task_state(after_false), None);
    assert_eq!(scheduler.task_state(on_any), None);
    assert_eq!(scheduler.task_state(on_true), Some(TaskState::Done));
    assert_eq!(scheduler.live_task_count(), 0);
}

#[test]
fn late_readers_of_inactive_pins_never_run() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("late branch");
    let pruned_runs = Arc::new(AtomicUsize::new(0));
    let live_runs = Arc::new(AtomicUsize::new(0));

    let counter = |runs: &Arc<AtomicUsize>| {
        let runs = runs.clone();
        GenericTask::new(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            true
        })
    };

    let branch = scheduler.schedule_generic(
        GenericTask::with_context(|ctx| {
            ctx.push_output(TaggedData::new(0, true));
            ctx.deactivate_output_pin(1);
            true
        })
        .retain_output(),
        &source,
        &[],
        &[],
    );
    tick(&scheduler);
    assert_eq!(scheduler.task_state(branch), Some(TaskState::Done));
    assert_eq!(scheduler.pending_consumers(branch), Some(0));
    assert!(!scheduler.was_output_culled(branch));

    let on_false = scheduler.schedule_generic(
        counter(&pruned_runs),
        &source,
        &[],
        &[DataDependency::new(branch).from_pins(PinMask::pin(1))],
    );
    assert_eq!(scheduler.task_state(on_false), None);
    assert!(scheduler.was_output_culled(branch));
    assert_eq!(scheduler.pending_consumers(branch), Some(0));

    let on_true = scheduler.schedule_generic(
        counter(&live_runs),
        &source,
        &[],
        &[DataDependency::new(branch).from_pins(PinMask::pin(0))],
    );
    assert_eq!(scheduler.task_state(on_true), Some(TaskState::Ready));
    assert_eq!(scheduler.pending_consumers(branch), Some(1));

    tick(&scheduler);
    assert_eq!(pruned_runs.load(Ordering::SeqCst), 0);
    assert_eq!(live_runs.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pending_consumers(branch), Some(0));
    assert!(scheduler.is_output_retained(branch));
}

#[test]
fn woken_task_resumes_on_next_tick() {
    let scheduler = synchronous();
    let slot: Slot = Arc::default();
    let id = scheduler.schedule_generic(
        gate(slot.clone()).retain_output(),
        &ExecutionSource::new("pause"),
        &[],
        &[],
    );

    tick(&scheduler);
    assert_eq!(scheduler.task_state(id), Some(TaskState::Paused));
    tick(&scheduler);
    assert_eq!(scheduler.task_state(id), Some(TaskState::Paused));

    let waker = slot.lock().unwrap().take().unwrap();
    thread::spawn(move || waker.wake()).join().unwrap();

    let report = tick(&scheduler);
    assert_eq!(report.completed, 1);
    assert_eq!(scheduler.task_state(id), Some(TaskState::Done));
}

#[test]
fn cancelling_running_work_calls_abort() {
    let scheduler = threaded(2);
    let source = ExecutionSource::new("abort");
    let aborted = Arc::new(AtomicUsize::new(0));

    let element = {
        let aborted = aborted.clone();
        FnElement::new("long", |ctx| {
            let until = Instant::now() + Duration::from_secs(5);
            while !ctx.is_cancelled() && Instant::now() < until {
                thread::sleep(Duration::from_millis(1));
            }
            ctx.push_output(TaggedData::new(0, 0u8));
            Ok(true)
        })
        .with_capabilities(Capabilities::new().supports_abort())
        .on_abort(move |_| {
            aborted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .into_arc()
    };

    let out = scheduler.schedule(single(GraphId::new(9), element), &[], &source);
    let report = scheduler.execute_for(Duration::from_millis(20));
    assert_eq!(report.started, 1);
    assert_eq!(scheduler.task_state(out), Some(TaskState::Executing));

    let affected = scheduler.cancel(CancelFilter::Source(source.clone()));
    assert_eq!(affected, HashSet::from([source]));
    assert_eq!(aborted.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.task_state(out), None);
    assert!(scheduler.has_pending_cleanup());

    run_until_idle(&scheduler);
    assert!(!scheduler.has_pending_cleanup());
    assert!(!scheduler.is_output_retained(out));
    assert_eq!(aborted.load(Ordering::SeqCst), 1);
}

#[test]
fn non_cancellable_work_runs_out_and_is_discarded() {
    let scheduler = threaded(2);
    let source = ExecutionSource::new("stubborn");
    let aborted = Arc::new(AtomicUsize::new(0));
    let saw_cancel = Arc::new(AtomicBool::new(false));

    let element = {
        let aborted = aborted.clone();
        let saw_cancel = saw_cancel.clone();
        FnElement::new("stubborn", move |ctx| {
            thread::sleep(Duration::from_millis(100));
            saw_cancel.store(ctx.is_cancelled(), Ordering::SeqCst);
            ctx.push_output(TaggedData::new(0, 0u8));
            Ok(true)
        })
        .with_capabilities(Capabilities::new().not_cancellable().supports_abort())
        .on_abort(move |_| {
            aborted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .into_arc()
    };

    let out = scheduler.schedule(single(GraphId::new(10), element), &[], &source);
    scheduler.execute_for(Duration::from_millis(20));
    scheduler.cancel_all();

    assert_eq!(aborted.load(Ordering::SeqCst), 0);
    assert!(scheduler.has_pending_cleanup());

    run_until_idle(&scheduler);
    assert!(!saw_cancel.load(Ordering::SeqCst));
    assert!(!scheduler.is_output_retained(out));
}

#[test]
fn workers_run_in_parallel_and_main_thread_tasks_stay_home() {
    let scheduler = threaded(4);
    let source = ExecutionSource::new("parallel");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let running = running.clone();
        let peak = peak.clone();
        scheduler.schedule_generic(
            GenericTask::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                running.fetch_sub(1, Ordering::SeqCst);
                true
            }),
            &source,
            &[],
            &[],
        );
    }

    let home = thread::current().id();
    let stayed = Arc::new(AtomicBool::new(false));
    {
        let stayed = stayed.clone();
        scheduler.schedule_generic(
            GenericTask::new(move || {
                stayed.store(thread::current().id() == home, Ordering::SeqCst);
                true
            })
            .main_thread_only(),
            &source,
            &[],
            &[],
        );
    }

    run_until_idle(&scheduler);
    assert!(peak.load(Ordering::SeqCst) >= 2);
    assert!(stayed.load(Ordering::SeqCst));
}

#[test]
fn failures_are_flagged_not_fatal() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("failures");

    let failing = FnElement::new("failing", |ctx| {
        ctx.push_output(TaggedData::new(0, 1u8));
        anyhow::bail!("out of coffee")
    })
    .into_arc();
    let panicking = FnElement::new("panicking", |_| panic!("unreachable branch")).into_arc();

    let failed = scheduler.schedule(single(GraphId::new(11), failing.clone()), &[], &source);
    let panicked = scheduler.schedule(single(GraphId::new(12), panicking), &[], &source);

    let mut graph = CompiledGraph::new(GraphId::new(13));
    let upstream = graph.push(CompiledTask::new(failing));
    let downstream = graph.push(
        CompiledTask::new(
            FnElement::new("downstream", |ctx| {
                let count = ctx.inputs().len() as u32;
                ctx.push_output(TaggedData::new(0, count));
                Ok(true)
            })
            .into_arc(),
        )
        .input(upstream),
    );
    graph.set_output(downstream);
    let downstream = scheduler.schedule(graph, &[], &source);

    run_until_idle(&scheduler);

    let output = scheduler.get_output_data(failed).unwrap();
    assert!(output.is_failed());
    assert_eq!(output.len(), 1);
    assert_eq!(output.failure(), Some("out of coffee"));

    let output = scheduler.get_output_data(panicked).unwrap();
    assert!(output.is_failed());
    assert!(output.failure().unwrap().contains("unreachable branch"));

    let output = scheduler.get_output_data(downstream).unwrap();
    assert!(!output.is_failed());
    assert_eq!(output.values::<u32>(0).next(), Some(&1));
}

#[test]
fn cancelled_outputs_propagate_by_tolerance() {
    let scheduler = synchronous();
    let strict_runs = Arc::new(AtomicUsize::new(0));
    let after_runs = Arc::new(AtomicUsize::new(0));
    let lenient_inputs = Arc::new(Mutex::new(None));

    let giving_up = FnElement::new("giving up", |ctx| {
        ctx.push_output(TaggedData::new(0, 1u8));
        ctx.cancel_execution();
        Ok(true)
    })
    .into_arc();
    let strict = counting("strict", strict_runs.clone())
        .with_capabilities(Capabilities::new().requires_all_inputs())
        .into_arc();
    let after = counting("after", after_runs.clone()).into_arc();
    let lenient = {
        let lenient_inputs = lenient_inputs.clone();
        FnElement::new("lenient", move |ctx| {
            *lenient_inputs.lock().unwrap() = Some(ctx.inputs().len());
            Ok(true)
        })
        .into_arc()
    };

    let mut graph = CompiledGraph::new(GraphId::new(14));
    let root = graph.push(CompiledTask::new(giving_up));
    graph.push(CompiledTask::new(strict).input(root));
    graph.push(CompiledTask::new(after).after(root));
    let out = graph.push(CompiledTask::new(lenient).input(root));
    graph.set_output(out);

    let out = scheduler.schedule(graph, &[], &ExecutionSource::new("tolerance"));
    let report = tick(&scheduler);

    assert_eq!(report.cancelled, 3);
    assert_eq!(report.completed, 1);
    assert_eq!(strict_runs.load(Ordering::SeqCst), 0);
    assert_eq!(after_runs.load(Ordering::SeqCst), 0);
    assert_eq!(*lenient_inputs.lock().unwrap(), Some(0));
    assert_eq!(scheduler.task_state(out), Some(TaskState::Done));
}

#[test]
fn diagnostics_record_every_finished_task() {
    let scheduler = Scheduler::new(SchedulerConfig {
        diagnostics: true,
        ..SchedulerConfig::synchronous()
    })
    .unwrap();

    let mut graph = CompiledGraph::new(GraphId::new(15));
    let a = graph.push(CompiledTask::new(constant("a", 1)));
    let b = graph.push(CompiledTask::new(constant("b", 2)).input(a));
    graph.set_output(b);
    scheduler.schedule(graph, &[], &ExecutionSource::new("diagnostics"));
    tick(&scheduler);

    let diagnostics = scheduler.take_diagnostics();
    assert_eq!(diagnostics.execution_times.len(), 2);
    assert!(diagnostics.execution_times.values().all(|t| !t.cached));
    assert!(scheduler.diagnostics().execution_times.is_empty());
}

#[test]
fn shutdown_rejects_new_work() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("shutdown");
    let slot: Slot = Arc::default();
    scheduler.schedule_generic(gate(slot), &source, &[], &[]);
    tick(&scheduler);

    assert_eq!(scheduler.shutdown(), HashSet::from([source.clone()]));
    assert_eq!(scheduler.live_task_count(), 0);

    let id = scheduler.schedule_generic(GenericTask::new(|| true), &source, &[], &[]);
    assert_eq!(id, TaskId::INVALID);
}

#[test]
fn cleaning_a_unit_drops_only_its_entries() {
    let scheduler = synchronous();
    let source = ExecutionSource::new("clean");
    let sized = |name: &'static str, bytes: usize| {
        FnElement::new(name, move |ctx| {
            ctx.push_output(TaggedData::new(0, name).with_size(bytes));
            Ok(true)
        })
        .with_capabilities(Capabilities::new().cacheable())
        .into_arc()
    };

    let a = scheduler.schedule(single(GraphId::new(1), sized("noise", 100)), &[], &source);
    let b = scheduler.schedule(single(GraphId::new(2), sized("erosion", 50)), &[], &source);
    run_until_idle(&scheduler);

    assert_eq!(scheduler.cache_entry_count(), 2);
    assert_eq!(scheduler.cache_entry_count_for(ElementId::new("noise")), 1);
    assert_eq!(scheduler.cache_total_bytes(), 150);

    assert_eq!(scheduler.clean_from_cache(ElementId::new("noise")), 1);
    assert_eq!(scheduler.cache_entry_count(), 1);
    assert_eq!(scheduler.cache_entry_count_for(ElementId::new("noise")), 0);
    assert_eq!(scheduler.cache_total_bytes(), 50);

    // retained outputs are not cache entries
    assert!(scheduler.get_output_data(a).is_some());
    assert!(scheduler.get_output_data(b).is_some());
}

#[test]
fn explicit_priorities_order_ready_tasks() {
    let scheduler = Scheduler::new(SchedulerConfig {
        priority: PriorityPolicy::Explicit,
        ..SchedulerConfig::synchronous()
    })
    .unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |name: &'static str| {
        let order = order.clone();
        FnElement::new(name, move |_| {
            order.lock().unwrap().push(name);
            Ok(true)
        })
        .into_arc()
    };

    let mut graph = CompiledGraph::new(GraphId::new(3));
    let low = graph.push(CompiledTask::new(record("low")).with_priority(1));
    let high = graph.push(CompiledTask::new(record("high")).with_priority(5));
    let mid = graph.push(CompiledTask::new(record("mid")).with_priority(3));
    let out = graph.push(CompiledTask::new(record("last")).after(low).after(high).after(mid));
    graph.set_output(out);

    scheduler.schedule(graph, &[], &ExecutionSource::new("priority"));
    run_until_idle(&scheduler);

    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low", "last"]);
}

#[test]
fn abort_runs_on_the_cancelling_thread() {
    let scheduler = Arc::new(synchronous());
    let slot: Slot = Arc::default();
    let aborted_on = Arc::new(Mutex::new(None));

    let task = {
        let aborted_on = aborted_on.clone();
        gate(slot)
            .main_thread_only()
            .on_abort(move || *aborted_on.lock().unwrap() = Some(thread::current().id()))
    };
    let id = scheduler.schedule_generic(task, &ExecutionSource::new("abort"), &[], &[]);
    tick(&scheduler);
    assert_eq!(scheduler.task_state(id), Some(TaskState::Paused));

    let canceller = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            scheduler.cancel_all();
            thread::current().id()
        })
        .join()
        .unwrap()
    };

    assert_eq!(*aborted_on.lock().unwrap(), Some(canceller));
    assert_eq!(scheduler.task_state(id), None);
}

#[test]
fn scheduling_and_cancelling_from_other_threads() {
    let scheduler = Arc::new(threaded(4));

    let clients: Vec<_> = (0..4)
        .map(|client| {
            let scheduler = scheduler.clone();
            thread::spawn(move || {
                let source = ExecutionSource::new(format!("client {client}"));
                for round in 0..50 {
                    let first = scheduler.schedule_generic(
                        GenericTask::new(|| true),
                        &source,
                        &[],
                        &[],
                    );
                    let second = scheduler.schedule_generic(
                        GenericTask::with_context(|ctx| {
                            thread::sleep(Duration::from_micros(200));
                            ctx.push_output(TaggedData::new(0, 1u32));
                            true
                        }),
                        &source,
                        &[first],
                        &[],
                    );
                    scheduler.schedule_generic(
                        GenericTask::new(|| true),
                        &source,
                        &[],
                        &[second.into()],
                    );

                    if round % 5 == 4 {
                        scheduler.cancel(CancelFilter::Source(source.clone()));
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    while clients.iter().any(|client| !client.is_finished()) {
        scheduler.execute_for(Duration::from_millis(5));
    }
    for client in clients {
        client.join().unwrap();
    }

    run_until_idle(&scheduler);
    assert_eq!(scheduler.live_task_count(), 0);
    assert!(!scheduler.has_pending_cleanup());
}
