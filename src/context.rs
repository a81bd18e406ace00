use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::data::{DataCollection, MAX_PINS, PinMask, TaggedData};
use crate::task::{ExecutionSource, Stack, TaskId};

/// Raised when the task owning an execution is cancelled.
#[derive(Clone, Default, Debug)]
pub(crate) struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle returned by [`ExecutionContext::pause`].
///
/// Whoever owns the awaited resource calls [`Waker::wake`] once it is
/// available; the paused task is polled again on the next tick.
#[derive(Clone, Debug, Default)]
pub struct Waker(Arc<AtomicBool>);

impl Waker {
    pub fn wake(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_woken(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) struct PauseRequest {
    pub reason: Cow<'static, str>,
    pub waker: Waker,
}

/// What an element sees while it runs.
///
/// A context lives for as long as its task is executing, so it survives
/// across repeated `execute` calls of an incremental element and across
/// pauses.
pub struct ExecutionContext {
    task_id: TaskId,
    source: ExecutionSource,
    stack: Option<Arc<Stack>>,
    inputs: DataCollection,
    output: Vec<TaggedData>,
    inactive_pins: PinMask,
    post_graph: bool,
    cancel_output: bool,
    state: Option<Box<dyn Any + Send>>,
    signal: AbortSignal,
    pause: Option<PauseRequest>,
}

impl ExecutionContext {
    pub(crate) fn new(
        task_id: TaskId,
        source: ExecutionSource,
        stack: Option<Arc<Stack>>,
        inputs: DataCollection,
        signal: AbortSignal,
    ) -> Self {
        Self {
            task_id,
            source,
            stack,
            inputs,
            output: Vec::new(),
            inactive_pins: PinMask::NONE,
            post_graph: false,
            cancel_output: false,
            state: None,
            signal,
            pause: None,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn source(&self) -> &ExecutionSource {
        &self.source
    }

    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_deref()
    }

    /// Everything the data dependencies produced, already moved onto this
    /// task's input pins.
    pub fn inputs(&self) -> &DataCollection {
        &self.inputs
    }

    /// First value of type `T` on the given input pin.
    pub fn input<T: 'static>(&self, pin: u8) -> Option<&T> {
        self.inputs.values::<T>(pin).next()
    }

    pub fn push_output(&mut self, item: TaggedData) {
        self.output.push(item);
    }

    pub fn extend_output(&mut self, items: impl IntoIterator<Item = TaggedData>) {
        self.output.extend(items);
    }

    /// Reports an output pin as inactive. Dependents reading only inactive
    /// pins are pruned once this task finishes.
    pub fn deactivate_output_pin(&mut self, pin: u8) {
        debug_assert!(pin < MAX_PINS);
        self.inactive_pins.insert(pin);
    }

    pub fn set_inactive_output_pins(&mut self, pins: PinMask) {
        self.inactive_pins = pins;
    }

    /// Flags the output for follow-up work by the caller once the whole
    /// graph is done.
    pub fn request_post_graph_handling(&mut self) {
        self.post_graph = true;
    }

    /// Finishes the task with a cancelled output instead of what was pushed.
    /// Dependents react as to any cancelled input: execution dependents and
    /// elements requiring all inputs inherit the cancellation, the rest see
    /// an empty input.
    pub fn cancel_execution(&mut self) {
        self.cancel_output = true;
    }

    /// Element-private state that survives repeated `execute` calls.
    ///
    /// # Panics
    /// If called with two different types for the same execution.
    pub fn state_mut<T>(&mut self) -> &mut T
    where
        T: Default + Send + 'static,
    {
        let state = self.state.get_or_insert_with(|| Box::new(T::default()));
        match state.downcast_mut::<T>() {
            Some(state) => state,
            None => panic!(
                "execution state of task {} was initialised with a different type",
                self.task_id
            ),
        }
    }

    /// Suspends the task until the returned waker is woken.
    ///
    /// The element should return `Ok(false)` right after pausing. Returning
    /// `Ok(true)` finishes the task and drops the pause request.
    pub fn pause(&mut self, reason: impl Into<Cow<'static, str>>) -> Waker {
        let waker = Waker::default();
        self.pause = Some(PauseRequest {
            reason: reason.into(),
            waker: waker.clone(),
        });
        waker
    }

    /// True once the owning task was cancelled. Long-running elements should
    /// poll this and bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_raised()
    }

    pub(crate) fn take_pause(&mut self) -> Option<PauseRequest> {
        self.pause.take()
    }

    /// Moves the produced items out into the final collection.
    pub(crate) fn take_output(&mut self) -> DataCollection {
        if self.cancel_output {
            self.output.clear();
            return DataCollection::cancelled();
        }

        DataCollection::new(std::mem::take(&mut self.output))
            .with_inactive_pins(self.inactive_pins)
            .with_post_graph_handling(self.post_graph)
    }
}

/// What an element sees when its running task is aborted.
#[derive(Debug, Clone)]
pub struct AbortContext {
    task_id: TaskId,
    source: ExecutionSource,
}

impl AbortContext {
    pub(crate) fn new(task_id: TaskId, source: ExecutionSource) -> Self {
        Self { task_id, source }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn source(&self) -> &ExecutionSource {
        &self.source
    }
}
