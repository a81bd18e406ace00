use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::Sender;

use tracing::{Level, error};

use crate::context::{ExecutionContext, PauseRequest};
use crate::task::{Task, TaskId, TaskKind};

pub(crate) enum Outcome {
    Done,
    NotDone,
    Paused(PauseRequest),
    Failed(anyhow::Error),
}

/// Result of one call into a task's operation.
pub(crate) struct Completion {
    pub id: TaskId,
    pub context: ExecutionContext,
    pub outcome: Outcome,
    pub on_worker: bool,
}

/// Calls the operation once.
pub(crate) fn run_once(task: &Task, context: &mut ExecutionContext) -> Outcome {
    let span = tracing::span!(Level::DEBUG, "task", id = %task.id, name = task.name());
    let _enter = span.enter();

    // Whatever a panicking operation already wrote stays in the context and
    // ends up in an output flagged as failed.
    let result = catch_unwind(AssertUnwindSafe(|| match &task.kind {
        TaskKind::Element(element) => element.execute(context),
        TaskKind::Generic(generic) => Ok(generic.run(context)),
    }));

    match result {
        Ok(Ok(true)) => Outcome::Done,
        Ok(Ok(false)) => match context.take_pause() {
            Some(pause) => Outcome::Paused(pause),
            None => Outcome::NotDone,
        },
        Ok(Err(err)) => {
            error!(task = %task.id, name = task.name(), "task failed: {err:#}");
            Outcome::Failed(err)
        }
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("task panicked: {s}")
            } else {
                String::from("task panicked with unknown payload")
            };

            error!(task = %task.id, name = task.name(), "{msg}");
            Outcome::Failed(anyhow::anyhow!(msg))
        }
    }
}

/// Runs one call on the pool and reports back through the channel.
pub(crate) fn spawn(
    pool: &rayon::ThreadPool,
    task: Arc<Task>,
    mut context: ExecutionContext,
    sender: Sender<Completion>,
) {
    pool.spawn(move || {
        let outcome = run_once(&task, &mut context);

        // The scheduler may be gone already; the result has no reader then.
        let _ = sender.send(Completion {
            id: task.id,
            context,
            outcome,
            on_worker: true,
        });
    });
}
