use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::scheduler::store::{TaskState, TaskStore};
use crate::task::TaskId;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
    /// The output came from the result cache or from another task building
    /// the same fingerprint.
    pub cached: bool,
}

/// Per-task execution metrics, collected when
/// [`SchedulerConfig::diagnostics`](crate::SchedulerConfig::diagnostics) is on.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub execution_times: HashMap<TaskId, TaskExecution>,
}

impl Diagnostics {
    pub(crate) fn record(&mut self, id: TaskId, execution: TaskExecution) {
        self.execution_times.insert(id, execution);
    }

    pub fn is_empty(&self) -> bool {
        self.execution_times.is_empty()
    }

    /// Total time spent executing, cached results excluded.
    pub fn busy_time(&self) -> Duration {
        self.execution_times
            .values()
            .filter(|t| !t.cached)
            .map(|t| t.duration)
            .sum()
    }

    /// The slowest executed tasks, slowest first.
    pub fn slowest(&self, count: usize) -> Vec<(TaskId, Duration)> {
        let mut times: Vec<(TaskId, Duration)> = self
            .execution_times
            .iter()
            .filter(|(_, t)| !t.cached)
            .map(|(id, t)| (*id, t.duration))
            .collect();

        times.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        times.truncate(count);
        times
    }
}

fn state_color(state: TaskState) -> &'static str {
    match state {
        TaskState::Waiting => "#D3D3D3",
        TaskState::Ready => "#FFF3B0",
        TaskState::Preparing => "#FFD580",
        TaskState::Executing => "#90EE90",
        TaskState::Paused => "#B0C4DE",
        TaskState::Done => "#00FF00",
        TaskState::Cancelled => "#F08080",
    }
}

/// Green for the fastest finished task, red for the slowest.
fn duration_color(duration: Duration, min: f64, max: f64) -> String {
    let t = (duration.as_secs_f64() - min) / (max - min);

    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}

/// Renders every known task as a Mermaid graph, colour-coded by state.
/// Finished tasks with timings are shaded by duration, cached ones are blue.
pub(crate) fn render_mermaid(store: &TaskStore, diagnostics: &Diagnostics) -> String {
    let mut f = String::new();
    _ = writeln!(f, "graph LR");

    let (mut min, mut max) = diagnostics
        .execution_times
        .values()
        .filter(|t| !t.cached)
        .map(|t| t.duration.as_secs_f64())
        .fold((f64::MAX, f64::MIN), |(lo, hi), s| (lo.min(s), hi.max(s)));

    if min > max {
        min = 0.0;
        max = 0.0;
    }
    if (max - min).abs() < f64::EPSILON {
        max = min + 1.0;
    }

    let mut records: Vec<_> = store.records().collect();
    records.sort_by_key(|r| r.task.id);

    for record in records {
        let id = record.task.id.get();
        let name = record.task.name().replace('"', "\\\"");

        let (label, color) = match diagnostics.execution_times.get(&record.task.id) {
            Some(exec) if exec.cached => ("Cached".to_string(), "#ADD8E6".to_string()),
            Some(exec) if record.state == TaskState::Done => (
                format!("{:.2?}", exec.duration),
                duration_color(exec.duration, min, max),
            ),
            _ => (
                format!("{:?}", record.state),
                state_color(record.state).to_string(),
            ),
        };

        _ = writeln!(f, "    {id}[\"{name}\\n{label}\"]");
        _ = writeln!(f, "    style {id} fill:{color}");
    }

    for (from, to, edge) in store.edges() {
        let kind = match (edge.data, edge.execution) {
            (true, true) => "data+exec",
            (true, false) => "data",
            _ => "exec",
        };
        _ = writeln!(f, "    {} -- \"{kind}\" --> {}", from.get(), to.get());
    }

    f
}
