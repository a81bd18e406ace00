use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Instant;

use crate::context::{AbortSignal, ExecutionContext, PauseRequest};
use crate::fingerprint::Fingerprint;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    key: i64,
    seq: u64,
    id: TaskId,
    needs_worker: bool,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher key first, then earlier promotion
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct ActiveTask {
    pub signal: AbortSignal,
    /// `None` while lent out to a worker or to the tick thread.
    pub context: Option<ExecutionContext>,
    pub pause: Option<PauseRequest>,
    pub fingerprint: Option<Fingerprint>,
    pub started: Instant,
    pub needs_worker: bool,
}

pub(crate) enum Job {
    /// A Ready task to prepare and start.
    Start(TaskId),
    /// An executing task to call again.
    Resume(TaskId),
}

/// Tasks between promotion and completion.
#[derive(Default)]
pub(crate) struct Live {
    ready: BinaryHeap<ReadyEntry>,
    seq: u64,
    resume: VecDeque<(TaskId, bool)>,
    pub active: HashMap<TaskId, ActiveTask>,
    owners: HashMap<Fingerprint, TaskId>,
    waiters: HashMap<TaskId, Vec<TaskId>>,
    pub busy_workers: usize,
}

impl Live {
    pub(crate) fn push_ready(&mut self, id: TaskId, key: i64, needs_worker: bool) {
        self.seq += 1;
        self.ready.push(ReadyEntry {
            key,
            seq: self.seq,
            id,
            needs_worker,
        });
    }

    pub(crate) fn push_resume(&mut self, id: TaskId, needs_worker: bool) {
        self.resume.push_back((id, needs_worker));
    }

    pub(crate) fn forget_resume(&mut self, id: TaskId) {
        self.resume.retain(|(queued, _)| *queued != id);
    }

    /// Picks the next piece of work. Tasks that need a worker are skipped
    /// while every worker slot is taken.
    pub(crate) fn next_job(&mut self, slots: usize) -> Option<Job> {
        let free = self.busy_workers < slots;

        if let Some(pos) = self.resume.iter().position(|&(_, worker)| free || !worker) {
            return self.resume.remove(pos).map(|(id, _)| Job::Resume(id));
        }

        let mut deferred = Vec::new();
        let job = loop {
            match self.ready.pop() {
                None => break None,
                Some(entry) if entry.needs_worker && !free => deferred.push(entry),
                Some(entry) => break Some(Job::Start(entry.id)),
            }
        };
        self.ready.extend(deferred);
        job
    }

    /// The task currently building `fingerprint`, if any.
    pub(crate) fn owner_of(&self, fingerprint: &Fingerprint) -> Option<TaskId> {
        self.owners.get(fingerprint).copied()
    }

    pub(crate) fn claim(&mut self, fingerprint: Fingerprint, owner: TaskId) {
        self.owners.insert(fingerprint, owner);
    }

    pub(crate) fn add_waiter(&mut self, owner: TaskId, waiter: TaskId) {
        self.waiters.entry(owner).or_default().push(waiter);
    }

    pub(crate) fn remove_waiter(&mut self, waiter: TaskId) {
        for list in self.waiters.values_mut() {
            list.retain(|&w| w != waiter);
        }
    }

    /// Gives up ownership of a fingerprint and hands back the tasks that were
    /// waiting on it.
    pub(crate) fn release_fingerprint(&mut self, fingerprint: Fingerprint, owner: TaskId) -> Vec<TaskId> {
        if self.owners.get(&fingerprint) == Some(&owner) {
            self.owners.remove(&fingerprint);
        }
        self.waiters.remove(&owner).unwrap_or_default()
    }

    /// Executing tasks whose waker fired.
    pub(crate) fn woken(&self) -> Vec<TaskId> {
        self.active
            .iter()
            .filter(|(_, active)| active.pause.as_ref().is_some_and(|p| p.waker.is_woken()))
            .map(|(&id, _)| id)
            .collect()
    }

    pub(crate) fn has_runnable(&self) -> bool {
        !self.ready.is_empty() || !self.resume.is_empty()
    }
}
