//! Mutexes tagged with their position in the acquisition order.
//!
//! A thread holding a lock of some level may only acquire locks of strictly
//! greater (inner) levels. Debug builds keep a per-thread stack of held
//! levels and assert on every acquisition; release builds only lock.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock levels, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LockLevel {
    /// Id allocation and the shutdown flag.
    Queue = 1,
    /// Task records and the successor index.
    Tasks = 2,
    /// Ready, active and paused sets, fingerprint owners.
    Live = 3,
    /// Output store, result cache, abort tracking, completion inbox. Two
    /// leaves are never held at once.
    Leaf = 4,
}

thread_local! {
    static HELD: RefCell<Vec<(LockLevel, &'static str)>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct Leveled<T> {
    level: LockLevel,
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> Leveled<T> {
    pub(crate) const fn new(level: LockLevel, name: &'static str, value: T) -> Self {
        Self {
            level,
            name,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> LevelGuard<'_, T> {
        if cfg!(debug_assertions) {
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(&(level, name)) = held.iter().max_by_key(|(level, _)| *level) {
                    debug_assert!(
                        level < self.level,
                        "lock order violation: acquiring '{}' ({:?}) while holding '{}' ({:?})",
                        self.name,
                        self.level,
                        name,
                        level
                    );
                }
                held.push((self.level, self.name));
            });
        }

        // A panic inside a critical section leaves the data consistent
        // enough for bookkeeping; keep going instead of cascading panics.
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        LevelGuard {
            guard,
            level: self.level,
            name: self.name,
        }
    }
}

pub(crate) struct LevelGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    level: LockLevel,
    name: &'static str,
}

impl<T> Deref for LevelGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for LevelGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for LevelGuard<'_, T> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held
                    .iter()
                    .rposition(|&(level, name)| level == self.level && name == self.name)
                {
                    held.remove(pos);
                }
            });
        }
    }
}
