//! Retained task outputs.
//!
//! A finished task's output is kept here until every dependent that reads it
//! has consumed it, then released. Outputs stored with `manual_clear` stay
//! until [`OutputStore::clear_output_data`] is called regardless of their
//! consumer count.

use std::collections::HashMap;

use tracing::trace;

use crate::data::DataCollection;
use crate::task::TaskId;

#[derive(Debug)]
struct OutputDataInfo {
    data: DataCollection,
    manual_clear: bool,
    remaining: usize,
    culled: bool,
}

#[derive(Debug, Default)]
pub(crate) struct OutputStore {
    outputs: HashMap<TaskId, OutputDataInfo>,
}

impl OutputStore {
    /// Records a finished task's output with the number of dependents that
    /// still have to consume it. Returns whether the output is retained.
    pub(crate) fn store_result(
        &mut self,
        id: TaskId,
        data: DataCollection,
        manual_clear: bool,
        consumers: usize,
    ) -> bool {
        debug_assert!(!self.outputs.contains_key(&id), "output of {id} stored twice");

        if consumers == 0 && !manual_clear {
            trace!(task = %id, "output has no consumers, released at once");
            return false;
        }

        self.outputs.insert(
            id,
            OutputDataInfo {
                data,
                manual_clear,
                remaining: consumers,
                culled: false,
            },
        );
        true
    }

    /// One consumption by one dependent of each listed producer. Returns the
    /// producers whose output was released as a result.
    pub(crate) fn mark_input_results<I>(&mut self, ids: I) -> Vec<TaskId>
    where
        I: IntoIterator<Item = TaskId>,
    {
        ids.into_iter().filter(|&id| self.release_one(id)).collect()
    }

    /// A dependent scheduled after the producer finished.
    pub(crate) fn add_consumer(&mut self, id: TaskId) -> bool {
        match self.outputs.get_mut(&id) {
            Some(info) => {
                info.remaining += 1;
                true
            }
            None => false,
        }
    }

    /// A counted dependent was removed before consuming. Returns whether the
    /// output was released.
    pub(crate) fn remove_consumer(&mut self, id: TaskId, culled: bool) -> bool {
        if culled && let Some(info) = self.outputs.get_mut(&id) {
            info.culled = true;
        }
        self.release_one(id)
    }

    pub(crate) fn clear_output_data(&mut self, id: TaskId) -> bool {
        self.outputs.remove(&id).is_some()
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<DataCollection> {
        self.outputs.get(&id).map(|info| info.data.clone())
    }

    pub(crate) fn is_retained(&self, id: TaskId) -> bool {
        self.outputs.contains_key(&id)
    }

    pub(crate) fn remaining(&self, id: TaskId) -> Option<usize> {
        self.outputs.get(&id).map(|info| info.remaining)
    }

    /// True if a consumer of this output was pruned for reading only
    /// inactive pins.
    pub(crate) fn was_culled(&self, id: TaskId) -> bool {
        self.outputs.get(&id).is_some_and(|info| info.culled)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    fn release_one(&mut self, id: TaskId) -> bool {
        let Some(info) = self.outputs.get_mut(&id) else {
            return false;
        };

        debug_assert!(info.remaining > 0, "consumer count of {id} would go negative");
        info.remaining = info.remaining.saturating_sub(1);

        if info.remaining == 0 && !info.manual_clear {
            self.outputs.remove(&id);
            trace!(task = %id, "output released");
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TaggedData;

    fn id(n: u64) -> TaskId {
        let mut id = TaskId::FIRST;
        for _ in 1..n {
            id = id.next();
        }
        id
    }

    fn data() -> DataCollection {
        DataCollection::new(vec![TaggedData::new(0, 1u8)])
    }

    #[test]
    fn test_released_after_last_consumer() {
        let mut store = OutputStore::default();
        assert!(store.store_result(id(1), data(), false, 2));

        assert!(store.mark_input_results([id(1)]).is_empty());
        assert!(store.is_retained(id(1)));

        assert_eq!(store.mark_input_results([id(1)]), vec![id(1)]);
        assert!(!store.is_retained(id(1)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_no_consumers_not_retained() {
        let mut store = OutputStore::default();
        assert!(!store.store_result(id(1), data(), false, 0));
        assert!(store.get(id(1)).is_none());
    }

    #[test]
    fn test_manual_clear_outlives_consumers() {
        let mut store = OutputStore::default();
        store.store_result(id(1), data(), true, 1);

        assert!(store.mark_input_results([id(1)]).is_empty());
        assert!(store.is_retained(id(1)));
        assert_eq!(store.remaining(id(1)), Some(0));

        assert!(store.clear_output_data(id(1)));
        assert!(!store.is_retained(id(1)));
    }

    #[test]
    fn test_late_consumer_and_removal() {
        let mut store = OutputStore::default();
        store.store_result(id(1), data(), false, 1);
        assert!(store.add_consumer(id(1)));
        assert_eq!(store.remaining(id(1)), Some(2));

        assert!(!store.remove_consumer(id(1), true));
        assert!(store.was_culled(id(1)));
        assert!(store.remove_consumer(id(1), false));
        assert!(!store.add_consumer(id(1)));
    }

    #[test]
    fn test_shared_items() {
        let mut store = OutputStore::default();
        let stored = data();
        store.store_result(id(3), stored.clone(), false, 2);

        let a = store.get(id(3)).unwrap();
        let b = store.get(id(3)).unwrap();
        assert!(a.same_as(&stored));
        assert!(a.same_as(&b));
    }
}
