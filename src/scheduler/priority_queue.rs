//! Intrusive priority queue of task sources, keyed by [`SortKey`].
//!
//! Unlike `std::collections::BinaryHeap`, entries can be located and
//! resifted by identity in O(log n) because each `TaskSource` carries its
//! own heap position (`heap_handle`). All operations here assume the
//! caller already holds the owning `ThreadGroup`'s lock.

use super::priority::{Priority, SortKey};
use super::task_source::{RegisteredTaskSource, TaskSource};

struct Entry {
    task_source: RegisteredTaskSource,
    sort_key: SortKey,
}

#[derive(Default)]
pub struct PriorityQueue {
    heap: Vec<Entry>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self { heap: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Inserts `ts` with `key`. Debug-asserts `ts` is not already enqueued;
    /// that invariant is the producer's responsibility (see
    /// `ThreadGroup::push_task_source_and_wake_up_workers`).
    pub fn push(&mut self, ts: RegisteredTaskSource, key: SortKey) {
        debug_assert!(ts.heap_handle().is_none(), "task source pushed while already enqueued");
        let idx = self.heap.len();
        self.heap.push(Entry { task_source: ts, sort_key: key });
        self.sync_handle(idx);
        self.sift_up(idx);
    }

    pub fn peek_top(&self) -> Option<(&RegisteredTaskSource, SortKey)> {
        self.heap.first().map(|e| (&e.task_source, e.sort_key))
    }

    pub fn pop_top(&mut self) -> Option<RegisteredTaskSource> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let entry = self.heap.pop().unwrap();
        entry.task_source.clear_heap_handle();
        if !self.heap.is_empty() {
            self.sync_handle(0);
            self.sift_down(0);
        }
        Some(entry.task_source)
    }

    /// Resifts `ts` to `new_key`'s position. No-op if `ts` is not enqueued.
    pub fn update_sort_key(&mut self, ts: &TaskSource, new_key: SortKey) {
        if let Some(idx) = ts.heap_handle() {
            self.heap[idx].sort_key = new_key;
            self.sift_up(idx);
            self.sift_down(idx);
        }
    }

    pub fn remove(&mut self, ts: &TaskSource) -> Option<RegisteredTaskSource> {
        let idx = ts.heap_handle()?;
        let last = self.heap.len() - 1;
        self.heap.swap(idx, last);
        let entry = self.heap.pop().unwrap();
        entry.task_source.clear_heap_handle();
        if idx < self.heap.len() {
            self.sync_handle(idx);
            self.sift_up(idx);
            self.sift_down(idx);
        }
        Some(entry.task_source)
    }

    pub fn num_with_priority(&self, priority: Priority) -> usize {
        self.heap.iter().filter(|e| e.sort_key.priority == priority).count()
    }

    /// Visits every enqueued source, in no particular order. Used for the
    /// desired-awake-worker accounting, which needs to inspect every
    /// queued source rather than just the top one.
    pub fn for_each(&self, mut f: impl FnMut(&RegisteredTaskSource)) {
        for entry in &self.heap {
            f(&entry.task_source);
        }
    }

    /// Drains every entry, clearing their heap handles. Used for group
    /// hand-off, where the whole queue moves to another group at once.
    pub fn drain_all(&mut self) -> Vec<(RegisteredTaskSource, SortKey)> {
        self.heap
            .drain(..)
            .map(|e| {
                e.task_source.clear_heap_handle();
                (e.task_source, e.sort_key)
            })
            .collect()
    }

    fn sync_handle(&mut self, idx: usize) {
        self.heap[idx].task_source.set_heap_handle(idx);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].sort_key > self.heap[parent].sort_key {
                self.heap.swap(idx, parent);
                self.sync_handle(idx);
                self.sync_handle(parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut largest = idx;
            if left < len && self.heap[left].sort_key > self.heap[largest].sort_key {
                largest = left;
            }
            if right < len && self.heap[right].sort_key > self.heap[largest].sort_key {
                largest = right;
            }
            if largest == idx {
                break;
            }
            self.heap.swap(idx, largest);
            self.sync_handle(idx);
            self.sync_handle(largest);
            idx = largest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::priority::{ShutdownBehavior, TaskTraits};
    use crate::scheduler::task_source::TaskSource;

    fn source(priority: Priority) -> RegisteredTaskSource {
        let traits = TaskTraits { priority, shutdown_behavior: ShutdownBehavior::SkipOnShutdown, max_concurrency: 1 };
        RegisteredTaskSource::new(TaskSource::new(traits, vec![]))
    }

    #[test]
    fn pops_highest_priority_first() {
        let mut q = PriorityQueue::new();
        q.push(source(Priority::BestEffort), SortKey::new(Priority::BestEffort, 0, 0));
        q.push(source(Priority::UserBlocking), SortKey::new(Priority::UserBlocking, 0, 1));
        q.push(source(Priority::UserVisible), SortKey::new(Priority::UserVisible, 0, 2));

        let top = q.pop_top().unwrap();
        assert_eq!(top.traits().priority, Priority::UserBlocking);
        let next = q.pop_top().unwrap();
        assert_eq!(next.traits().priority, Priority::UserVisible);
        let last = q.pop_top().unwrap();
        assert_eq!(last.traits().priority, Priority::BestEffort);
    }

    #[test]
    fn update_sort_key_resifts_entry() {
        let mut q = PriorityQueue::new();
        let low = source(Priority::UserVisible);
        let low_ts = low.task_source().clone();
        q.push(low, SortKey::new(Priority::UserVisible, 0, 0));
        q.push(source(Priority::BestEffort), SortKey::new(Priority::BestEffort, 0, 1));

        q.update_sort_key(&low_ts, SortKey::new(Priority::BestEffort, 0, 2));
        // Now both entries are BestEffort; earliest tiebreaker (1) wins.
        let top = q.pop_top().unwrap();
        assert_eq!(top.worker_count(), 0);
        assert!(q.peek_top().is_some());
    }

    #[test]
    fn remove_clears_heap_handle() {
        let mut q = PriorityQueue::new();
        let ts = source(Priority::UserVisible);
        let handle = ts.task_source().clone();
        q.push(ts, SortKey::new(Priority::UserVisible, 0, 0));
        assert!(handle.heap_handle().is_some());
        q.remove(&handle);
        assert!(handle.heap_handle().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn num_with_priority_counts_matching_entries() {
        let mut q = PriorityQueue::new();
        q.push(source(Priority::BestEffort), SortKey::new(Priority::BestEffort, 0, 0));
        q.push(source(Priority::BestEffort), SortKey::new(Priority::BestEffort, 0, 1));
        q.push(source(Priority::UserBlocking), SortKey::new(Priority::UserBlocking, 0, 2));
        assert_eq!(q.num_with_priority(Priority::BestEffort), 2);
        assert_eq!(q.num_with_priority(Priority::UserBlocking), 1);
    }

    #[test]
    fn drain_all_empties_queue_and_clears_handles() {
        let mut q = PriorityQueue::new();
        let ts = source(Priority::UserVisible);
        let handle = ts.task_source().clone();
        q.push(ts, SortKey::new(Priority::UserVisible, 0, 0));
        let drained = q.drain_all();
        assert_eq!(drained.len(), 1);
        assert!(q.is_empty());
        assert!(handle.heap_handle().is_none());
    }
}
