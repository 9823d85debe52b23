//! `TaskSource`: an ordered stream of tasks treated as a single unit of
//! concurrency by the priority queue.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::priority::{SortKey, TaskTraits};

/// One runnable unit of work. Opaque to the scheduler; never logged.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const NO_HANDLE: usize = usize::MAX;

struct TaskSourceInner {
    tasks: VecDeque<Task>,
}

/// An ordered sequence of tasks with a priority and a position in at most
/// one [`super::priority_queue::PriorityQueue`] at a time.
pub struct TaskSource {
    traits: TaskTraits,
    inner: Mutex<TaskSourceInner>,
    worker_count: AtomicU32,
    // `NO_HANDLE` when not enqueued, else this source's index in the heap
    // it is currently owned by. Only ever touched while that heap's
    // `ThreadGroup` lock is held, so relaxed ordering is sufficient.
    heap_handle: AtomicUsize,
}

impl TaskSource {
    pub fn new(traits: TaskTraits, tasks: Vec<Task>) -> Arc<Self> {
        Arc::new(Self {
            traits,
            inner: Mutex::new(TaskSourceInner { tasks: tasks.into() }),
            worker_count: AtomicU32::new(0),
            heap_handle: AtomicUsize::new(NO_HANDLE),
        })
    }

    pub fn traits(&self) -> TaskTraits {
        self.traits
    }

    /// Pops the next task, or `None` if the source is exhausted.
    pub fn take_next_task(&self) -> Option<Task> {
        self.inner.lock().unwrap().tasks.pop_front()
    }

    pub fn has_tasks(&self) -> bool {
        !self.inner.lock().unwrap().tasks.is_empty()
    }

    /// Appends more tasks to a source that is already registered with a
    /// thread group (e.g. a long-lived sequence that keeps being fed work).
    pub fn push_task(&self, task: Task) {
        self.inner.lock().unwrap().tasks.push_back(task);
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count.load(Ordering::Acquire)
    }

    pub(super) fn increment_worker_count(&self) {
        self.worker_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn decrement_worker_count(&self) {
        self.worker_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// How many additional workers could usefully run this source right
    /// now, beyond the one implied by its mere presence in the queue.
    pub fn remaining_concurrency(&self) -> usize {
        let running = self.worker_count() as usize;
        self.traits.max_concurrency.saturating_sub(running)
    }

    pub fn sort_key(&self, tiebreaker: u64) -> SortKey {
        SortKey::new(self.traits.priority, self.worker_count(), tiebreaker)
    }

    pub(super) fn heap_handle(&self) -> Option<usize> {
        match self.heap_handle.load(Ordering::Relaxed) {
            NO_HANDLE => None,
            idx => Some(idx),
        }
    }

    pub(super) fn set_heap_handle(&self, idx: usize) {
        self.heap_handle.store(idx, Ordering::Relaxed);
    }

    pub(super) fn clear_heap_handle(&self) {
        self.heap_handle.store(NO_HANDLE, Ordering::Relaxed);
    }
}

/// A `TaskSource` the `TaskTracker` has certified as permitted to run.
/// Holding one is the capability that lets a `ThreadGroup` enqueue or run
/// tasks from the wrapped source; dropping it releases that capability
/// (no lock is taken doing so — it is just an `Arc` decrement).
pub struct RegisteredTaskSource(Arc<TaskSource>);

impl RegisteredTaskSource {
    pub fn new(task_source: Arc<TaskSource>) -> Self {
        Self(task_source)
    }

    pub fn into_inner(self) -> Arc<TaskSource> {
        self.0
    }

    pub fn task_source(&self) -> &Arc<TaskSource> {
        &self.0
    }
}

impl Deref for RegisteredTaskSource {
    type Target = TaskSource;

    fn deref(&self) -> &TaskSource {
        &self.0
    }
}

impl Clone for RegisteredTaskSource {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
