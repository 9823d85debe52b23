//! Small capability traits consumed by the core (`TaskTracker`,
//! `DelayedRunner`, `GroupSelector`, `ThreadEnvironment`), plus default
//! implementations that make a standalone `ThreadPool` usable without a
//! host process wiring in its own collaborators.

use std::any::Any;
use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::priority::{Priority, TaskTraits};
use super::task_source::{RegisteredTaskSource, TaskSource};
use super::ThreadGroup;

/// Admission control and registration for task sources.
pub trait TaskTracker: Send + Sync {
    fn can_run_priority(&self, priority: Priority) -> bool;
    fn register_task_source(&self, task_source: Arc<TaskSource>) -> Option<RegisteredTaskSource>;
    fn is_shutdown_complete(&self) -> bool;
}

/// Admits everything. The default tracker, and what tests use unless they
/// need to exercise admission control explicitly.
#[derive(Debug, Default)]
pub struct AllowAllTaskTracker;

impl TaskTracker for AllowAllTaskTracker {
    fn can_run_priority(&self, _priority: Priority) -> bool {
        true
    }

    fn register_task_source(&self, task_source: Arc<TaskSource>) -> Option<RegisteredTaskSource> {
        Some(RegisteredTaskSource::new(task_source))
    }

    fn is_shutdown_complete(&self) -> bool {
        false
    }
}

/// The single-threaded "service thread" that hosts `AdjustMaxTasks`
/// polling and other delayed callbacks.
pub trait DelayedRunner: Send + Sync {
    fn post_delayed(&self, task: Box<dyn FnOnce() + Send>, delay: Duration);
}

struct PendingClosure {
    deadline: Instant,
    seq: u64,
    task: Box<dyn FnOnce() + Send>,
}

impl PartialEq for PendingClosure {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for PendingClosure {}

impl Ord for PendingClosure {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: a `BinaryHeap` is a max-heap, we want the nearest deadline on top.
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for PendingClosure {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A `DelayedRunner` backed by one dedicated OS thread, following the same
/// mutex+condvar wake pattern the rest of the scheduler uses for worker
/// threads rather than introducing a second concurrency primitive.
pub struct ServiceThreadDelayedRunner {
    pending: Arc<(Mutex<BinaryHeap<PendingClosure>>, Condvar)>,
    next_seq: AtomicU64,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceThreadDelayedRunner {
    pub fn new() -> Self {
        let pending = Arc::new((Mutex::new(BinaryHeap::new()), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let pending_clone = pending.clone();
        let shutdown_clone = shutdown.clone();
        let handle = thread::Builder::new()
            .name("gg-sched-service".into())
            .spawn(move || Self::service_loop(pending_clone, shutdown_clone))
            .expect("failed to start scheduler service thread");

        Self { pending, next_seq: AtomicU64::new(0), shutdown, handle: Mutex::new(Some(handle)) }
    }

    fn service_loop(pending: Arc<(Mutex<BinaryHeap<PendingClosure>>, Condvar)>, shutdown: Arc<AtomicBool>) {
        let (lock, cvar) = &*pending;
        loop {
            if shutdown.load(AtomicOrdering::Acquire) {
                return;
            }
            let mut guard = lock.lock().unwrap();
            let now = Instant::now();
            while let Some(next) = guard.peek() {
                if next.deadline > now {
                    break;
                }
                let due = guard.pop().unwrap();
                drop(guard);
                (due.task)();
                guard = lock.lock().unwrap();
            }
            if shutdown.load(AtomicOrdering::Acquire) {
                return;
            }
            let timeout = guard
                .peek()
                .map(|p| p.deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            let _ = cvar.wait_timeout(guard, timeout).unwrap();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        let (_lock, cvar) = &*self.pending;
        cvar.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Default for ServiceThreadDelayedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServiceThreadDelayedRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DelayedRunner for ServiceThreadDelayedRunner {
    fn post_delayed(&self, task: Box<dyn FnOnce() + Send>, delay: Duration) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let (lock, cvar) = &*self.pending;
        lock.lock().unwrap().push(PendingClosure { deadline: Instant::now() + delay, seq, task });
        cvar.notify_one();
    }
}

/// Maps a task source's traits to the group that should run it.
pub trait GroupSelector: Send + Sync {
    fn group_for_traits(&self, traits: TaskTraits) -> Arc<ThreadGroup>;
}

/// The conventional two-pool arrangement: best-effort traits go to a
/// background group, everything else to a foreground group.
pub struct TwoGroupSelector {
    pub foreground: Arc<ThreadGroup>,
    pub background: Arc<ThreadGroup>,
}

impl GroupSelector for TwoGroupSelector {
    fn group_for_traits(&self, traits: TaskTraits) -> Arc<ThreadGroup> {
        if traits.priority == Priority::BestEffort {
            self.background.clone()
        } else {
            self.foreground.clone()
        }
    }
}

/// Per-platform thread-environment initialization (e.g. COM/WinRT on
/// Windows), acquired in `OnMainEntry` and released when the returned
/// guard drops in `OnMainExit`. Treated opaquely by the scheduler.
pub trait ThreadEnvironment: Send + Sync {
    fn enter(&self) -> Box<dyn Any + Send>;
}

/// The only environment this crate actually initializes: none.
#[derive(Debug, Default)]
pub struct NoopThreadEnvironment;

impl ThreadEnvironment for NoopThreadEnvironment {
    fn enter(&self) -> Box<dyn Any + Send> {
        Box::new(())
    }
}

/// Per-group environment selection, fixed at `Start` time. Only `None` is
/// backed by a real `ThreadEnvironment` implementation in this crate; the
/// COM variants document the hook a Windows host would fill in, since
/// COM/WinRT initialization itself is out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEnvironment {
    None,
    ComMta,
    ComSta,
}

impl Default for WorkerEnvironment {
    fn default() -> Self {
        Self::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn allow_all_tracker_admits_everything() {
        let tracker = AllowAllTaskTracker;
        assert!(tracker.can_run_priority(Priority::BestEffort));
        assert!(tracker.can_run_priority(Priority::UserBlocking));
        assert!(!tracker.is_shutdown_complete());
    }

    #[test]
    fn service_thread_runs_delayed_closure() {
        let runner = ServiceThreadDelayedRunner::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        runner.post_delayed(Box::new(move || ran_clone.store(true, AtomicOrdering::SeqCst)), Duration::from_millis(20));
        thread::sleep(Duration::from_millis(150));
        assert!(ran.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn service_thread_runs_closures_in_deadline_order() {
        let runner = ServiceThreadDelayedRunner::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = order.clone();
        let b = order.clone();
        runner.post_delayed(Box::new(move || a.lock().unwrap().push("second")), Duration::from_millis(80));
        runner.post_delayed(Box::new(move || b.lock().unwrap().push("first")), Duration::from_millis(10));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn noop_thread_environment_is_enterable() {
        let env = NoopThreadEnvironment;
        let _guard = env.enter();
        let _count = AtomicUsize::new(0);
    }
}
