//! `Worker`: one OS thread driving the `GetWork -> run -> DidProcessTask`
//! loop against its owning `ThreadGroup`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::blocking;
use super::capabilities::ThreadEnvironment;
use super::priority::{Priority, ShutdownBehavior};
use super::ThreadGroup;

pub type WorkerId = u64;

/// Level-triggered, auto-reset wake event for one worker, plus the flag
/// that tells its thread to exit instead of waiting again.
pub(super) struct WorkerSignal {
    pending: Mutex<bool>,
    condvar: Condvar,
    marked_for_cleanup: AtomicBool,
}

impl WorkerSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { pending: Mutex::new(false), condvar: Condvar::new(), marked_for_cleanup: AtomicBool::new(false) })
    }

    pub fn wake(&self) {
        *self.pending.lock().unwrap() = true;
        self.condvar.notify_one();
    }

    pub fn mark_for_cleanup(&self) {
        self.marked_for_cleanup.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_marked_for_cleanup(&self) -> bool {
        self.marked_for_cleanup.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for a wake. Returns `true` if woken, `false`
    /// if the wait timed out with nothing pending.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.pending.lock().unwrap();
        if !*guard {
            let (g, result) = self.condvar.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if result.timed_out() && !*guard {
                return false;
            }
        }
        *guard = false;
        true
    }
}

/// Per-worker state, combining `Worker` and `WorkerDelegate` from the
/// design (there is only ever one delegate implementation, so there is no
/// reason to keep them as separate polymorphic types in Rust). Lives
/// inside the `ThreadGroup`'s locked state except for `signal` and `join`,
/// which a worker's own thread must touch without the group lock held.
pub(super) struct WorkerRecord {
    pub id: WorkerId,
    pub signal: Arc<WorkerSignal>,
    pub join: Arc<Mutex<Option<JoinHandle<()>>>>,
    pub is_excess: bool,
    pub last_used_time: Option<Instant>,
    pub current_priority: Option<Priority>,
    pub current_shutdown_behavior: Option<ShutdownBehavior>,
    pub blocking_start_time: Option<Instant>,
    pub incremented_max_tasks_since_blocked: bool,
    pub incremented_max_best_effort_tasks_since_blocked: bool,
    pub incremented_max_tasks_for_shutdown: bool,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, is_excess: bool) -> Self {
        Self {
            id,
            signal: WorkerSignal::new(),
            join: Arc::new(Mutex::new(None)),
            is_excess,
            last_used_time: None,
            current_priority: None,
            current_shutdown_behavior: None,
            blocking_start_time: None,
            incremented_max_tasks_since_blocked: false,
            incremented_max_best_effort_tasks_since_blocked: false,
            incremented_max_tasks_for_shutdown: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.last_used_time.is_some()
    }
}

/// The worker main loop from the design: `GetWork`, run every task in the
/// returned source to exhaustion, `DidProcessTask`, repeat; sleep on the
/// worker's own event between sources, exiting once marked for cleanup.
pub(super) fn run_worker_thread(
    group: Arc<ThreadGroup>,
    id: WorkerId,
    signal: Arc<WorkerSignal>,
    environment: Arc<dyn ThreadEnvironment>,
) {
    let _environment_guard = environment.enter();
    group.on_main_entry(id);
    blocking::bind_current_worker(group.clone(), id);

    loop {
        match group.get_work(id) {
            Some(task_source) => {
                while let Some(task) = task_source.take_next_task() {
                    task();
                }
                group.did_process_task(id, Some(task_source));
            }
            None => {
                let timeout = group.get_sleep_timeout(id);
                let woken = signal.wait_timeout(timeout);
                if !woken && signal.is_marked_for_cleanup() {
                    break;
                }
            }
        }
    }

    blocking::clear_current_worker();
    group.on_main_exit(id);
}
