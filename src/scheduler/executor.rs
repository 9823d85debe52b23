//! `ScopedCommandsExecutor`: batches wake/start/reenqueue/adjust-max-tasks
//! actions so they run OUTSIDE the group lock.
//!
//! Every lock-required method takes a `&mut CommandsExecutor` and only
//! ever records intent on it; the actions themselves run when the
//! executor is flushed, which happens either explicitly (the two-phase
//! dance in `GetWork`, see `flush_worker_creation`) or implicitly when the
//! executor is dropped. Declaring the executor *before* the lock guard in
//! every caller means Rust's reverse-drop order releases the lock first
//! and flushes the executor second, exactly as required.

use std::sync::Arc;

use super::task_source::RegisteredTaskSource;
use super::worker::WorkerId;
use super::ThreadGroup;

pub(super) struct CommandsExecutor<'g> {
    group: &'g ThreadGroup,
    to_wake: Vec<WorkerId>,
    to_start: Vec<WorkerId>,
    to_release: Vec<RegisteredTaskSource>,
    to_reenqueue: Vec<(RegisteredTaskSource, Arc<ThreadGroup>)>,
    schedule_adjust_max_tasks: bool,
}

impl<'g> CommandsExecutor<'g> {
    pub fn new(group: &'g ThreadGroup) -> Self {
        Self {
            group,
            to_wake: Vec::new(),
            to_start: Vec::new(),
            to_release: Vec::new(),
            to_reenqueue: Vec::new(),
            schedule_adjust_max_tasks: false,
        }
    }

    pub fn schedule_wake_up(&mut self, id: WorkerId) {
        self.to_wake.push(id);
    }

    pub fn schedule_start(&mut self, id: WorkerId) {
        self.to_start.push(id);
    }

    pub fn schedule_release(&mut self, ts: RegisteredTaskSource) {
        self.to_release.push(ts);
    }

    pub fn schedule_reenqueue(&mut self, ts: RegisteredTaskSource, destination: Arc<ThreadGroup>) {
        self.to_reenqueue.push((ts, destination));
    }

    pub fn schedule_adjust_max_tasks(&mut self) {
        self.schedule_adjust_max_tasks = true;
    }

    /// Flushes only wake/start commands. Must be called with the group
    /// lock **not** held; `GetWork` calls this mid-function, between its
    /// call to `EnsureEnoughWorkers` and re-acquiring the lock, so that a
    /// worker it just woke or created can make progress without waiting
    /// for this `GetWork` call to finish first.
    pub fn flush_worker_creation(&mut self) {
        for id in self.to_wake.drain(..) {
            self.group.wake_worker(id);
        }
        for id in self.to_start.drain(..) {
            self.group.start_worker_thread(id);
        }
    }

    fn flush_remaining(&mut self) {
        self.flush_worker_creation();
        // Dropping `to_release` here (rather than letting the struct's own
        // `Drop` do it implicitly) keeps the "released outside the lock"
        // intent explicit at the call site.
        self.to_release.clear();
        for (ts, destination) in self.to_reenqueue.drain(..) {
            destination.push_task_source_and_wake_up_workers(ts);
        }
        if std::mem::take(&mut self.schedule_adjust_max_tasks) {
            self.group.schedule_adjust_max_tasks();
        }
    }
}

impl Drop for CommandsExecutor<'_> {
    fn drop(&mut self) {
        self.flush_remaining();
    }
}
