//! `ThreadGroup`: the pool of worker threads sharing one lock, one
//! priority queue, and one `max_tasks` budget.
//!
//! Every method below that touches `Inner` is either `*_locked` (caller
//! already holds the lock and a [`CommandsExecutor`] to record deferred
//! actions into) or acquires the lock itself for the duration of one
//! logical operation. None of them ever call out to user task code or
//! block on I/O while the lock is held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::capabilities::{GroupSelector, TaskTracker, ThreadEnvironment, DelayedRunner, WorkerEnvironment};
use super::executor::CommandsExecutor;
use super::priority::{Priority, ShutdownBehavior, SortKey, YieldKey};
use super::priority_queue::PriorityQueue;
use super::task_source::{RegisteredTaskSource, TaskSource};
use super::worker::{self, WorkerId, WorkerRecord};

/// Hard ceiling on live workers in one group, mirroring the ceiling a real
/// process enforces to keep a runaway producer from exhausting threads.
pub const MAX_NUMBER_OF_WORKERS: usize = 256;

/// At most this many idle workers are woken per `EnsureEnoughWorkers` call;
/// the rest of any deficit is closed by workers waking each other up as
/// they finish their own task sources.
const MAX_WORKERS_WOKEN_PER_CALL: usize = 2;

/// A non-excess worker's sleep never voluntarily times out.
const NEVER_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn scale_reclaim_timeout(base: Duration) -> Duration {
    let nanos = base.as_nanos() as u64;
    Duration::from_nanos(nanos.saturating_mul(11) / 10)
}

/// Immutable for a group's whole lifetime once [`ThreadGroup::start`] returns.
#[derive(Debug, Clone)]
pub struct ThreadGroupConfig {
    pub label: String,
    pub initial_max_tasks: usize,
    pub initial_max_best_effort_tasks: usize,
    pub suggested_reclaim_time: Duration,
    pub may_block_threshold: Duration,
    pub blocked_workers_poll_period: Duration,
    pub worker_environment: WorkerEnvironment,
    /// Disables voluntary worker reclaim entirely. Set by tests that need a
    /// stable worker count, and by hosts that would rather trade idle
    /// threads for not paying thread-creation cost on bursty load.
    pub no_worker_reclaim: bool,
    /// When `true`, the priority queue breaks same-priority ties by arrival
    /// order (fair scheduling). When `false`, ties are broken arbitrarily,
    /// which is cheaper since it skips the `next_tiebreaker` bookkeeping.
    pub fair_scheduling: bool,
}

impl ThreadGroupConfig {
    pub fn foreground(label: impl Into<String>, max_tasks: usize, max_best_effort_tasks: usize) -> Self {
        Self {
            label: label.into(),
            initial_max_tasks: max_tasks,
            initial_max_best_effort_tasks: max_best_effort_tasks,
            suggested_reclaim_time: Duration::from_secs(30),
            may_block_threshold: Duration::from_millis(1000),
            blocked_workers_poll_period: Duration::from_millis(1200),
            worker_environment: WorkerEnvironment::None,
            no_worker_reclaim: false,
            fair_scheduling: true,
        }
    }

    pub fn background(label: impl Into<String>, max_tasks: usize, max_best_effort_tasks: usize) -> Self {
        Self {
            label: label.into(),
            initial_max_tasks: max_tasks,
            initial_max_best_effort_tasks: max_best_effort_tasks,
            suggested_reclaim_time: Duration::from_secs(30),
            may_block_threshold: Duration::from_secs(10),
            blocked_workers_poll_period: Duration::from_secs(12),
            worker_environment: WorkerEnvironment::None,
            no_worker_reclaim: false,
            fair_scheduling: true,
        }
    }
}

struct Inner {
    workers: Vec<WorkerRecord>,
    /// LIFO: the most-recently-idled worker wakes first, so a worker that
    /// was never needed (bottom of the stack) is the one left to reclaim.
    idle_stack: Vec<WorkerId>,
    max_tasks: usize,
    max_best_effort_tasks: usize,
    num_running_tasks: usize,
    num_running_best_effort_tasks: usize,
    num_unresolved_may_block: usize,
    num_unresolved_best_effort_may_block: usize,
    priority_queue: PriorityQueue,
    join_for_testing_started: bool,
    worker_cleanup_disallowed_for_testing: bool,
    shutdown_started: bool,
    adjust_max_tasks_posted: bool,
    replacement_thread_group: Option<Weak<ThreadGroup>>,
    next_tiebreaker: u64,
}

impl Inner {
    fn new(config: &ThreadGroupConfig) -> Self {
        Self {
            workers: Vec::new(),
            idle_stack: Vec::new(),
            max_tasks: config.initial_max_tasks,
            max_best_effort_tasks: config.initial_max_best_effort_tasks,
            num_running_tasks: 0,
            num_running_best_effort_tasks: 0,
            num_unresolved_may_block: 0,
            num_unresolved_best_effort_may_block: 0,
            priority_queue: PriorityQueue::new(),
            join_for_testing_started: false,
            worker_cleanup_disallowed_for_testing: false,
            shutdown_started: false,
            adjust_max_tasks_posted: false,
            replacement_thread_group: None,
            next_tiebreaker: 0,
        }
    }
}

fn find_worker<'a>(inner: &'a Inner, id: WorkerId) -> Option<&'a WorkerRecord> {
    inner.workers.iter().find(|w| w.id == id)
}

fn find_worker_mut<'a>(inner: &'a mut Inner, id: WorkerId) -> Option<&'a mut WorkerRecord> {
    inner.workers.iter_mut().find(|w| w.id == id)
}

/// Pushes `id` onto the idle stack and stamps its idle-since time, unless
/// it is already there.
fn park_idle(inner: &mut Inner, id: WorkerId) {
    if !inner.idle_stack.contains(&id) {
        inner.idle_stack.push(id);
    }
    if let Some(w) = find_worker_mut(inner, id) {
        w.last_used_time = Some(Instant::now());
    }
}

/// Pops the most-recently-idled worker and clears its idle timestamp, since
/// the caller is about to put it back to work.
fn pop_idle_for_wake(inner: &mut Inner) -> Option<WorkerId> {
    let id = inner.idle_stack.pop()?;
    if let Some(w) = find_worker_mut(inner, id) {
        w.last_used_time = None;
    }
    Some(id)
}

/// A pool of worker threads sharing one lock, one priority queue of task
/// sources, and one `max_tasks` budget. See `ThreadPool` for the
/// two-group (foreground/background) arrangement most hosts want.
pub struct ThreadGroup {
    config: ThreadGroupConfig,
    task_tracker: Arc<dyn TaskTracker>,
    delayed_runner: Arc<dyn DelayedRunner>,
    group_selector: OnceLock<Weak<dyn GroupSelector>>,
    environment: Arc<dyn ThreadEnvironment>,
    inner: Mutex<Inner>,
    /// Packed `YieldKey`, read with relaxed ordering by `ShouldYield` on
    /// every worker thread without ever taking `inner`'s lock.
    max_allowed_sort_key: AtomicU64,
    next_worker_id: AtomicU64,
    self_ref: OnceLock<Weak<ThreadGroup>>,
}

impl ThreadGroup {
    /// Builds the group and starts its first worker. Panics if that first
    /// thread fails to spawn, matching the rest of this crate's policy of
    /// treating thread-creation failure as fatal rather than something
    /// callers are expected to recover from.
    pub fn start(
        config: ThreadGroupConfig,
        task_tracker: Arc<dyn TaskTracker>,
        delayed_runner: Arc<dyn DelayedRunner>,
        environment: Arc<dyn ThreadEnvironment>,
    ) -> Arc<Self> {
        let inner = Inner::new(&config);
        let label = config.label.clone();
        let group = Arc::new(Self {
            config,
            task_tracker,
            delayed_runner,
            group_selector: OnceLock::new(),
            environment,
            inner: Mutex::new(inner),
            max_allowed_sort_key: AtomicU64::new(YieldKey::MAX_YIELD.encode()),
            next_worker_id: AtomicU64::new(0),
            self_ref: OnceLock::new(),
        });
        let _ = group.self_ref.set(Arc::downgrade(&group));

        {
            let mut executor = CommandsExecutor::new(&group);
            let mut inner = group.inner.lock().unwrap();
            group.ensure_enough_workers_locked(&mut inner, &mut executor);
        }
        info!(group = %label, "thread group started");
        group
    }

    /// Wires in the selector used to decide where a re-enqueued task source
    /// should land. Set once, after both groups of a `ThreadPool` exist.
    pub fn set_group_selector(&self, selector: Weak<dyn GroupSelector>) {
        let _ = self.group_selector.set(selector);
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().unwrap().workers.len()
    }

    pub fn max_tasks(&self) -> usize {
        self.inner.lock().unwrap().max_tasks
    }

    pub fn max_best_effort_tasks(&self) -> usize {
        self.inner.lock().unwrap().max_best_effort_tasks
    }

    pub fn queued_task_source_count(&self) -> usize {
        self.inner.lock().unwrap().priority_queue.len()
    }

    pub fn set_worker_cleanup_disallowed_for_testing(&self, disallowed: bool) {
        self.inner.lock().unwrap().worker_cleanup_disallowed_for_testing = disallowed;
    }

    fn self_arc(&self) -> Arc<ThreadGroup> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("ThreadGroup method called after the group itself was dropped")
    }

    fn next_tiebreaker(&self, inner: &mut Inner) -> u64 {
        let t = inner.next_tiebreaker;
        inner.next_tiebreaker += 1;
        t
    }

    // ---- registration and dispatch -------------------------------------

    /// Registers `ts` with this group, assigns it a sort key, and wakes
    /// enough workers (creating one if needed) to service it.
    pub fn push_task_source_and_wake_up_workers(&self, ts: RegisteredTaskSource) {
        let mut executor = CommandsExecutor::new(self);
        let mut inner = self.inner.lock().unwrap();

        if let Some(replacement) = inner.replacement_thread_group.clone().and_then(|w| w.upgrade()) {
            executor.schedule_reenqueue(ts, replacement);
            return;
        }

        debug_assert!(ts.heap_handle().is_none(), "pushing a task source that is already enqueued");
        let tiebreaker = self.next_tiebreaker(&mut inner);
        let key = if self.config.fair_scheduling { ts.sort_key(tiebreaker) } else { ts.sort_key(0) };
        inner.priority_queue.push(ts, key);

        self.maintain_at_least_one_idle_worker_locked(&mut inner, &mut executor);
        self.ensure_enough_workers_locked(&mut inner, &mut executor);
    }

    /// Re-scores an already-enqueued task source, e.g. after its traits
    /// changed, and re-evaluates whether more workers are warranted.
    pub fn update_sort_key(&self, task_source: &Arc<TaskSource>) {
        let mut executor = CommandsExecutor::new(self);
        let mut inner = self.inner.lock().unwrap();

        let tiebreaker = if self.config.fair_scheduling { self.next_tiebreaker(&mut inner) } else { 0 };
        let key = task_source.sort_key(tiebreaker);
        inner.priority_queue.update_sort_key(task_source, key);

        self.update_max_allowed_sort_key_locked(&inner);
        self.ensure_enough_workers_locked(&mut inner, &mut executor);
    }

    /// `true` iff a higher-priority task source is currently queued than
    /// the one backing `sort_key`. Called from [`super::blocking::should_yield`]
    /// with no lock held.
    pub(super) fn should_yield(&self, sort_key: SortKey) -> bool {
        let bits = self.max_allowed_sort_key.load(Ordering::Relaxed);
        if bits == YieldKey::MAX_YIELD.encode() {
            return false;
        }
        let pending = YieldKey::decode(bits);
        let pending_key = SortKey::new(pending.priority, pending.worker_count, 0);
        let running_key = SortKey::new(sort_key.priority, sort_key.worker_count, 0);
        if pending_key <= running_key {
            return false;
        }
        // Race the sentinel in: whichever worker wins this CAS is the one
        // that actually yields for this arrival, so at most one does.
        self.max_allowed_sort_key
            .compare_exchange(bits, YieldKey::MAX_YIELD.encode(), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    fn update_max_allowed_sort_key_locked(&self, inner: &Inner) {
        let awake = inner.workers.len() - inner.idle_stack.len();
        let new_key = if awake < inner.max_tasks {
            // Spare capacity exists; an idle or new worker can absorb the
            // next item instead of preempting a running one.
            YieldKey::MAX_YIELD
        } else if let Some((_, top)) = inner.priority_queue.peek_top() {
            YieldKey::from_sort_key(top)
        } else {
            YieldKey::MAX_YIELD
        };
        self.max_allowed_sort_key.store(new_key.encode(), Ordering::Relaxed);
    }

    // ---- GetWork / DidProcessTask ---------------------------------------

    pub(super) fn on_main_entry(&self, worker_id: WorkerId) {
        debug!(group = %self.config.label, worker_id, "worker entering main loop");
    }

    pub(super) fn on_main_exit(&self, worker_id: WorkerId) {
        debug!(group = %self.config.label, worker_id, "worker exiting main loop");
    }

    pub(super) fn get_sleep_timeout(&self, worker_id: WorkerId) -> Duration {
        let inner = self.inner.lock().unwrap();
        match find_worker(&inner, worker_id) {
            Some(w) if w.is_excess && !self.config.no_worker_reclaim => scale_reclaim_timeout(self.config.suggested_reclaim_time),
            Some(_) => NEVER_TIMEOUT,
            // The worker was already cleaned up concurrently; give it a
            // short timeout so it notices and exits promptly.
            None => self.config.suggested_reclaim_time,
        }
    }

    fn can_cleanup_locked(&self, inner: &Inner, worker_id: WorkerId) -> bool {
        if inner.join_for_testing_started || inner.worker_cleanup_disallowed_for_testing || self.config.no_worker_reclaim {
            return false;
        }
        match find_worker(inner, worker_id) {
            Some(w) if w.is_excess => match w.last_used_time {
                Some(since) => Instant::now().duration_since(since) >= self.config.suggested_reclaim_time,
                None => false,
            },
            _ => false,
        }
    }

    fn cleanup_worker_locked(&self, inner: &mut Inner, worker_id: WorkerId) {
        inner.idle_stack.retain(|&id| id != worker_id);
        if let Some(pos) = inner.workers.iter().position(|w| w.id == worker_id) {
            let record = inner.workers.remove(pos);
            record.signal.mark_for_cleanup();
        }
    }

    fn can_get_work_locked(&self, inner: &mut Inner, worker_id: WorkerId) -> bool {
        if inner.idle_stack.contains(&worker_id) {
            if self.can_cleanup_locked(inner, worker_id) {
                self.cleanup_worker_locked(inner, worker_id);
            }
            return false;
        }
        let awake = inner.workers.len() - inner.idle_stack.len();
        if awake > inner.max_tasks {
            park_idle(inner, worker_id);
            return false;
        }
        true
    }

    /// Returns the next task source this worker should drain, or `None` if
    /// it should sleep. Exactly one `RegisteredTaskSource` is ever handed
    /// out per worker at a time; the worker drains it to exhaustion before
    /// asking again.
    pub(super) fn get_work(&self, worker_id: WorkerId) -> Option<RegisteredTaskSource> {
        {
            let mut executor = CommandsExecutor::new(self);
            let mut inner = self.inner.lock().unwrap();
            self.ensure_enough_workers_locked(&mut inner, &mut executor);
            drop(inner);
            executor.flush_worker_creation();
        }

        let mut inner = self.inner.lock().unwrap();
        if !self.can_get_work_locked(&mut inner, worker_id) {
            return None;
        }

        loop {
            let Some((_, top_key)) = inner.priority_queue.peek_top() else { return None };
            if !self.task_tracker.can_run_priority(top_key.priority) {
                return None;
            }
            let is_best_effort = top_key.priority == Priority::BestEffort;
            if is_best_effort && inner.num_running_best_effort_tasks >= inner.max_best_effort_tasks {
                return None;
            }

            let top_remaining = inner.priority_queue.peek_top().map(|(ts, _)| ts.remaining_concurrency()).unwrap_or(0);
            if top_remaining == 0 {
                // Raced with another worker claiming the last slot on this
                // source; drop it and look at what's now on top.
                inner.priority_queue.pop_top();
                continue;
            }

            let ts = inner.priority_queue.pop_top().expect("top was just peeked");
            ts.increment_worker_count();

            if ts.has_tasks() && ts.remaining_concurrency() > 0 {
                let tiebreaker = self.next_tiebreaker(&mut inner);
                let key = if self.config.fair_scheduling { ts.sort_key(tiebreaker) } else { ts.sort_key(0) };
                inner.priority_queue.push(ts.clone(), key);
            }

            inner.num_running_tasks += 1;
            if is_best_effort {
                inner.num_running_best_effort_tasks += 1;
            }

            let traits = ts.traits();
            if let Some(w) = find_worker_mut(&mut inner, worker_id) {
                w.current_priority = Some(traits.priority);
                w.current_shutdown_behavior = Some(traits.shutdown_behavior);
            }

            return Some(ts);
        }
    }

    pub(super) fn did_process_task(&self, worker_id: WorkerId, task_source: Option<RegisteredTaskSource>) {
        let mut executor = CommandsExecutor::new(self);
        let mut inner = self.inner.lock().unwrap();

        let was_best_effort = find_worker(&inner, worker_id).and_then(|w| w.current_priority) == Some(Priority::BestEffort);
        inner.num_running_tasks = inner.num_running_tasks.saturating_sub(1);
        if was_best_effort {
            inner.num_running_best_effort_tasks = inner.num_running_best_effort_tasks.saturating_sub(1);
        }

        let (for_shutdown, since_blocked, since_blocked_be) = match find_worker(&inner, worker_id) {
            Some(w) => (w.incremented_max_tasks_for_shutdown, w.incremented_max_tasks_since_blocked, w.incremented_max_best_effort_tasks_since_blocked),
            None => (false, false, false),
        };
        if for_shutdown {
            inner.max_tasks = inner.max_tasks.saturating_sub(1);
        }
        if since_blocked {
            debug_assert!(find_worker(&inner, worker_id).and_then(|w| w.blocking_start_time).is_none());
            inner.max_tasks = inner.max_tasks.saturating_sub(1);
            if since_blocked_be {
                inner.max_best_effort_tasks = inner.max_best_effort_tasks.saturating_sub(1);
            }
        }

        if let Some(w) = find_worker_mut(&mut inner, worker_id) {
            w.current_priority = None;
            w.current_shutdown_behavior = None;
            w.incremented_max_tasks_for_shutdown = false;
            w.incremented_max_tasks_since_blocked = false;
            w.incremented_max_best_effort_tasks_since_blocked = false;
        }

        if let Some(ts) = task_source {
            self.reenqueue_task_source_locked(&mut inner, &mut executor, ts);
        } else {
            self.update_max_allowed_sort_key_locked(&inner);
        }
    }

    fn reenqueue_task_source_locked(&self, inner: &mut Inner, executor: &mut CommandsExecutor, ts: RegisteredTaskSource) {
        ts.decrement_worker_count();

        if !ts.has_tasks() {
            // Drained to completion; nothing left to run, so release rather
            // than re-enqueuing an empty source on this group or the next.
            executor.schedule_release(ts);
            return;
        }

        let destination = self
            .group_selector
            .get()
            .and_then(Weak::upgrade)
            .map(|selector| selector.group_for_traits(ts.traits()))
            .unwrap_or_else(|| self.self_arc());

        if Arc::ptr_eq(&destination, &self.self_arc()) {
            if ts.heap_handle().is_some() {
                // A concurrent worker on a multi-concurrency source already
                // re-enqueued a fresh handle for it; just release ours.
                executor.schedule_release(ts);
            } else {
                let tiebreaker = self.next_tiebreaker(inner);
                let key = if self.config.fair_scheduling { ts.sort_key(tiebreaker) } else { ts.sort_key(0) };
                inner.priority_queue.push(ts, key);
                self.update_max_allowed_sort_key_locked(inner);
                self.ensure_enough_workers_locked(inner, executor);
            }
        } else {
            executor.schedule_reenqueue(ts, destination);
        }
    }

    // ---- worker population management -----------------------------------

    fn queued_additional_workers(&self, inner: &Inner, best_effort: bool) -> usize {
        let top_ptr = inner.priority_queue.peek_top().map(|(ts, _)| Arc::as_ptr(ts.task_source()));
        let mut count = 0usize;
        inner.priority_queue.for_each(|ts| {
            if (ts.traits().priority == Priority::BestEffort) != best_effort {
                return;
            }
            if top_ptr == Some(Arc::as_ptr(ts.task_source())) {
                count += ts.remaining_concurrency().max(1);
            } else {
                count += 1;
            }
        });
        count
    }

    fn desired_num_awake_workers_locked(&self, inner: &Inner) -> usize {
        let best_effort_queued = self.queued_additional_workers(inner, true);
        let workers_for_best_effort = best_effort_queued.min(inner.max_best_effort_tasks).max(inner.num_running_best_effort_tasks);
        let workers_for_foreground = self.queued_additional_workers(inner, false);
        (workers_for_best_effort + workers_for_foreground).min(inner.max_tasks).min(MAX_NUMBER_OF_WORKERS)
    }

    fn create_and_register_worker_locked(&self, inner: &mut Inner) -> WorkerId {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let is_excess = inner.workers.len() >= self.config.initial_max_tasks;
        inner.workers.push(WorkerRecord::new(id, is_excess));
        park_idle(inner, id);
        id
    }

    fn ensure_enough_workers_locked(&self, inner: &mut Inner, executor: &mut CommandsExecutor) {
        let desired = self.desired_num_awake_workers_locked(inner);
        let awake = inner.workers.len() - inner.idle_stack.len();

        if desired > awake {
            let deficit = desired - awake;
            let wake_budget = deficit.min(MAX_WORKERS_WOKEN_PER_CALL);
            let mut woken = 0usize;
            while woken < wake_budget {
                match pop_idle_for_wake(inner) {
                    Some(id) => {
                        executor.schedule_wake_up(id);
                        woken += 1;
                    }
                    None => break,
                }
            }
            if woken == 0 && inner.workers.len() < inner.max_tasks && inner.workers.len() < MAX_NUMBER_OF_WORKERS {
                let id = self.create_and_register_worker_locked(inner);
                pop_idle_for_wake(inner);
                executor.schedule_start(id);
            }
        }

        self.update_max_allowed_sort_key_locked(inner);
        self.maybe_schedule_adjust_max_tasks_locked(inner, executor);
    }

    fn maintain_at_least_one_idle_worker_locked(&self, inner: &mut Inner, executor: &mut CommandsExecutor) {
        if inner.idle_stack.is_empty() && inner.workers.len() < inner.max_tasks && inner.workers.len() < MAX_NUMBER_OF_WORKERS {
            let id = self.create_and_register_worker_locked(inner);
            executor.schedule_start(id);
        }
    }

    /// Looks up a worker's wake event and join cell and actually spawns its
    /// OS thread. Called from [`CommandsExecutor`] with the group lock not
    /// held. Panics on spawn failure, the same policy `ServiceThreadDelayedRunner`
    /// uses for its own service thread.
    pub(super) fn start_worker_thread(&self, id: WorkerId) {
        let (signal, join_cell) = {
            let inner = self.inner.lock().unwrap();
            match find_worker(&inner, id) {
                Some(w) => (w.signal.clone(), w.join.clone()),
                None => return,
            }
        };

        let group = self.self_arc();
        let environment = self.environment.clone();
        let thread_name = format!("{}-{}", self.config.label, id);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker::run_worker_thread(group, id, signal, environment))
            .unwrap_or_else(|err| {
                warn!(group = %self.config.label, worker_id = id, error = %err, "failed to spawn worker thread");
                panic!("failed to spawn worker thread {id}: {err}");
            });
        *join_cell.lock().unwrap() = Some(handle);
    }

    pub(super) fn wake_worker(&self, id: WorkerId) {
        let inner = self.inner.lock().unwrap();
        if let Some(w) = find_worker(&inner, id) {
            w.signal.wake();
        }
    }

    // ---- blocking-scope accounting ---------------------------------------

    pub(super) fn blocking_started(&self, worker_id: WorkerId, kind: super::blocking::BlockingType) {
        let mut executor = CommandsExecutor::new(self);
        let mut inner = self.inner.lock().unwrap();

        let is_best_effort = find_worker(&inner, worker_id).and_then(|w| w.current_priority) == Some(Priority::BestEffort);
        if let Some(w) = find_worker_mut(&mut inner, worker_id) {
            w.blocking_start_time = Some(Instant::now());
        }

        match kind {
            super::blocking::BlockingType::MayBlock => {
                inner.num_unresolved_may_block += 1;
                if is_best_effort {
                    inner.num_unresolved_best_effort_may_block += 1;
                }
                self.maybe_schedule_adjust_max_tasks_locked(&mut inner, &mut executor);
            }
            super::blocking::BlockingType::WillBlock => {
                self.increment_max_tasks_for_worker_locked(&mut inner, worker_id, is_best_effort);
                self.ensure_enough_workers_locked(&mut inner, &mut executor);
            }
        }
    }

    pub(super) fn blocking_type_upgraded(&self, worker_id: WorkerId) {
        let mut executor = CommandsExecutor::new(self);
        let mut inner = self.inner.lock().unwrap();

        let already = find_worker(&inner, worker_id).map(|w| w.incremented_max_tasks_since_blocked).unwrap_or(true);
        if already {
            return;
        }
        let is_best_effort = find_worker(&inner, worker_id).and_then(|w| w.current_priority) == Some(Priority::BestEffort);

        inner.num_unresolved_may_block = inner.num_unresolved_may_block.saturating_sub(1);
        if is_best_effort {
            inner.num_unresolved_best_effort_may_block = inner.num_unresolved_best_effort_may_block.saturating_sub(1);
        }
        self.increment_max_tasks_for_worker_locked(&mut inner, worker_id, is_best_effort);
        self.ensure_enough_workers_locked(&mut inner, &mut executor);
    }

    pub(super) fn blocking_ended(&self, worker_id: WorkerId) {
        let mut inner = self.inner.lock().unwrap();

        let (for_shutdown, since_blocked, since_blocked_be, is_best_effort) = match find_worker(&inner, worker_id) {
            Some(w) => (
                w.incremented_max_tasks_for_shutdown,
                w.incremented_max_tasks_since_blocked,
                w.incremented_max_best_effort_tasks_since_blocked,
                w.current_priority == Some(Priority::BestEffort),
            ),
            None => return,
        };

        if for_shutdown {
            // Nothing to do here; DidProcessTask owns undoing this increment.
        } else if since_blocked {
            inner.max_tasks = inner.max_tasks.saturating_sub(1);
            if since_blocked_be {
                inner.max_best_effort_tasks = inner.max_best_effort_tasks.saturating_sub(1);
            }
        } else {
            inner.num_unresolved_may_block = inner.num_unresolved_may_block.saturating_sub(1);
            if is_best_effort {
                inner.num_unresolved_best_effort_may_block = inner.num_unresolved_best_effort_may_block.saturating_sub(1);
            }
        }

        if let Some(w) = find_worker_mut(&mut inner, worker_id) {
            w.blocking_start_time = None;
            if !for_shutdown {
                // The for-shutdown case leaves these set so `DidProcessTask`
                // can still see `since_blocked` and undo the block-side
                // increment itself; only it owns clearing them in that case.
                w.incremented_max_tasks_since_blocked = false;
                w.incremented_max_best_effort_tasks_since_blocked = false;
            }
        }
    }

    fn increment_max_tasks_for_worker_locked(&self, inner: &mut Inner, worker_id: WorkerId, is_best_effort: bool) {
        inner.max_tasks += 1;
        if is_best_effort {
            inner.max_best_effort_tasks += 1;
        }
        if let Some(w) = find_worker_mut(inner, worker_id) {
            w.incremented_max_tasks_since_blocked = true;
            if is_best_effort {
                w.incremented_max_best_effort_tasks_since_blocked = true;
            }
        }
    }

    fn should_periodically_adjust_max_tasks_locked(&self, inner: &Inner) -> bool {
        inner.num_unresolved_may_block > 0 || inner.num_unresolved_best_effort_may_block > 0
    }

    fn maybe_schedule_adjust_max_tasks_locked(&self, inner: &mut Inner, executor: &mut CommandsExecutor) {
        if !inner.adjust_max_tasks_posted && self.should_periodically_adjust_max_tasks_locked(inner) {
            inner.adjust_max_tasks_posted = true;
            executor.schedule_adjust_max_tasks();
        }
    }

    pub(super) fn schedule_adjust_max_tasks(&self) {
        let group = self.self_arc();
        self.delayed_runner.post_delayed(Box::new(move || group.adjust_max_tasks()), self.config.blocked_workers_poll_period);
    }

    fn maybe_increment_max_tasks_locked(&self, inner: &mut Inner, worker_id: WorkerId) {
        let now = Instant::now();
        let ready = match find_worker(inner, worker_id) {
            Some(w) => match w.blocking_start_time {
                Some(start) => now.duration_since(start) >= self.config.may_block_threshold && !w.incremented_max_tasks_since_blocked,
                None => false,
            },
            None => false,
        };
        if !ready {
            return;
        }
        let is_best_effort = find_worker(inner, worker_id).and_then(|w| w.current_priority) == Some(Priority::BestEffort);
        inner.num_unresolved_may_block = inner.num_unresolved_may_block.saturating_sub(1);
        if is_best_effort {
            inner.num_unresolved_best_effort_may_block = inner.num_unresolved_best_effort_may_block.saturating_sub(1);
        }
        self.increment_max_tasks_for_worker_locked(inner, worker_id, is_best_effort);
    }

    /// Periodic poll, run on the service thread: converts any `MAY_BLOCK`
    /// scope that has been open longer than `may_block_threshold` into a
    /// real `max_tasks` increment, then reschedules itself as long as any
    /// unresolved scope remains.
    fn adjust_max_tasks(&self) {
        let mut executor = CommandsExecutor::new(self);
        let mut inner = self.inner.lock().unwrap();
        inner.adjust_max_tasks_posted = false;

        let worker_ids: Vec<WorkerId> = inner.workers.iter().map(|w| w.id).collect();
        for id in worker_ids {
            self.maybe_increment_max_tasks_locked(&mut inner, id);
        }

        self.ensure_enough_workers_locked(&mut inner, &mut executor);

        if self.should_periodically_adjust_max_tasks_locked(&inner) {
            inner.adjust_max_tasks_posted = true;
            executor.schedule_adjust_max_tasks();
        }
    }

    // ---- shutdown and join -------------------------------------------------

    /// Bumps `max_tasks` for every worker currently running a
    /// `ContinueOnShutdown` task source, so shutdown doesn't starve them of
    /// the capacity they already held.
    pub fn on_shutdown_started(&self) {
        let mut executor = CommandsExecutor::new(self);
        let mut inner = self.inner.lock().unwrap();

        let continuing: Vec<WorkerId> = inner
            .workers
            .iter()
            .filter(|w| w.current_shutdown_behavior == Some(ShutdownBehavior::ContinueOnShutdown))
            .map(|w| w.id)
            .collect();

        for id in continuing {
            let is_best_effort = find_worker(&inner, id).and_then(|w| w.current_priority) == Some(Priority::BestEffort);
            inner.max_tasks += 1;
            if is_best_effort {
                inner.max_best_effort_tasks += 1;
            }
            if let Some(w) = find_worker_mut(&mut inner, id) {
                w.incremented_max_tasks_for_shutdown = true;
            }
        }

        inner.shutdown_started = true;
        self.ensure_enough_workers_locked(&mut inner, &mut executor);
    }

    /// Test-only: wakes every worker for immediate exit and joins all of
    /// their threads. Blocks until every worker thread has actually
    /// returned, so it must never be called from inside a task.
    pub fn join_for_testing(&self) {
        let snapshot: Vec<(Arc<Mutex<Option<thread::JoinHandle<()>>>>, Arc<super::worker::WorkerSignal>)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.join_for_testing_started = true;
            inner.workers.iter().map(|w| (w.join.clone(), w.signal.clone())).collect()
        };

        for (_, signal) in &snapshot {
            signal.mark_for_cleanup();
        }
        for (join, _) in snapshot {
            if let Some(handle) = join.lock().unwrap().take() {
                let _ = handle.join();
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.workers.clear();
        inner.idle_stack.clear();
    }

    /// Drains this group's queue and hands every task source to `other`,
    /// then redirects any further pushes to `other` as well. Used when a
    /// host retires one group in favor of a freshly configured replacement.
    pub fn invalidate_and_handoff_all_task_sources_to_other_thread_group(&self, other: &Arc<ThreadGroup>) {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            inner.replacement_thread_group = Some(Arc::downgrade(other));
            inner.priority_queue.drain_all()
        };
        info!(from = %self.config.label, to = %other.config.label, count = drained.len(), "handing off task sources to replacement group");
        for (ts, _key) in drained {
            other.push_task_source_and_wake_up_workers(ts);
        }
    }
}
