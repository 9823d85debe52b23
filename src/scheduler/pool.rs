//! `ThreadPool`: the top-level entry point wiring a foreground and a
//! background [`ThreadGroup`] together with the default capability
//! implementations, giving the crate a usable object without a host
//! process supplying its own `TaskTracker`/`DelayedRunner`/`GroupSelector`.

use std::sync::Arc;
use std::time::Duration;

use super::capabilities::{
    AllowAllTaskTracker, NoopThreadEnvironment, ServiceThreadDelayedRunner, TaskTracker,
    ThreadEnvironment, TwoGroupSelector,
};
use super::group::{ThreadGroup, ThreadGroupConfig};
use super::priority::{Priority, ShutdownBehavior, TaskTraits};
use super::task_source::{Task, TaskSource};

/// Tunables for [`ThreadPool::new`]. `Default` scales foreground/background
/// sizes off the visible CPU count; foreground gets the majority share
/// since it serves user-visible and user-blocking work.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub foreground_max_tasks: usize,
    pub foreground_max_best_effort_tasks: usize,
    pub background_max_tasks: usize,
    pub background_max_best_effort_tasks: usize,
    pub suggested_reclaim_time: Duration,
    pub foreground_may_block_threshold: Duration,
    pub background_may_block_threshold: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let foreground_max_tasks = cores.max(1);
        let background_max_tasks = (cores / 2).max(1);
        Self {
            foreground_max_tasks,
            foreground_max_best_effort_tasks: (foreground_max_tasks / 2).max(1),
            background_max_tasks,
            background_max_best_effort_tasks: background_max_tasks,
            suggested_reclaim_time: Duration::from_secs(30),
            foreground_may_block_threshold: Duration::from_millis(1000),
            background_may_block_threshold: Duration::from_secs(10),
        }
    }
}

/// The process-wide thread pool: two [`ThreadGroup`]s (foreground,
/// background) behind a small `spawn`/`shutdown` surface. Most callers
/// want this rather than constructing `ThreadGroup`s directly; a host that
/// already has its own task-source admission control can use
/// [`ThreadGroup::start`] on its own instead (see the crate docs).
pub struct ThreadPool {
    foreground: Arc<ThreadGroup>,
    background: Arc<ThreadGroup>,
    task_tracker: Arc<dyn TaskTracker>,
    delayed_runner: Arc<ServiceThreadDelayedRunner>,
    // Each `ThreadGroup` only holds a `Weak` reference to the selector (see
    // `set_group_selector`), so the pool keeps the one strong handle alive.
    _selector: Arc<TwoGroupSelector>,
}

impl ThreadPool {
    pub fn new(config: ThreadPoolConfig) -> Self {
        Self::with_task_tracker(config, Arc::new(AllowAllTaskTracker))
    }

    /// Same as [`ThreadPool::new`] but with a caller-supplied admission
    /// control policy instead of the always-admitting default.
    pub fn with_task_tracker(config: ThreadPoolConfig, task_tracker: Arc<dyn TaskTracker>) -> Self {
        let delayed_runner = Arc::new(ServiceThreadDelayedRunner::new());
        let environment: Arc<dyn ThreadEnvironment> = Arc::new(NoopThreadEnvironment);

        let mut fg_config = ThreadGroupConfig::foreground(
            "foreground",
            config.foreground_max_tasks,
            config.foreground_max_best_effort_tasks,
        );
        fg_config.suggested_reclaim_time = config.suggested_reclaim_time;
        fg_config.may_block_threshold = config.foreground_may_block_threshold;
        let mut bg_config = ThreadGroupConfig::background(
            "background",
            config.background_max_tasks,
            config.background_max_best_effort_tasks,
        );
        bg_config.suggested_reclaim_time = config.suggested_reclaim_time;
        bg_config.may_block_threshold = config.background_may_block_threshold;

        let foreground = ThreadGroup::start(fg_config, task_tracker.clone(), delayed_runner.clone(), environment.clone());
        let background = ThreadGroup::start(bg_config, task_tracker.clone(), delayed_runner.clone(), environment);

        let selector = Arc::new(TwoGroupSelector { foreground: foreground.clone(), background: background.clone() });
        let weak_selector = Arc::downgrade(&selector) as std::sync::Weak<dyn super::capabilities::GroupSelector>;
        foreground.set_group_selector(weak_selector.clone());
        background.set_group_selector(weak_selector);

        Self { foreground, background, task_tracker, delayed_runner, _selector: selector }
    }

    /// Registers and posts `task` with default traits (`UserVisible`,
    /// `SkipOnShutdown`, `max_concurrency = 1`), wrapped in its own
    /// single-task `TaskSource`.
    pub fn spawn(&self, task: Task) {
        self.spawn_with_traits(TaskTraits::default(), task);
    }

    /// Registers and posts `task` under the given traits. The traits'
    /// priority decides whether it lands in the foreground or background
    /// group.
    pub fn spawn_with_traits(&self, traits: TaskTraits, task: Task) {
        let ts = TaskSource::new(traits, vec![task]);
        self.post_task_source(traits, ts);
    }

    /// Registers and posts an already-built multi-task `TaskSource`, e.g. a
    /// long-lived sequence a caller keeps feeding more work via
    /// `TaskSource::push_task`.
    pub fn post_task_source(&self, traits: TaskTraits, task_source: Arc<TaskSource>) {
        let Some(registered) = self.task_tracker.register_task_source(task_source) else {
            return;
        };
        let group = if traits.priority == Priority::BestEffort { &self.background } else { &self.foreground };
        group.push_task_source_and_wake_up_workers(registered);
    }

    pub fn foreground(&self) -> &Arc<ThreadGroup> {
        &self.foreground
    }

    pub fn background(&self) -> &Arc<ThreadGroup> {
        &self.background
    }

    /// Notifies both groups that shutdown has started, bumping `max_tasks`
    /// for any worker currently running a `ContinueOnShutdown` task source.
    pub fn notify_shutdown_started(&self) {
        self.foreground.on_shutdown_started();
        self.background.on_shutdown_started();
    }

    /// Test-only: blocks until every worker thread on both groups has
    /// joined, then stops the service thread.
    pub fn join_for_testing(&self) {
        self.foreground.join_for_testing();
        self.background.join_for_testing();
        self.delayed_runner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn small_pool() -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig {
            foreground_max_tasks: 4,
            foreground_max_best_effort_tasks: 2,
            background_max_tasks: 2,
            background_max_best_effort_tasks: 2,
            suggested_reclaim_time: Duration::from_millis(100),
            foreground_may_block_threshold: Duration::from_millis(1000),
            background_may_block_threshold: Duration::from_secs(10),
        })
    }

    #[test]
    fn spawn_runs_default_traits_task_on_foreground() {
        let pool = small_pool();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        pool.spawn(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..200 {
            if ran.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.join_for_testing();
    }

    #[test]
    fn spawn_with_best_effort_traits_runs_on_background() {
        let pool = small_pool();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        pool.spawn_with_traits(
            TaskTraits { priority: Priority::BestEffort, shutdown_behavior: ShutdownBehavior::SkipOnShutdown, max_concurrency: 1 },
            Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        for _ in 0..200 {
            if ran.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(pool.background().worker_count() >= 1);
        pool.join_for_testing();
    }

    #[test]
    fn join_for_testing_leaves_no_workers() {
        let pool = small_pool();
        pool.spawn(Box::new(|| {}));
        std::thread::sleep(Duration::from_millis(50));
        pool.join_for_testing();
        assert_eq!(pool.foreground().worker_count(), 0);
        assert_eq!(pool.background().worker_count(), 0);
    }
}
