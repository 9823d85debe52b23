//! End-to-end scenarios for the blocking-aware worker pool, run against
//! real OS threads with real (short) sleeps rather than a mocked clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gg_core::scheduler::{
    AllowAllTaskTracker, BlockingType, NoopThreadEnvironment, Priority, ScopedBlockingCall,
    ServiceThreadDelayedRunner, ShutdownBehavior, TaskSource, TaskTracker, TaskTraits, ThreadEnvironment,
    ThreadGroup, ThreadGroupConfig, TwoGroupSelector,
};

fn env() -> Arc<dyn ThreadEnvironment> {
    Arc::new(NoopThreadEnvironment)
}

fn tracker() -> Arc<dyn TaskTracker> {
    Arc::new(AllowAllTaskTracker)
}

fn spin_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn traits(priority: Priority) -> TaskTraits {
    TaskTraits { priority, shutdown_behavior: ShutdownBehavior::SkipOnShutdown, max_concurrency: 1 }
}

// Scenario 1: steady-state dispatch.
#[test]
fn steady_state_dispatch_uses_exactly_max_tasks_workers() {
    let config = ThreadGroupConfig::foreground("fg", 4, 2);
    let delayed = Arc::new(ServiceThreadDelayedRunner::new());
    let group = ThreadGroup::start(config, tracker(), delayed.clone(), env());

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let completed = completed.clone();
        let ts = TaskSource::new(
            traits(Priority::UserVisible),
            vec![Box::new(move || {
                std::thread::sleep(Duration::from_millis(10));
                completed.fetch_add(1, Ordering::SeqCst);
            })],
        );
        group.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts).unwrap());
    }

    assert!(spin_until(Duration::from_secs(2), || completed.load(Ordering::SeqCst) == 8));
    assert!(group.worker_count() <= 4);

    group.join_for_testing();
    delayed.shutdown();
}

// Scenario 2: best-effort saturation alongside a higher-priority source.
#[test]
fn best_effort_saturation_runs_one_at_a_time() {
    let config = ThreadGroupConfig::foreground("fg", 4, 1);
    let delayed = Arc::new(ServiceThreadDelayedRunner::new());
    let group = ThreadGroup::start(config, tracker(), delayed.clone(), env());

    let concurrent_be = Arc::new(AtomicUsize::new(0));
    let max_concurrent_be = Arc::new(AtomicUsize::new(0));
    let urgent_done = Arc::new(AtomicUsize::new(0));
    let urgent_done_at = Arc::new(Mutex::new(None::<Instant>));
    let be_done_at = Arc::new(Mutex::new(Vec::<Instant>::new()));

    for _ in 0..3 {
        let concurrent_be = concurrent_be.clone();
        let max_concurrent_be = max_concurrent_be.clone();
        let be_done_at = be_done_at.clone();
        let ts = TaskSource::new(
            traits(Priority::BestEffort),
            vec![Box::new(move || {
                let now = concurrent_be.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent_be.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(40));
                concurrent_be.fetch_sub(1, Ordering::SeqCst);
                be_done_at.lock().unwrap().push(Instant::now());
            })],
        );
        group.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts).unwrap());
    }

    let urgent_done2 = urgent_done.clone();
    let urgent_done_at2 = urgent_done_at.clone();
    let urgent = TaskSource::new(
        traits(Priority::UserBlocking),
        vec![Box::new(move || {
            urgent_done2.fetch_add(1, Ordering::SeqCst);
            *urgent_done_at2.lock().unwrap() = Some(Instant::now());
        })],
    );
    group.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(urgent).unwrap());

    assert!(spin_until(Duration::from_secs(2), || be_done_at.lock().unwrap().len() == 3));
    assert_eq!(urgent_done.load(Ordering::SeqCst), 1);
    assert_eq!(max_concurrent_be.load(Ordering::SeqCst), 1, "at most one best-effort task should run at once");

    let urgent_at = urgent_done_at.lock().unwrap().unwrap();
    let earliest_be = *be_done_at.lock().unwrap().iter().min().unwrap();
    assert!(urgent_at < earliest_be, "the user-blocking source should finish before any best-effort source");

    group.join_for_testing();
    delayed.shutdown();
}

// Scenario 3: a MAY_BLOCK scope left open past the threshold is
// eventually compensated by the periodic poll.
#[test]
fn may_block_poll_compensates_after_threshold() {
    let mut config = ThreadGroupConfig::foreground("fg", 2, 2);
    config.may_block_threshold = Duration::from_millis(50);
    config.blocked_workers_poll_period = Duration::from_millis(20);
    let delayed = Arc::new(ServiceThreadDelayedRunner::new());
    let group = ThreadGroup::start(config, tracker(), delayed.clone(), env());

    let completed = Arc::new(AtomicUsize::new(0));
    let max_tasks_during_block = Arc::new(AtomicUsize::new(0));

    // Source #1: enters MAY_BLOCK and sleeps past the threshold.
    {
        let completed = completed.clone();
        let ts = TaskSource::new(
            traits(Priority::UserVisible),
            vec![Box::new(move || {
                let call = ScopedBlockingCall::new(BlockingType::MayBlock);
                std::thread::sleep(Duration::from_millis(200));
                drop(call);
                completed.fetch_add(1, Ordering::SeqCst);
            })],
        );
        group.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts).unwrap());
    }
    // Two more sources competing for the (initially) 2-worker budget.
    for _ in 0..2 {
        let completed = completed.clone();
        let ts = TaskSource::new(
            traits(Priority::UserVisible),
            vec![Box::new(move || {
                std::thread::sleep(Duration::from_millis(30));
                completed.fetch_add(1, Ordering::SeqCst);
            })],
        );
        group.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts).unwrap());
    }

    // Poll between t=50ms and t=200ms: max_tasks should have grown to 3.
    std::thread::sleep(Duration::from_millis(120));
    max_tasks_during_block.store(group.max_tasks(), Ordering::SeqCst);
    assert_eq!(max_tasks_during_block.load(Ordering::SeqCst), 3);

    assert!(spin_until(Duration::from_secs(2), || completed.load(Ordering::SeqCst) == 3));
    assert!(spin_until(Duration::from_secs(1), || group.max_tasks() == 2), "max_tasks should settle back to 2");

    group.join_for_testing();
    delayed.shutdown();
}

// Scenario 4: WILL_BLOCK compensates before the call returns.
#[test]
fn will_block_creates_worker_immediately() {
    let config = ThreadGroupConfig::foreground("fg", 1, 1);
    let delayed = Arc::new(ServiceThreadDelayedRunner::new());
    let group = ThreadGroup::start(config, tracker(), delayed.clone(), env());

    let second_started = Arc::new(AtomicUsize::new(0));
    let first_entered_block = Arc::new((Mutex::new(false), std::sync::Condvar::new()));

    {
        let first_entered_block = first_entered_block.clone();
        let ts = TaskSource::new(
            traits(Priority::UserVisible),
            vec![Box::new(move || {
                let _call = ScopedBlockingCall::new(BlockingType::WillBlock);
                {
                    let (lock, cvar) = &*first_entered_block;
                    *lock.lock().unwrap() = true;
                    cvar.notify_all();
                }
                std::thread::sleep(Duration::from_millis(100));
            })],
        );
        group.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts).unwrap());
    }

    {
        let (lock, cvar) = &*first_entered_block;
        let mut entered = lock.lock().unwrap();
        while !*entered {
            entered = cvar.wait_timeout(entered, Duration::from_secs(1)).unwrap().0;
        }
    }

    let second_started2 = second_started.clone();
    let ts2 = TaskSource::new(
        traits(Priority::UserVisible),
        vec![Box::new(move || {
            second_started2.fetch_add(1, Ordering::SeqCst);
        })],
    );
    group.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts2).unwrap());

    assert!(spin_until(Duration::from_secs(1), || second_started.load(Ordering::SeqCst) == 1));
    assert!(group.max_tasks() >= 2);

    group.join_for_testing();
    delayed.shutdown();
}

// Scenario 5: excess workers are reclaimed after the idle timeout, and
// steady posting at the reclaim rate does not cause create/reclaim churn.
#[test]
fn excess_workers_reclaim_after_idle_timeout() {
    let mut config = ThreadGroupConfig::foreground("fg", 4, 4);
    config.suggested_reclaim_time = Duration::from_millis(100);
    let delayed = Arc::new(ServiceThreadDelayedRunner::new());
    let group = ThreadGroup::start(config, tracker(), delayed.clone(), env());

    for _ in 0..4 {
        let ts = TaskSource::new(traits(Priority::UserVisible), vec![Box::new(|| {})]);
        group.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts).unwrap());
    }

    assert!(spin_until(Duration::from_secs(1), || group.worker_count() >= 2));
    // Reclaim runs on each worker's own sleep-timeout wakeup; give it
    // suggested_reclaim_time plus the 10% sleep-extension plus scheduling slack.
    assert!(spin_until(Duration::from_millis(400), || group.worker_count() <= 1));

    group.join_for_testing();
    delayed.shutdown();
}

// Scenario 6: a task source handed to a background-routing group selector
// moves groups on its next re-enqueue.
#[test]
fn reenqueue_routes_to_selector_destination_group() {
    let fg_config = ThreadGroupConfig::foreground("fg", 2, 2);
    let bg_config = ThreadGroupConfig::background("bg", 2, 2);
    let delayed = Arc::new(ServiceThreadDelayedRunner::new());
    let fg = ThreadGroup::start(fg_config, tracker(), delayed.clone(), env());
    let bg = ThreadGroup::start(bg_config, tracker(), delayed.clone(), env());

    let selector = Arc::new(TwoGroupSelector { foreground: fg.clone(), background: bg.clone() });
    fg.set_group_selector(Arc::downgrade(&selector) as std::sync::Weak<dyn gg_core::scheduler::GroupSelector>);
    bg.set_group_selector(Arc::downgrade(&selector) as std::sync::Weak<dyn gg_core::scheduler::GroupSelector>);

    let completed = Arc::new(AtomicUsize::new(0));
    let completed2 = completed.clone();
    // A best-effort source pushed directly into `fg`: the selector would
    // have placed it in `bg`, so its first re-enqueue after running a task
    // should migrate it there.
    let ts = TaskSource::new(
        traits(Priority::BestEffort),
        vec![
            Box::new(|| std::thread::sleep(Duration::from_millis(20))),
            Box::new(move || {
                completed2.fetch_add(1, Ordering::SeqCst);
            }),
        ],
    );
    let ts_handle = ts.clone();
    fg.push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts).unwrap());

    assert!(spin_until(Duration::from_secs(2), || completed.load(Ordering::SeqCst) == 1));
    assert_eq!(ts_handle.worker_count(), 0);
    assert_eq!(fg.queued_task_source_count(), 0, "the source must not remain queued on the origin group");

    fg.join_for_testing();
    bg.join_for_testing();
    delayed.shutdown();
}
