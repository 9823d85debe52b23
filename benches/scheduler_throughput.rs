//! Scheduler throughput benchmarks.
//!
//! Measures priority-queue push/pop cost in isolation and steady-state
//! dispatch throughput through a real `ThreadGroup` with live worker
//! threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gg_core::scheduler::{
    AllowAllTaskTracker, NoopThreadEnvironment, Priority, PriorityQueue, RegisteredTaskSource,
    ServiceThreadDelayedRunner, ShutdownBehavior, TaskSource, TaskTracker, TaskTraits, ThreadGroup, ThreadGroupConfig,
};

fn traits(priority: Priority) -> TaskTraits {
    TaskTraits { priority, shutdown_behavior: ShutdownBehavior::SkipOnShutdown, max_concurrency: 1 }
}

fn registered(priority: Priority) -> RegisteredTaskSource {
    RegisteredTaskSource::new(TaskSource::new(traits(priority), vec![]))
}

fn bench_priority_queue_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_queue_push");

    for (name, queue_size) in [("empty", 0), ("half_full", 50), ("near_full", 90)] {
        let mut queue = PriorityQueue::new();
        for i in 0..queue_size {
            let ts = registered(Priority::UserVisible);
            let key = ts.sort_key(i as u64);
            queue.push(ts, key);
        }

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("push", name), |b| {
            let mut tiebreaker = queue_size as u64;
            b.iter(|| {
                let ts = registered(Priority::UserVisible);
                let key = ts.sort_key(black_box(tiebreaker));
                queue.push(ts, key);
                tiebreaker += 1;
                let _ = queue.pop_top();
            })
        });
    }

    group.finish();
}

fn bench_priority_queue_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_queue_pop");

    for (name, batch_size) in [("single", 1), ("batch_4", 4), ("batch_8", 8)] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(BenchmarkId::new("batch", name), |b| {
            b.iter(|| {
                let mut queue = PriorityQueue::new();
                for i in 0..batch_size {
                    let ts = registered(Priority::UserVisible);
                    let key = ts.sort_key(i as u64);
                    queue.push(ts, key);
                }
                for _ in 0..batch_size {
                    let _ = black_box(queue.pop_top());
                }
            })
        });
    }

    group.finish();
}

fn bench_priority_ordering(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_ordering");

    group.throughput(Throughput::Elements(10));
    group.bench_function("mixed_priority_10", |b| {
        b.iter(|| {
            let mut queue = PriorityQueue::new();
            for i in 0..10u64 {
                let priority = match i % 3 {
                    0 => Priority::UserBlocking,
                    1 => Priority::UserVisible,
                    _ => Priority::BestEffort,
                };
                let ts = registered(priority);
                let key = ts.sort_key(i);
                queue.push(ts, key);
            }
            for _ in 0..10 {
                let _ = black_box(queue.pop_top());
            }
        })
    });

    group.finish();
}

fn bench_queue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_throughput");

    for count in [100, 500, 1000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::new("sources", count), |b| {
            b.iter(|| {
                let mut queue = PriorityQueue::new();
                for i in 0..count {
                    let ts = registered(Priority::UserVisible);
                    let key = ts.sort_key(i as u64);
                    queue.push(ts, key);
                }
                while queue.pop_top().is_some() {}
            })
        });
    }

    group.finish();
}

/// End-to-end dispatch throughput: how many trivial single-task sources a
/// 4-worker foreground group can drain per second. Unlike the queue-only
/// benchmarks above, this spins up real OS threads, so absolute numbers are
/// dominated by wake latency rather than the priority queue itself.
fn bench_group_dispatch_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_dispatch_throughput");
    group.sample_size(20);

    for count in [100, 500] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::new("sources", count), |b| {
            b.iter(|| {
                let config = ThreadGroupConfig::foreground("bench", 4, 2);
                let delayed = Arc::new(ServiceThreadDelayedRunner::new());
                let thread_group = ThreadGroup::start(
                    config,
                    Arc::new(AllowAllTaskTracker),
                    delayed.clone(),
                    Arc::new(NoopThreadEnvironment),
                );

                let completed = Arc::new(AtomicUsize::new(0));
                for _ in 0..count {
                    let completed = completed.clone();
                    let ts = TaskSource::new(
                        traits(Priority::UserVisible),
                        vec![Box::new(move || {
                            completed.fetch_add(1, Ordering::Relaxed);
                        })],
                    );
                    thread_group
                        .push_task_source_and_wake_up_workers(AllowAllTaskTracker.register_task_source(ts).unwrap());
                }

                while completed.load(Ordering::Relaxed) < count {
                    std::thread::sleep(Duration::from_micros(200));
                }

                thread_group.join_for_testing();
                delayed.shutdown();
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_priority_queue_push,
    bench_priority_queue_pop,
    bench_priority_ordering,
    bench_queue_throughput,
    bench_group_dispatch_throughput
);
criterion_main!(benches);
