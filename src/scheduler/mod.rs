//! Blocking-aware worker-pool scheduler.
//!
//! A small number of OS threads ("workers"), shared across a priority
//! ordered queue of task sources, that grow and shrink their count around
//! tasks that perform blocking I/O so CPU-bound work elsewhere in the
//! process keeps making progress.
//!
//! [`ThreadPool`] is the entry point most callers want: it wires together
//! a foreground and a background [`ThreadGroup`], the default capability
//! implementations, and exposes `spawn`/`spawn_with_traits`/`shutdown`.
//! Callers that need a single group directly (e.g. to embed in a host
//! that already has its own task-source registration and admission
//! control) can use [`ThreadGroup`] on its own instead.

mod blocking;
mod capabilities;
mod errors;
mod executor;
mod group;
mod pool;
mod priority;
mod priority_queue;
mod task_source;
mod worker;

pub use blocking::{should_yield, BlockingType, ScopedBlockingCall};
pub use capabilities::{
    AllowAllTaskTracker, DelayedRunner, GroupSelector, NoopThreadEnvironment, ServiceThreadDelayedRunner,
    TaskTracker, ThreadEnvironment, TwoGroupSelector, WorkerEnvironment,
};
pub use errors::SchedulerError;
pub use group::{ThreadGroup, ThreadGroupConfig, MAX_NUMBER_OF_WORKERS};
pub use pool::{ThreadPool, ThreadPoolConfig};
pub use priority::{Priority, ShutdownBehavior, SortKey, TaskTraits, YieldKey};
pub use priority_queue::PriorityQueue;
pub use task_source::{RegisteredTaskSource, Task, TaskSource};
