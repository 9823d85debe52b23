//! A blocking-aware worker-pool scheduler.
//!
//! A small number of OS threads shared across a priority-ordered queue of
//! task sources, grown and shrunk around tasks that perform blocking I/O
//! so CPU-bound work elsewhere in the process keeps making progress.
//!
//! [`scheduler::ThreadPool`] is the entry point most callers want. See its
//! docs for the full design.

pub mod config;
pub mod scheduler;
pub mod telemetry;

use std::sync::Arc;

use scheduler::ThreadPool;
use telemetry::LogError;

/// Starts logging and builds a [`ThreadPool`] sized from `GG_SCHED_*`
/// environment variables. Convenience wrapper around
/// [`config::load_thread_pool_config`] + [`ThreadPool::new`] for binaries
/// that just want the default standalone configuration.
pub fn init_from_env() -> Result<Arc<ThreadPool>, LogError> {
    telemetry::init_logging(&config::load_log_config())?;
    let pool_config = config::load_thread_pool_config();
    Ok(Arc::new(ThreadPool::new(pool_config)))
}
