//! Runtime configuration loading from environment variables.
//!
//! Tunables that are reasonable to vary per deployment are loaded from
//! `GG_SCHED_*` environment variables at process start; structural
//! constants of the algorithm (the 256-worker ceiling, the two-per-call
//! wake budget, the 10%-padding factor on the reclaim sleep timeout) are
//! not configurable and stay as constants in `scheduler::group`.
//!
//! Invalid values fall back to the documented default without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_SCHED_FOREGROUND_MAX_TASKS` | number of CPUs | Foreground group worker ceiling |
//! | `GG_SCHED_FOREGROUND_MAX_BEST_EFFORT_TASKS` | half of the above | Foreground best-effort concurrency ceiling |
//! | `GG_SCHED_BACKGROUND_MAX_TASKS` | half the CPU count | Background group worker ceiling |
//! | `GG_SCHED_BACKGROUND_MAX_BEST_EFFORT_TASKS` | same as background max tasks | Background best-effort concurrency ceiling |
//! | `GG_SCHED_SUGGESTED_RECLAIM_TIME_MS` | 30000 | Idle time before an excess worker is reclaimed |
//! | `GG_SCHED_FOREGROUND_MAY_BLOCK_THRESHOLD_MS` | 1000 | Foreground `MAY_BLOCK` poll threshold |
//! | `GG_SCHED_BACKGROUND_MAY_BLOCK_THRESHOLD_MS` | 10000 | Background `MAY_BLOCK` poll threshold |
//! | `GG_SCHED_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `GG_SCHED_LOG_LEVEL` | `info` | `tracing_subscriber::EnvFilter` directive |

use std::time::Duration;

use crate::scheduler::ThreadPoolConfig;
use crate::telemetry::{LogConfig, LogFormat};

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn load_log_format() -> LogFormat {
    match std::env::var("GG_SCHED_LOG_FORMAT").as_deref() {
        Ok("pretty") => LogFormat::Pretty,
        _ => LogFormat::Json,
    }
}

/// Load the scheduler's `ThreadPoolConfig` from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load_thread_pool_config() -> ThreadPoolConfig {
    let defaults = ThreadPoolConfig::default();

    let foreground_max_tasks = parse_usize("GG_SCHED_FOREGROUND_MAX_TASKS", defaults.foreground_max_tasks).max(1);
    let foreground_max_best_effort_tasks = parse_usize(
        "GG_SCHED_FOREGROUND_MAX_BEST_EFFORT_TASKS",
        defaults.foreground_max_best_effort_tasks,
    )
    .max(1)
    .min(foreground_max_tasks);
    let background_max_tasks = parse_usize("GG_SCHED_BACKGROUND_MAX_TASKS", defaults.background_max_tasks).max(1);
    let background_max_best_effort_tasks = parse_usize(
        "GG_SCHED_BACKGROUND_MAX_BEST_EFFORT_TASKS",
        defaults.background_max_best_effort_tasks,
    )
    .max(1)
    .min(background_max_tasks);
    let suggested_reclaim_time_ms = parse_u64(
        "GG_SCHED_SUGGESTED_RECLAIM_TIME_MS",
        defaults.suggested_reclaim_time.as_millis() as u64,
    )
    .max(1);
    let foreground_may_block_threshold_ms = parse_u64(
        "GG_SCHED_FOREGROUND_MAY_BLOCK_THRESHOLD_MS",
        defaults.foreground_may_block_threshold.as_millis() as u64,
    )
    .max(1);
    let background_may_block_threshold_ms = parse_u64(
        "GG_SCHED_BACKGROUND_MAY_BLOCK_THRESHOLD_MS",
        defaults.background_may_block_threshold.as_millis() as u64,
    )
    .max(1);

    ThreadPoolConfig {
        foreground_max_tasks,
        foreground_max_best_effort_tasks,
        background_max_tasks,
        background_max_best_effort_tasks,
        suggested_reclaim_time: Duration::from_millis(suggested_reclaim_time_ms),
        foreground_may_block_threshold: Duration::from_millis(foreground_may_block_threshold_ms),
        background_may_block_threshold: Duration::from_millis(background_may_block_threshold_ms),
    }
}

/// Load logging configuration from environment variables.
pub fn load_log_config() -> LogConfig {
    let level = std::env::var("GG_SCHED_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    LogConfig { format: load_log_format(), level, output_path: None }
}
