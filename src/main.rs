//! Scheduler demo entry point.
//!
//! Starts the pool from `GG_SCHED_*` environment variables and parks the
//! main thread; worker threads keep servicing posted task sources until
//! the process receives a termination signal. A real host would build its
//! own task-posting surface on top of this; this binary exists to prove
//! the crate links and starts cleanly, not as a product surface.

fn main() {
    let pool = match gg_core::init_from_env() {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("failed to start scheduler: {err}");
            std::process::exit(1);
        }
    };

    tracing::info!("scheduler started");
    // A host embedding this crate would call `pool.spawn(...)` here as
    // work arrives. Parking keeps the process (and `pool`) alive so the
    // worker threads have something to serve.
    let _pool = pool;
    loop {
        std::thread::park();
    }
}
