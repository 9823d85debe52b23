//! Error types for the scheduler subsystem.

use thiserror::Error;

/// Errors surfaced by the thread-pool core.
///
/// Ordinary scheduling never fails from the producer's point of view; these
/// variants only reach a caller at `Start` (thread creation) or represent a
/// programmer error that should abort rather than be handled.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to start the first worker thread: {0}")]
    ThreadStartFailed(String),

    #[error("scheduler invariant violated: {0}")]
    InvariantViolation(String),

    #[error("task source was already enqueued by a concurrent racer")]
    QueueRaceLost,

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

impl SchedulerError {
    /// Invariant violations are programmer errors; callers should treat
    /// them as non-recoverable rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// `QueueRaceLost` is not an error from the producer's perspective: a
    /// concurrent worker already did the equivalent work.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::QueueRaceLost)
    }
}
