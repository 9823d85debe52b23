//! Per-thread hook invoked by scoped blocking calls inside user tasks, and
//! the thread-local "current worker" it and `ShouldYield` read from.

use std::cell::RefCell;
use std::sync::Arc;

use super::priority::SortKey;
use super::worker::WorkerId;
use super::ThreadGroup;

/// `kind` argument to a scoped blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingType {
    /// The task might perform a blocking operation; the pool waits
    /// `may_block_threshold` before compensating.
    MayBlock,
    /// The task is about to perform a blocking operation; the pool
    /// compensates immediately.
    WillBlock,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<(Arc<ThreadGroup>, WorkerId)>> = RefCell::new(None);
}

/// Set exactly once per worker thread, in `OnMainEntry`.
pub(super) fn bind_current_worker(group: Arc<ThreadGroup>, id: WorkerId) {
    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = Some((group, id)));
}

/// Cleared in `OnMainExit`.
pub(super) fn clear_current_worker() {
    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = None);
}

fn with_current_worker<R>(f: impl FnOnce(&Arc<ThreadGroup>, WorkerId) -> R) -> Option<R> {
    CURRENT_WORKER.with(|cell| cell.borrow().as_ref().map(|(group, id)| f(group, *id)))
}

/// A lexical scope declared by a running task asserting that it may, or
/// will, perform a blocking operation. Constructing one on a thread that
/// is not a pool worker (e.g. in a unit test driving the algorithm
/// directly) is a safe no-op.
pub struct ScopedBlockingCall {
    kind: BlockingType,
    active: bool,
}

impl ScopedBlockingCall {
    pub fn new(kind: BlockingType) -> Self {
        let active = with_current_worker(|group, id| group.blocking_started(id, kind)).is_some();
        Self { kind, active }
    }

    /// Upgrades a `MayBlock` scope to `WillBlock`. No-op if already
    /// `WillBlock` or if not running on a pool worker thread.
    pub fn upgrade_to_will_block(&mut self) {
        if self.kind == BlockingType::WillBlock {
            return;
        }
        self.kind = BlockingType::WillBlock;
        if self.active {
            with_current_worker(|group, id| group.blocking_type_upgraded(id));
        }
    }
}

impl Drop for ScopedBlockingCall {
    fn drop(&mut self) {
        if self.active {
            with_current_worker(|group, id| group.blocking_ended(id));
        }
    }
}

/// `true` when a higher-priority task source is queued than the one
/// backing `sort_key`, i.e. this task should voluntarily yield the
/// worker. Never blocks; reads `max_allowed_sort_key` with relaxed
/// atomics. A no-op (`false`) when called off a pool worker thread.
pub fn should_yield(sort_key: SortKey) -> bool {
    with_current_worker(|group, _id| group.should_yield(sort_key)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_blocking_call_off_worker_thread_is_inert() {
        let mut call = ScopedBlockingCall::new(BlockingType::MayBlock);
        call.upgrade_to_will_block();
        drop(call);
    }

    #[test]
    fn should_yield_off_worker_thread_is_false() {
        assert!(!should_yield(SortKey::YIELD));
    }
}
