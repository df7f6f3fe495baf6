//! Thread-cancellation primitives for worker threads.
//!
//! Cancellation is cooperative at the instruction level but forceful at the
//! library level: posting a cancel sets a flag, and designated *cancellation
//! points* (the worker's condition-variable wait, [`TaskContext::should_stop`]
//! with `safe_cancel_point = true`, and [`TaskContext::sleep`]) observe the
//! flag and unwind the thread. Unwinding runs all drop glue on the way out,
//! so scoped locks and other guards are released. In *asynchronous* mode
//! every library call the task makes becomes a cancellation point; code that
//! never calls back into the library cannot be cancelled at all.
//!
//! [`TaskContext::should_stop`]: crate::TaskContext::should_stop
//! [`TaskContext::sleep`]: crate::TaskContext::sleep

use std::{
    panic,
    sync::atomic::{AtomicBool, Ordering},
};

/// Panic payload used to unwind a worker thread at a cancellation point.
///
/// The worker run loop recognizes this payload and treats the unwind as an
/// orderly (if forced) exit rather than a task panic. Tasks that catch
/// unwinds themselves must propagate it for cancellation to work.
pub(crate) struct CancelUnwind;

/// Per-worker cancellation state.
///
/// Both flags are set-only for the lifetime of the worker, so lock-free
/// reads are safe: a stale read produces a false negative that corrects
/// itself at the next cancellation point.
#[derive(Debug)]
pub(crate) struct CancelState {
    pending: AtomicBool,
    asynchronous: AtomicBool,
}

impl CancelState {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            asynchronous: AtomicBool::new(false),
        }
    }

    /// Posts a cancellation request. The request takes effect at the
    /// target thread's next cancellation point.
    pub(crate) fn post(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Widens the set of cancellation points to every subsequent library
    /// call made on the target thread.
    pub(crate) fn set_asynchronous(&self) {
        self.asynchronous.store(true, Ordering::Release);
    }

    /// A deferred cancellation point: unwinds the calling thread iff a
    /// cancel has been posted.
    pub(crate) fn test(&self) {
        if self.pending.load(Ordering::Acquire) {
            // resume_unwind starts the unwind without invoking the panic
            // hook, so forced shutdown does not spam stderr.
            panic::resume_unwind(Box::new(CancelUnwind));
        }
    }

    /// A cancellation point only in asynchronous mode.
    pub(crate) fn test_if_asynchronous(&self) {
        if self.asynchronous.load(Ordering::Acquire) {
            self.test();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;

    #[test]
    fn test_without_pending_cancel_returns() {
        let state = CancelState::new();
        state.test();
        state.test_if_asynchronous();
    }

    #[test]
    fn test_with_pending_cancel_unwinds_with_marker_payload() {
        let state = CancelState::new();
        state.post();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| state.test()));

        let payload = outcome.expect_err("pending cancel should unwind");
        assert!(payload.downcast_ref::<CancelUnwind>().is_some());
    }

    #[test]
    fn pending_cancel_is_deferred_outside_asynchronous_mode() {
        let state = CancelState::new();
        state.post();
        state.test_if_asynchronous();
    }

    #[test]
    fn pending_cancel_fires_at_relaxed_points_in_asynchronous_mode() {
        let state = CancelState::new();
        state.post();
        state.set_asynchronous();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| state.test_if_asynchronous()));

        assert!(outcome.is_err());
    }
}
