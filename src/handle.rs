//! Cancellable, idempotent handle returned for one logical request.

use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A cancellable token handed back to the caller of
/// [`crate::manager::Manager::load_image`] or
/// [`crate::downloader::Downloader::download`].
///
/// Cancellation is cooperative: it guarantees no further progress or
/// completion callbacks fire for this subscriber, but does not guarantee
/// the underlying transfer stops immediately if other subscribers still
/// share it. `cancel()` is safe to call more than once and safe to call
/// after the operation has already completed.
#[derive(Clone)]
pub struct OperationHandle {
    cancelled: Arc<AtomicBool>,
    on_cancel: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl OperationHandle {
    /// Creates a handle that runs `on_cancel` exactly once, the first time
    /// `cancel()` is called.
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            on_cancel: Arc::new(Mutex::new(Some(Box::new(on_cancel)))),
        }
    }

    /// A handle with no side effect on cancellation, for callers that only
    /// need to observe the cancelled flag (e.g. tests, or a completed
    /// operation's handle).
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Cancels this operation. Idempotent: subsequent calls are no-ops.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.on_cancel.lock().take() {
            f();
        }
    }

    /// Whether `cancel()` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A shared flag mirroring this handle's cancellation state, for
    /// internal bookkeeping (e.g. a downloader subscriber checking whether
    /// it should still be delivered callbacks) without granting the holder
    /// the ability to trigger cancellation's side effect.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_runs_side_effect_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let handle = OperationHandle::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        handle.cancel();
        handle.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_cancelled_reflects_state() {
        let handle = OperationHandle::new(|| {});
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn cancel_after_completion_is_a_noop() {
        let handle = OperationHandle::noop();
        // Simulate "completed": nothing observes this handle anymore, but
        // cancelling it still must not panic or double-run anything.
        handle.cancel();
        handle.cancel();
    }

    #[test]
    fn flag_mirrors_cancel_state_without_granting_trigger_access() {
        let handle = OperationHandle::new(|| {});
        let flag = handle.flag();
        assert!(!flag.load(Ordering::SeqCst));
        handle.cancel();
        assert!(flag.load(Ordering::SeqCst));
    }
}
