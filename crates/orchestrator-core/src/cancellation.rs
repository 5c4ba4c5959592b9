//! Per-run cancellation plumbing (SPEC_FULL.md §5, §9).
//!
//! A [`CancellationHandle`] is created when a Worker leases a WorkItem
//! and is checked at each pipeline step boundary. This is the same
//! polled-flag shape the teacher uses for its activity cancellation
//! handles, scoped here to a single pipeline run instead of a replayed
//! workflow activity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    canceled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncanceled_and_latches_once_canceled() {
        let handle = CancellationHandle::new();
        assert!(!handle.is_canceled());
        handle.cancel();
        assert!(handle.is_canceled());
    }

    #[test]
    fn clones_share_the_same_underlying_flag() {
        let handle = CancellationHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_canceled());
    }
}
