//! Single-assignment completion handles.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// A single-assignment completion cell.
///
/// `sleep` and other deadline-driven operations hand one of these back to
/// the caller; the deadline scheduler completes it when the deadline
/// fires. There is no multi-waiter machinery: callers poll `is_completed`
/// or check it from a subsequently scheduled task.
///
/// Cancelling a pending promise marks the associated deadline task as
/// cancelled; the deadline scheduler discards it on pop instead of
/// firing.
#[derive(Debug, Clone)]
pub struct Promise {
    state: Arc<AtomicU8>,
}

impl Promise {
    /// Creates a pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Returns true once the promise has been completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    /// Returns true if the promise was cancelled before completion.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Cancels the promise. Returns `false` if it already completed or
    /// was already cancelled.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Completes the promise. Returns `false` if it was cancelled first
    /// or completed before; the cell is assigned at most once.
    pub(crate) fn complete(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_once() {
        let p = Promise::new();
        assert!(!p.is_completed());
        assert!(p.complete());
        assert!(p.is_completed());
        assert!(!p.complete());
    }

    #[test]
    fn test_cancel_blocks_completion() {
        let p = Promise::new();
        assert!(p.cancel());
        assert!(p.is_cancelled());
        assert!(!p.complete());
        assert!(!p.is_completed());
    }

    #[test]
    fn test_cancel_after_completion_fails() {
        let p = Promise::new();
        assert!(p.complete());
        assert!(!p.cancel());
        assert!(p.is_completed());
    }

    #[test]
    fn test_clone_shares_state() {
        let p = Promise::new();
        let q = p.clone();
        assert!(p.complete());
        assert!(q.is_completed());
    }
}
