//! Pluggable I/O backends.
//!
//! The event loop drives exactly one backend, fixed at construction:
//!
//! - [`ReadinessBackend`]: portable readiness selector over `mio`.
//! - [`EpollBackend`]: edge-triggered epoll with a one-shot rearm policy
//!   (Linux).
//! - [`UringBackend`]: submission/completion ring over `io_uring`;
//!   submissions batch at the end of each loop cycle, completions drain
//!   during `poll` (Linux, `io-uring` feature).
//!
//! Handlers are stored as attachments on the registration and invoked
//! directly from the dispatch; the backend never allocates per event.
//! Waking is split off onto a cheap [`LoopWaker`] handle so producer
//! threads can unpark a loop without touching the backend itself.

mod readiness;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(all(target_os = "linux", feature = "io-uring"))]
mod uring;

pub use readiness::ReadinessBackend;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;
#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub use uring::UringBackend;

use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Number of ready events a backend can surface per poll.
pub(crate) const EVENTS_CAPACITY: usize = 1024;

/// Which I/O backend an event loop drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Portable readiness-based selector (`mio`). The default.
    Readiness,
    /// Edge-triggered notifier (epoll, Linux only).
    #[cfg(target_os = "linux")]
    EdgeTriggered,
    /// Submission/completion ring (`io_uring`, Linux only).
    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    Ring,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Readiness
    }
}

/// Interest set for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interested in read readiness.
    pub const READABLE: Self = Self(0b01);
    /// Interested in write readiness.
    pub const WRITABLE: Self = Self(0b10);

    /// Returns true if reads are of interest.
    #[must_use]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writes are of interest.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Readiness reported to an [`EventHandler`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
}

impl Readiness {
    /// Builds a readiness value; `error` covers hangup and error states.
    #[must_use]
    pub fn new(readable: bool, writable: bool, error: bool) -> Self {
        Self {
            readable,
            writable,
            error,
        }
    }

    /// The registration is ready for reading.
    #[must_use]
    pub fn is_readable(self) -> bool {
        self.readable
    }

    /// The registration is ready for writing.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.writable
    }

    /// The registration reported an error or hangup.
    #[must_use]
    pub fn is_error(self) -> bool {
        self.error
    }
}

/// Identifies a registration with a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoToken(pub(crate) usize);

/// Callback attached to a registration, invoked from the poll dispatch.
pub trait EventHandler: Send {
    /// Called on the loop thread for each readiness event.
    fn on_ready(&mut self, readiness: Readiness);
}

impl<F> EventHandler for F
where
    F: FnMut(Readiness) + Send,
{
    fn on_ready(&mut self, readiness: Readiness) {
        self(readiness);
    }
}

/// Cross-thread handle that makes a parked loop return from `poll`.
///
/// Idempotent: waking an unparked loop is a no-op beyond one syscall, and
/// the loop's `wakeup_needed` flag keeps producers from even paying that.
pub trait LoopWaker: Send + Sync {
    /// Wakes the loop as soon as possible.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying wake primitive fails.
    fn wake(&self) -> io::Result<()>;
}

/// A poll/wake I/O driver owned by one event loop.
///
/// All methods except [`waker`](Self::waker) are loop-thread-only.
pub trait IoBackend: Send {
    /// Registers a file descriptor with an interest set and handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying registration fails.
    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Box<dyn EventHandler>,
    ) -> io::Result<IoToken>;

    /// Replaces the interest set of an existing registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is unknown or the update fails.
    fn modify(&mut self, token: IoToken, interest: Interest) -> io::Result<()>;

    /// Removes a registration and drops its handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is unknown or the removal fails.
    fn unregister(&mut self, token: IoToken) -> io::Result<()>;

    /// Drains ready events, dispatching each registration's handler.
    /// Returns the number of events seen.
    ///
    /// Timeout: `Some(Duration::ZERO)` polls without blocking, `Some(d)`
    /// blocks up to `d`, `None` blocks until an event or a wake.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable driver failures; an
    /// interrupted wait reports zero events instead.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Flushes any batched submissions. The ring backend submits its
    /// queued entries here, at the end of a loop cycle; the readiness
    /// and edge-triggered backends have nothing to batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission fails unrecoverably.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Returns the cross-thread wake handle for this backend.
    fn waker(&self) -> Arc<dyn LoopWaker>;
}

/// Builds the backend for the given kind.
pub(crate) fn build_backend(kind: BackendKind) -> io::Result<Box<dyn IoBackend>> {
    match kind {
        BackendKind::Readiness => Ok(Box::new(ReadinessBackend::new(EVENTS_CAPACITY)?)),
        #[cfg(target_os = "linux")]
        BackendKind::EdgeTriggered => Ok(Box::new(EpollBackend::new(EVENTS_CAPACITY)?)),
        #[cfg(all(target_os = "linux", feature = "io-uring"))]
        BackendKind::Ring => Ok(Box::new(UringBackend::new(EVENTS_CAPACITY)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_combinators() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!Interest::READABLE.is_writable());
        assert!(!Interest::WRITABLE.is_readable());
    }

    #[test]
    fn test_readiness_accessors() {
        let r = Readiness::new(true, false, true);
        assert!(r.is_readable());
        assert!(!r.is_writable());
        assert!(r.is_error());
        let d = Readiness::default();
        assert!(!d.is_readable() && !d.is_writable() && !d.is_error());
    }

    #[test]
    fn test_closure_is_event_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut handler: Box<dyn EventHandler> = Box::new(move |_r: Readiness| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        handler.on_ready(Readiness::new(true, false, false));
        handler.on_ready(Readiness::new(false, true, false));
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }
}
