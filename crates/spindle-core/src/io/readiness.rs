//! Portable readiness-based selector over `mio`.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use slab::Slab;

use super::{EventHandler, Interest, IoBackend, IoToken, LoopWaker, Readiness};

/// Token reserved for the wake channel.
const WAKE_TOKEN: Token = Token(usize::MAX);

struct Registration {
    fd: RawFd,
    handler: Box<dyn EventHandler>,
}

/// Readiness selector backend.
///
/// Registrations map to slab keys used as `mio` tokens, so dispatch is an
/// index into the slab: no per-event allocation, no hashing. The ready
/// set is pre-sized once at construction.
pub struct ReadinessBackend {
    poll: Poll,
    events: Events,
    registrations: Slab<Registration>,
    waker: Arc<MioWaker>,
}

struct MioWaker(mio::Waker);

impl LoopWaker for MioWaker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

fn to_mio(interest: Interest) -> mio::Interest {
    match (interest.is_readable(), interest.is_writable()) {
        (true, false) => mio::Interest::READABLE,
        (false, true) => mio::Interest::WRITABLE,
        // Registering with an empty interest set is a caller bug; treat
        // it as read interest rather than panicking in the driver.
        _ => mio::Interest::READABLE | mio::Interest::WRITABLE,
    }
}

impl ReadinessBackend {
    /// Creates the selector with a ready-set of `events_capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS selector or wake channel cannot be
    /// created.
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(MioWaker(mio::Waker::new(poll.registry(), WAKE_TOKEN)?));
        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity),
            registrations: Slab::new(),
            waker,
        })
    }

    /// Number of live registrations.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }
}

impl IoBackend for ReadinessBackend {
    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Box<dyn EventHandler>,
    ) -> io::Result<IoToken> {
        let entry = self.registrations.vacant_entry();
        let token = Token(entry.key());
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, to_mio(interest))?;
        entry.insert(Registration { fd, handler });
        Ok(IoToken(token.0))
    }

    fn modify(&mut self, token: IoToken, interest: Interest) -> io::Result<()> {
        let registration = self
            .registrations
            .get(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown io token"))?;
        self.poll.registry().reregister(
            &mut SourceFd(&registration.fd),
            Token(token.0),
            to_mio(interest),
        )
    }

    fn unregister(&mut self, token: IoToken) -> io::Result<()> {
        if !self.registrations.contains(token.0) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown io token"));
        }
        let registration = self.registrations.remove(token.0);
        self.poll
            .registry()
            .deregister(&mut SourceFd(&registration.fd))
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let events = &self.events;
        let registrations = &mut self.registrations;
        let mut count = 0;
        for event in events {
            count += 1;
            if event.token() == WAKE_TOKEN {
                // The waker resets itself; nothing to dispatch.
                continue;
            }
            if let Some(registration) = registrations.get_mut(event.token().0) {
                let readiness = Readiness::new(
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error() || event.is_read_closed() || event.is_write_closed(),
                );
                registration.handler.on_ready(readiness);
            }
        }
        Ok(count)
    }

    fn waker(&self) -> Arc<dyn LoopWaker> {
        Arc::clone(&self.waker) as Arc<dyn LoopWaker>
    }
}
