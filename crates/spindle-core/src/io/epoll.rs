//! Edge-triggered epoll backend (Linux).
//!
//! Registrations use `EPOLLET | EPOLLONESHOT`: each readiness event fires
//! once and the registration is rearmed right after its handler returns.
//! One-shot rearm keeps a handler that cannot drain its fd from being
//! stormed with duplicate edges. Wakes ride an `eventfd` registered
//! level-triggered under a reserved key.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use slab::Slab;

use super::{EventHandler, Interest, IoBackend, IoToken, LoopWaker, Readiness};

/// Key reserved for the wake eventfd.
const WAKE_KEY: u64 = u64::MAX;

/// Cross-thread waker over an `eventfd`.
///
/// Shared by the epoll and ring backends: a write to the eventfd makes
/// the fd readable, which any poller can be watching.
pub(crate) struct EventFdWaker {
    fd: OwnedFd,
}

impl EventFdWaker {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: eventfd has no pointer arguments; a negative return is
        // mapped to errno below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created, unowned eventfd.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Drains the counter so the fd stops reading ready.
    pub(crate) fn drain(&self) {
        let mut value = 0u64;
        // SAFETY: reading 8 bytes into an 8-byte buffer; a failed read
        // (EAGAIN after a racing drain) is benign.
        unsafe {
            let _ = libc::read(
                self.fd.as_raw_fd(),
                std::ptr::addr_of_mut!(value).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl LoopWaker for EventFdWaker {
    fn wake(&self) -> io::Result<()> {
        let one = 1u64;
        // SAFETY: writing 8 bytes from an 8-byte buffer.
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                std::ptr::addr_of!(one).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if written < 0 {
            let err = io::Error::last_os_error();
            // The counter is saturated: the loop is already waking.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    handler: Box<dyn EventHandler>,
}

/// Edge-triggered notifier backend.
pub struct EpollBackend {
    epoll_fd: OwnedFd,
    registrations: Slab<Registration>,
    events: Vec<libc::epoll_event>,
    waker: Arc<EventFdWaker>,
}

fn interest_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn epoll_ctl(epoll_fd: RawFd, op: libc::c_int, fd: RawFd, events: u32, key: u64) -> io::Result<()> {
    let mut event = libc::epoll_event { events, u64: key };
    // SAFETY: event outlives the call; the kernel copies it.
    let rc = unsafe { libc::epoll_ctl(epoll_fd, op, fd, std::ptr::addr_of_mut!(event)) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl EpollBackend {
    /// Creates the notifier with room for `events_capacity` ready events
    /// per poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the epoll instance or wake eventfd cannot be
    /// created.
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        // SAFETY: no pointer arguments; negative return mapped to errno.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_fd is a freshly created, unowned descriptor.
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(epoll_fd) };

        let waker = Arc::new(EventFdWaker::new()?);
        epoll_ctl(
            epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.fd(),
            libc::EPOLLIN as u32,
            WAKE_KEY,
        )?;

        Ok(Self {
            epoll_fd,
            registrations: Slab::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; events_capacity],
            waker,
        })
    }

    /// Number of live registrations.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }

    fn rearm(&self, key: usize) -> io::Result<()> {
        let registration = &self.registrations[key];
        epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            registration.fd,
            interest_bits(registration.interest)
                | libc::EPOLLET as u32
                | libc::EPOLLONESHOT as u32,
            key as u64,
        )
    }
}

impl IoBackend for EpollBackend {
    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Box<dyn EventHandler>,
    ) -> io::Result<IoToken> {
        let entry = self.registrations.vacant_entry();
        let key = entry.key();
        epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            interest_bits(interest) | libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32,
            key as u64,
        )?;
        entry.insert(Registration {
            fd,
            interest,
            handler,
        });
        Ok(IoToken(key))
    }

    fn modify(&mut self, token: IoToken, interest: Interest) -> io::Result<()> {
        let registration = self
            .registrations
            .get_mut(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown io token"))?;
        registration.interest = interest;
        let fd = registration.fd;
        epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            interest_bits(interest) | libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32,
            token.0 as u64,
        )
    }

    fn unregister(&mut self, token: IoToken) -> io::Result<()> {
        if !self.registrations.contains(token.0) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown io token"));
        }
        let registration = self.registrations.remove(token.0);
        epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            registration.fd,
            0,
            0,
        )
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) if d.is_zero() => 0,
            Some(d) => {
                // Round sub-millisecond timeouts up so a 100us park does
                // not degenerate into a busy loop.
                let ms = d.as_millis();
                if ms == 0 {
                    1
                } else {
                    libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
                }
            }
        };

        // SAFETY: the events buffer lives for the duration of the call
        // and its length is passed alongside.
        let ready = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                libc::c_int::try_from(self.events.len()).unwrap_or(libc::c_int::MAX),
                timeout_ms,
            )
        };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let ready = usize::try_from(ready).unwrap_or(0);
        for i in 0..ready {
            let event = self.events[i];
            if event.u64 == WAKE_KEY {
                self.waker.drain();
                continue;
            }
            let key = usize::try_from(event.u64).unwrap_or(usize::MAX);
            let Some(registration) = self.registrations.get_mut(key) else {
                continue;
            };
            let bits = event.events;
            let readiness = Readiness::new(
                bits & libc::EPOLLIN as u32 != 0,
                bits & libc::EPOLLOUT as u32 != 0,
                bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0,
            );
            registration.handler.on_ready(readiness);
            // One-shot rearm: the registration stays quiet until the
            // handler has run, then starts watching for the next edge.
            self.rearm(key)?;
        }
        Ok(ready)
    }

    fn waker(&self) -> Arc<dyn LoopWaker> {
        Arc::clone(&self.waker) as Arc<dyn LoopWaker>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_nonblocking_poll_on_idle_backend() {
        let mut backend = EpollBackend::new(64).expect("backend");
        assert_eq!(backend.poll(Some(Duration::ZERO)).expect("poll"), 0);
    }

    #[test]
    fn test_wake_unblocks_poll() {
        let mut backend = EpollBackend::new(64).expect("backend");
        let waker = backend.waker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake().expect("wake");
        });
        let count = backend.poll(Some(Duration::from_secs(5))).expect("poll");
        assert!(count >= 1);
        handle.join().expect("waker thread");
    }

    #[test]
    fn test_edge_event_dispatches_and_requiesces() {
        let mut backend = EpollBackend::new(64).expect("backend");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let addr = listener.local_addr().expect("addr");
        let fd = listener.as_raw_fd();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        backend
            .register(
                fd,
                Interest::READABLE,
                // The handler owns the listener and drains it, so the
                // rearmed registration goes quiet afterwards.
                Box::new(move |_r: Readiness| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    while listener.accept().is_ok() {}
                }),
            )
            .expect("register");

        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(b"x").expect("write");

        for _ in 0..50 {
            backend.poll(Some(Duration::from_millis(10))).expect("poll");
            if hits.load(Ordering::Relaxed) >= 1 {
                break;
            }
        }
        assert!(hits.load(Ordering::Relaxed) >= 1);

        // Drained and rearmed: no new edge, no further dispatch.
        let quiet = backend.poll(Some(Duration::from_millis(50))).expect("poll");
        assert_eq!(quiet, 0);
    }

    #[test]
    fn test_unknown_token_errors() {
        let mut backend = EpollBackend::new(64).expect("backend");
        assert!(backend.modify(IoToken(7), Interest::READABLE).is_err());
        assert!(backend.unregister(IoToken(7)).is_err());
    }
}
