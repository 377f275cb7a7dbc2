//! Submission/completion ring backend over `io_uring` (Linux).
//!
//! Readiness interest is expressed as one-shot `PollAdd` operations.
//! Submissions batch in a pending list and reach the kernel in
//! [`flush`](super::IoBackend::flush) at the end of each loop cycle (and
//! right before a blocking poll); completions are consumed during
//! [`poll`](super::IoBackend::poll). After a completion dispatches, the
//! registration is rearmed by queueing a fresh `PollAdd` for the next
//! batch. Wakes ride an `eventfd` watched the same way.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};
use slab::Slab;

use super::epoll::EventFdWaker;
use super::{EventHandler, Interest, IoBackend, IoToken, LoopWaker, Readiness};

/// User data reserved for the wake eventfd's poll.
const WAKE_KEY: u64 = u64::MAX;
/// User data reserved for cancellation completions; never dispatched.
const CANCEL_KEY: u64 = u64::MAX - 1;

struct Registration {
    fd: RawFd,
    interest: Interest,
    handler: Box<dyn EventHandler>,
}

fn poll_mask(interest: Interest) -> u32 {
    let mut mask = 0u32;
    if interest.is_readable() {
        mask |= libc::POLLIN as u32;
    }
    if interest.is_writable() {
        mask |= libc::POLLOUT as u32;
    }
    mask
}

fn poll_add(fd: RawFd, interest: Interest, key: u64) -> squeue::Entry {
    opcode::PollAdd::new(types::Fd(fd), poll_mask(interest))
        .build()
        .user_data(key)
}

/// Submission/completion ring backend.
pub struct UringBackend {
    ring: IoUring,
    registrations: Slab<Registration>,
    /// Entries queued for the next batched submit.
    pending: Vec<squeue::Entry>,
    waker: Arc<EventFdWaker>,
}

impl UringBackend {
    /// Creates the ring with `entries` submission slots.
    ///
    /// # Errors
    ///
    /// Returns an error if the ring or the wake eventfd cannot be
    /// created (io_uring needs Linux 5.6 or newer).
    pub fn new(entries: usize) -> io::Result<Self> {
        let entries = u32::try_from(entries.next_power_of_two()).unwrap_or(4096);
        let ring = IoUring::new(entries)?;
        let waker = Arc::new(EventFdWaker::new()?);
        let wake_poll = poll_add(waker.fd(), Interest::READABLE, WAKE_KEY);
        Ok(Self {
            ring,
            registrations: Slab::new(),
            pending: vec![wake_poll],
            waker,
        })
    }

    /// Number of live registrations.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }

    fn push_pending_to_ring(&mut self) -> io::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for entry in pending {
            loop {
                let pushed = {
                    let mut sq = self.ring.submission();
                    // SAFETY: PollAdd/PollRemove entries carry no buffers;
                    // the fd's validity for the lifetime of the
                    // registration is the caller's contract on register.
                    unsafe { sq.push(&entry).is_ok() }
                };
                if pushed {
                    break;
                }
                // Submission queue full: hand what we have to the kernel.
                self.ring.submit()?;
            }
        }
        Ok(())
    }
}

impl IoBackend for UringBackend {
    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Box<dyn EventHandler>,
    ) -> io::Result<IoToken> {
        let entry = self.registrations.vacant_entry();
        let key = entry.key();
        self.pending.push(poll_add(fd, interest, key as u64));
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
        // Cancel the armed poll and arm one with the new mask.
        self.pending.push(
            opcode::PollRemove::new(token.0 as u64)
                .build()
                .user_data(CANCEL_KEY),
        );
        self.pending.push(poll_add(fd, interest, token.0 as u64));
        Ok(())
    }

    fn unregister(&mut self, token: IoToken) -> io::Result<()> {
        if !self.registrations.contains(token.0) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown io token"));
        }
        self.registrations.remove(token.0);
        self.pending.push(
            opcode::PollRemove::new(token.0 as u64)
                .build()
                .user_data(CANCEL_KEY),
        );
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        // Everything queued must be armed before we consider blocking.
        self.push_pending_to_ring()?;

        match timeout {
            Some(d) if d.is_zero() => {
                self.ring.submit()?;
            }
            None => match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            },
            Some(d) => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                match self.ring.submitter().submit_with_args(1, &args) {
                    Ok(_) => {}
                    Err(e) if e.raw_os_error() == Some(libc::ETIME) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let Self {
            ring,
            registrations,
            pending,
            waker,
        } = self;

        let mut count = 0;
        for cqe in ring.completion() {
            let key = cqe.user_data();
            if key == CANCEL_KEY {
                continue;
            }
            if key == WAKE_KEY {
                count += 1;
                waker.drain();
                pending.push(poll_add(waker.fd(), Interest::READABLE, WAKE_KEY));
                continue;
            }
            if cqe.result() < 0 {
                // Cancelled or failed poll; the registration was either
                // removed or will be rearmed by a later modify.
                continue;
            }
            let Some(registration) = registrations.get_mut(usize::try_from(key).unwrap_or(usize::MAX))
            else {
                continue;
            };
            count += 1;
            let revents = u32::try_from(cqe.result()).unwrap_or(0);
            let readiness = Readiness::new(
                revents & libc::POLLIN as u32 != 0,
                revents & libc::POLLOUT as u32 != 0,
                revents & (libc::POLLERR as u32 | libc::POLLHUP as u32) != 0,
            );
            registration.handler.on_ready(readiness);
            // One-shot completion: rearm with the next batch.
            pending.push(poll_add(
                registration.fd,
                registration.interest,
                key,
            ));
        }
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.push_pending_to_ring()?;
        self.ring.submit()?;
        Ok(())
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
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn uring_available() -> bool {
        IoUring::new(8).is_ok()
    }

    #[test]
    fn test_nonblocking_poll_on_idle_backend() {
        if !uring_available() {
            return;
        }
        let mut backend = UringBackend::new(64).expect("backend");
        assert_eq!(backend.poll(Some(Duration::ZERO)).expect("poll"), 0);
    }

    #[test]
    fn test_wake_unblocks_poll() {
        if !uring_available() {
            return;
        }
        let mut backend = UringBackend::new(64).expect("backend");
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
    fn test_poll_add_dispatches_readiness() {
        if !uring_available() {
            return;
        }
        let mut backend = UringBackend::new(64).expect("backend");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let addr = listener.local_addr().expect("addr");

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        backend
            .register(
                listener.as_raw_fd(),
                Interest::READABLE,
                Box::new(move |r: Readiness| {
                    assert!(r.is_readable());
                    counter.fetch_add(1, Ordering::Relaxed);
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
    }
}
