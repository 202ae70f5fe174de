//! Handler registry for embedding channels into an existing event loop.
//!
//! [`ReadinessRegistry`] implements [`EventSource`] by remembering the handler
//! for every `(fd, direction)` pair. An embedding loop feeds it readiness it
//! learned elsewhere through [`ReadinessRegistry::dispatch`], or lets it wait
//! on the registered descriptors itself with [`ReadinessRegistry::poll_once`].
//!
//! # Example
//!
//! ```no_run
//! use iochannel::{Channel, ReadinessRegistry};
//! use std::os::unix::net::UnixStream;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ReadinessRegistry::new());
//! let (stream, _peer) = UnixStream::pair().unwrap();
//! let channel = Channel::open(stream, registry.clone(), || println!("closed")).unwrap();
//!
//! channel.write(&b"hello"[..], |result| println!("write: {result:?}"));
//! while !channel.is_closed() && channel.pending_writes() > 0 {
//!     registry.poll_once(None).unwrap();
//! }
//! ```

use super::{Direction, EventSource, Interest, Readiness, ReadinessHandler};

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, poll, pollfd};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Default)]
struct Entry {
    read: Option<ReadinessHandler>,
    write: Option<ReadinessHandler>,
}

impl Entry {
    fn slot(&mut self, direction: Direction) -> &mut Option<ReadinessHandler> {
        match direction {
            Direction::Readable => &mut self.read,
            Direction::Writable => &mut self.write,
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// A level-triggered handler table keyed by descriptor and direction.
#[derive(Default)]
pub struct ReadinessRegistry {
    entries: Mutex<HashMap<RawFd, Entry>>,
}

impl ReadinessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invokes the handler registered for `(fd, direction)`.
    ///
    /// Returns `false` when nothing is registered. The handler runs without
    /// the registry locked, so it may register or unregister freely.
    pub fn dispatch(&self, fd: RawFd, direction: Direction, readiness: Readiness) -> bool {
        let handler = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&fd) {
                Some(entry) => entry.slot(direction).clone(),
                None => None,
            }
        };

        match handler {
            Some(handler) => {
                trace!(fd, %direction, ?readiness, "dispatching readiness");
                handler(readiness);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, fd: RawFd, direction: Direction) -> bool {
        self.interest(fd).contains(direction)
    }

    /// The directions currently registered for `fd`.
    pub fn interest(&self, fd: RawFd) -> Interest {
        let entries = self.entries.lock();
        match entries.get(&fd) {
            Some(entry) => Interest {
                read: entry.read.is_some(),
                write: entry.write.is_some(),
            },
            None => Interest::NONE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Waits for readiness on every registered descriptor and dispatches it.
    ///
    /// `None` blocks until something is ready, unless nothing is registered,
    /// in which case it returns at once. Timeouts are rounded up to whole
    /// milliseconds. Returns the number of handlers invoked; an interrupted
    /// wait returns `Ok(0)`.
    pub fn poll_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut fds: Vec<pollfd> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|(&fd, entry)| {
                    let mut events = 0;
                    if entry.read.is_some() {
                        events |= POLLIN;
                    }
                    if entry.write.is_some() {
                        events |= POLLOUT;
                    }
                    pollfd {
                        fd,
                        events,
                        revents: 0,
                    }
                })
                .collect()
        };

        if fds.is_empty() && timeout.is_none() {
            return Ok(0);
        }

        let timeout_ms = match timeout {
            Some(duration) => timeout_millis(duration),
            None => -1,
        };

        let ready = unsafe { poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut dispatched = 0;
        for entry in fds.iter().filter(|entry| entry.revents != 0) {
            let revents = entry.revents;

            if revents & POLLNVAL != 0 {
                warn!(fd = entry.fd, "dropping registrations for invalid descriptor");
                self.entries.lock().remove(&entry.fd);
                continue;
            }

            if entry.events & POLLIN != 0 && revents & (POLLIN | POLLHUP | POLLERR) != 0 {
                let readiness = classify(revents, POLLIN);
                if self.dispatch(entry.fd, Direction::Readable, readiness) {
                    dispatched += 1;
                }
            }

            if entry.events & POLLOUT != 0 && revents & (POLLOUT | POLLHUP | POLLERR) != 0 {
                let readiness = classify(revents, POLLOUT);
                if self.dispatch(entry.fd, Direction::Writable, readiness) {
                    dispatched += 1;
                }
            }
        }

        Ok(dispatched)
    }
}

impl EventSource for ReadinessRegistry {
    fn register(
        &self,
        fd: RawFd,
        direction: Direction,
        handler: ReadinessHandler,
    ) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let mut entries = self.entries.lock();
        *entries.entry(fd).or_default().slot(direction) = Some(handler);

        Ok(())
    }

    fn unregister(&self, fd: RawFd, direction: Direction) {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&fd) {
            *entry.slot(direction) = None;
            if entry.is_empty() {
                entries.remove(&fd);
            }
        }
    }
}

// Rounds up so a sub-millisecond wait does not become a non-blocking poll.
fn timeout_millis(duration: Duration) -> libc::c_int {
    duration
        .as_nanos()
        .div_ceil(1_000_000)
        .min(libc::c_int::MAX as u128) as libc::c_int
}

fn classify(revents: libc::c_short, ready_bit: libc::c_short) -> Readiness {
    if revents & POLLERR != 0 {
        Readiness::Error
    } else if revents & ready_bit != 0 {
        Readiness::Ready
    } else {
        Readiness::Hangup
    }
}
