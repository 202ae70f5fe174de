//! Readiness notification seam.
//!
//! The channel never talks to epoll, kqueue or IOCP directly. It consumes an
//! [`EventSource`] that lets it register a handler per descriptor and
//! direction. This module provides:
//! - [`EventSource`]: the registration interface the channel requires
//! - [`event`]: directions, readiness kinds and interest sets
//! - [`registry`]: [`ReadinessRegistry`], glue for embedding event loops

pub mod event;
pub mod registry;

pub use event::{Direction, Interest, Readiness};
pub use registry::ReadinessRegistry;

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Callback invoked by an [`EventSource`] when a descriptor becomes ready.
pub type ReadinessHandler = Arc<dyn Fn(Readiness) + Send + Sync>;

/// Something that can tell a channel when its socket is readable or writable.
///
/// Registering the same `(fd, direction)` twice replaces the earlier handler.
/// Implementations must not call `handler` from inside `register` itself; the
/// first notification has to come from the source's own dispatch path.
pub trait EventSource: Send + Sync {
    fn register(
        &self,
        fd: RawFd,
        direction: Direction,
        handler: ReadinessHandler,
    ) -> io::Result<()>;

    fn unregister(&self, fd: RawFd, direction: Direction);
}

impl<T: EventSource + ?Sized> EventSource for Arc<T> {
    fn register(
        &self,
        fd: RawFd,
        direction: Direction,
        handler: ReadinessHandler,
    ) -> io::Result<()> {
        (**self).register(fd, direction, handler)
    }

    fn unregister(&self, fd: RawFd, direction: Direction) {
        (**self).unregister(fd, direction)
    }
}
