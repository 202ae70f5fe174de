//! The I/O channel: one socket, one read drain, one ordered write queue.
//!
//! A [`Channel`] owns a non-blocking stream socket and an [`EventSource`]
//! registration for it. Consumers:
//! - [`Channel::drain`] hands in a [`ByteReader`] which receives every byte
//!   available at the next readability notification
//! - [`Channel::write`] queues a payload which is flushed across as many
//!   writability notifications as it takes
//! - [`Channel::close`] cancels everything and releases the socket
//!
//! All syscalls and queue mutations happen under one lock per channel.
//! Handlers run after that lock is released, in the order their results were
//! produced, so a handler may call back into the channel.

mod dispatch;
mod read;
mod write;

pub use read::{ByteReader, DrainOutcome, DrainResult};
pub use write::WriteResult;

use crate::builder::{ChannelBuilder, ChannelConfig};
use crate::error::{ChannelError, IoOp};
use crate::reactor::{Direction, EventSource, Interest, Readiness, ReadinessHandler};
use crate::socket::{NativeSocket, Socket};

use bytes::Bytes;
use dispatch::{Completion, Dispatcher};
use parking_lot::Mutex;
use read::DrainSlot;
use std::fmt;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use write::{WriteQueue, WriteRequest};

/// Lifecycle of a channel. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Active,
    Closing,
    Closed,
}

/// Why a channel left [`ChannelState::Active`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Channel::close`] was called.
    Requested,
    /// A read returned zero bytes.
    PeerClosed,
    /// A read failed with something other than would-block.
    ReadFailed,
    /// A write failed with a connection-level error.
    WriteFailed,
    /// The last handle was dropped while the channel was active.
    Dropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::Requested => "requested",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadFailed => "read failed",
            CloseReason::WriteFailed => "write failed",
            CloseReason::Dropped => "dropped",
        };
        f.write_str(reason)
    }
}

/// Transfer counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Successful read syscalls.
    pub reads: u64,
    /// Successful write syscalls.
    pub writes: u64,
}

/// Handle to an asynchronous, event-driven socket channel.
///
/// Clones share the same channel. Dropping the last handle closes an active
/// channel with [`CloseReason::Dropped`].
///
/// # Example
///
/// ```no_run
/// use iochannel::{Channel, ReadinessRegistry};
/// use std::net::TcpStream;
/// use std::sync::Arc;
///
/// let registry = Arc::new(ReadinessRegistry::new());
/// let stream = TcpStream::connect("127.0.0.1:7000").unwrap();
/// let channel = Channel::open(stream, registry.clone(), || println!("socket released")).unwrap();
///
/// channel.drain(Vec::<u8>::new(), |bytes, result| {
///     println!("{result:?}: {} bytes", bytes.len());
/// });
/// registry.poll_once(None).unwrap();
/// ```
pub struct Channel<S: Socket = NativeSocket> {
    inner: Arc<Inner<S>>,
}

impl<S: Socket> Clone for Channel<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Socket> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Channel")
            .field("fd", &core.fd)
            .field("state", &core.state)
            .field("interest", &core.interest)
            .field("pending_writes", &core.queue.len())
            .finish()
    }
}

impl Channel<NativeSocket> {
    /// Opens a channel with the default configuration.
    ///
    /// Fails with [`ChannelError::InvalidHandle`] if `handle` is not a
    /// socket. `cleanup` runs exactly once, after the socket is released.
    pub fn open<E, F>(
        handle: impl Into<OwnedFd>,
        source: E,
        cleanup: F,
    ) -> Result<Self, ChannelError>
    where
        E: EventSource + 'static,
        F: FnOnce() + Send + 'static,
    {
        ChannelBuilder::new().open(handle, source, cleanup)
    }
}

impl<S: Socket> Channel<S> {
    /// Opens a channel over any [`Socket`] with the default configuration.
    pub fn with_socket<E, F>(socket: S, source: E, cleanup: F) -> Self
    where
        E: EventSource + 'static,
        F: FnOnce() + Send + 'static,
    {
        ChannelBuilder::new().with_socket(socket, source, cleanup)
    }

    pub(crate) fn from_parts(
        socket: S,
        source: Box<dyn EventSource>,
        cleanup: Box<dyn FnOnce() + Send>,
        config: ChannelConfig,
    ) -> Self {
        let fd = socket.as_raw_fd();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<S>>| {
            let on_readable = readiness_handler(weak.clone(), Direction::Readable);
            let on_writable = readiness_handler(weak.clone(), Direction::Writable);

            Inner {
                core: Mutex::new(Core {
                    fd,
                    socket: Some(socket),
                    state: ChannelState::Active,
                    close_reason: None,
                    source,
                    on_readable,
                    on_writable,
                    interest: Interest::NONE,
                    writable: false,
                    queue: WriteQueue::new(),
                    drain: None,
                    cleanup: Some(cleanup),
                    scratch: vec![0u8; config.read_buffer_size].into_boxed_slice(),
                    config,
                    stats: ChannelStats::default(),
                }),
                dispatcher: Dispatcher::new(),
            }
        });

        debug!(fd, "channel opened");

        Self { inner }
    }

    /// Delivers the bytes available at the next readability notification.
    ///
    /// `reader` is held by the channel until `handler` runs, which hands it
    /// back together with the result. The handler runs exactly once: after
    /// the socket would block, after the peer closed, or with an error. Only
    /// one drain may be pending; a second one is answered with
    /// [`ChannelError::DrainAlreadyPending`] and its reader is returned as is.
    pub fn drain<R, H>(&self, reader: R, handler: H)
    where
        R: ByteReader,
        H: FnOnce(R, DrainResult) + Send + 'static,
    {
        self.inner.with_core(|core, completions| {
            if core.state != ChannelState::Active {
                completions.push(read::reject(reader, handler, ChannelError::ChannelClosed));
                return;
            }

            if core.drain.is_some() {
                completions.push(read::reject(
                    reader,
                    handler,
                    ChannelError::DrainAlreadyPending,
                ));
                return;
            }

            core.drain = Some(DrainSlot::new(reader, handler));

            if let Err(err) = core.enable(Direction::Readable) {
                warn!(fd = core.fd, error = %err, "cannot register for readability");
                if let Some(slot) = core.drain.take() {
                    let error = ChannelError::socket_io(IoOp::Read, 0, err);
                    completions.push(slot.finish(Err(error)));
                }
                core.shutdown(CloseReason::ReadFailed, completions);
            }
        });
    }

    /// Queues `data` behind every earlier write.
    ///
    /// `handler` runs exactly once with `Ok(len)` when every byte was
    /// accepted by the socket, or with a [`WriteError`](crate::WriteError)
    /// carrying the unsent suffix. Completions run in submission order.
    pub fn write<H>(&self, data: impl Into<Bytes>, handler: H)
    where
        H: FnOnce(WriteResult) + Send + 'static,
    {
        let request = WriteRequest::new(data.into(), handler);
        self.inner
            .with_core(|core, completions| core.submit(request, completions));
    }

    /// Closes the channel.
    ///
    /// Pending writes fail with [`ChannelError::ChannelClosed`], a pending
    /// drain is answered the same way, the socket is released and then the
    /// cleanup callback runs. Calling it again does nothing.
    pub fn close(&self) {
        self.inner
            .with_core(|core, completions| core.shutdown(CloseReason::Requested, completions));
    }

    pub fn state(&self) -> ChannelState {
        self.inner.core.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.core.lock().close_reason
    }

    /// Number of write requests not yet completed.
    pub fn pending_writes(&self) -> usize {
        self.inner.core.lock().queue.len()
    }

    /// Bytes queued for writing that the socket has not accepted yet.
    pub fn queued_bytes(&self) -> usize {
        self.inner.core.lock().queue.queued_bytes()
    }

    /// The readiness directions currently registered with the event source.
    pub fn interest(&self) -> Interest {
        self.inner.core.lock().interest
    }

    pub fn stats(&self) -> ChannelStats {
        self.inner.core.lock().stats
    }

    /// The descriptor the channel was opened with. It stays the key used
    /// with the event source even after the socket is released.
    pub fn raw_fd(&self) -> RawFd {
        self.inner.core.lock().fd
    }
}

fn readiness_handler<S: Socket>(weak: Weak<Inner<S>>, direction: Direction) -> ReadinessHandler {
    Arc::new(move |readiness: Readiness| {
        if let Some(inner) = weak.upgrade() {
            inner.on_ready(direction, readiness);
        }
    })
}

struct Inner<S: Socket> {
    core: Mutex<Core<S>>,
    dispatcher: Dispatcher,
}

impl<S: Socket> Inner<S> {
    fn on_ready(&self, direction: Direction, readiness: Readiness) {
        self.with_core(|core, completions| match direction {
            Direction::Readable => core.on_readable(readiness, completions),
            Direction::Writable => core.on_writable(readiness, completions),
        });
    }

    /// Runs `f` under the channel lock, then runs the handlers it produced.
    ///
    /// Completions are queued before the lock is released so results from
    /// different threads reach the dispatcher in the order they happened.
    fn with_core<F>(&self, f: F)
    where
        F: FnOnce(&mut Core<S>, &mut Vec<Completion>),
    {
        {
            let mut core = self.core.lock();
            let mut completions = Vec::new();
            f(&mut *core, &mut completions);
            self.dispatcher.schedule(completions);
        }

        self.dispatcher.run();
    }
}

impl<S: Socket> Drop for Inner<S> {
    fn drop(&mut self) {
        let mut completions = Vec::new();
        self.core
            .get_mut()
            .shutdown(CloseReason::Dropped, &mut completions);
        self.dispatcher.schedule(completions);
        self.dispatcher.run();
    }
}

/// State guarded by the channel lock.
pub(crate) struct Core<S> {
    fd: RawFd,
    socket: Option<S>,
    state: ChannelState,
    close_reason: Option<CloseReason>,
    source: Box<dyn EventSource>,
    on_readable: ReadinessHandler,
    on_writable: ReadinessHandler,
    interest: Interest,
    /// Set by a writability notification, cleared by a would-block.
    writable: bool,
    queue: WriteQueue,
    drain: Option<DrainSlot>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
    scratch: Box<[u8]>,
    config: ChannelConfig,
    stats: ChannelStats,
}

impl<S: Socket> Core<S> {
    fn enable(&mut self, direction: Direction) -> io::Result<()> {
        if self.interest.contains(direction) {
            return Ok(());
        }

        let handler = match direction {
            Direction::Readable => self.on_readable.clone(),
            Direction::Writable => self.on_writable.clone(),
        };

        self.source.register(self.fd, direction, handler)?;
        self.interest.set(direction, true);

        Ok(())
    }

    fn disable(&mut self, direction: Direction) {
        if !self.interest.contains(direction) {
            return;
        }

        self.source.unregister(self.fd, direction);
        self.interest.set(direction, false);
    }

    /// Moves Active -> Closing -> Closed. No-op unless Active.
    ///
    /// Everything still pending is answered with `ChannelClosed` before the
    /// cleanup callback, which is queued last.
    fn shutdown(&mut self, reason: CloseReason, completions: &mut Vec<Completion>) {
        if self.state != ChannelState::Active {
            return;
        }

        self.state = ChannelState::Closing;
        self.close_reason = Some(reason);
        debug!(fd = self.fd, %reason, pending_writes = self.queue.len(), "closing channel");

        self.disable(Direction::Readable);
        self.disable(Direction::Writable);

        if let Some(slot) = self.drain.take() {
            completions.push(slot.finish(Err(ChannelError::ChannelClosed)));
        }

        for request in self.queue.take_all() {
            completions.push(request.cancel());
        }

        drop(self.socket.take());
        self.state = ChannelState::Closed;

        if let Some(cleanup) = self.cleanup.take() {
            completions.push(cleanup);
        }

        debug!(fd = self.fd, "channel closed");
    }
}
