//! Fluent builder for Channel construction.
//!
//! Provides a builder pattern interface for configuring and opening channels.

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::reactor::EventSource;
use crate::socket::{NativeSocket, Socket};

use std::os::fd::OwnedFd;

/// Default size of the scratch buffer each read syscall fills.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Default number of write syscalls one flush may issue before yielding.
pub const DEFAULT_MAX_WRITES_PER_TURN: usize = 64;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelConfig {
    pub(crate) read_buffer_size: usize,
    pub(crate) max_writes_per_turn: usize,
    pub(crate) write_queue_limit: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_writes_per_turn: DEFAULT_MAX_WRITES_PER_TURN,
            write_queue_limit: None,
        }
    }
}

/// Builder for opening [`Channel`]s with non-default settings.
///
/// # Example
/// ```no_run
/// use iochannel::{ChannelBuilder, ReadinessRegistry};
/// use std::os::unix::net::UnixStream;
/// use std::sync::Arc;
///
/// let registry = Arc::new(ReadinessRegistry::new());
/// let (stream, _peer) = UnixStream::pair().unwrap();
///
/// let channel = ChannelBuilder::new()
///     .read_buffer_size(4096)
///     .write_queue_limit(1 << 20)
///     .open(stream, registry, || {})
///     .unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChannelBuilder {
    config: ChannelConfig,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the scratch buffer used for each read attempt. Zero becomes one.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(1);
        self
    }

    /// How many write syscalls one writability notification may drive.
    ///
    /// When the budget is spent the channel keeps its writability interest
    /// and continues on the next notification. Zero becomes one.
    pub fn max_writes_per_turn(mut self, writes: usize) -> Self {
        self.config.max_writes_per_turn = writes.max(1);
        self
    }

    /// Rejects writes that would leave more than `bytes` unsent bytes queued.
    ///
    /// Rejected writes fail with [`ChannelError::QueueFull`]; the channel
    /// stays open.
    pub fn write_queue_limit(mut self, bytes: usize) -> Self {
        self.config.write_queue_limit = Some(bytes);
        self
    }

    /// Opens a channel over an already-connected OS socket.
    pub fn open<E, F>(
        self,
        handle: impl Into<OwnedFd>,
        source: E,
        cleanup: F,
    ) -> Result<Channel<NativeSocket>, ChannelError>
    where
        E: EventSource + 'static,
        F: FnOnce() + Send + 'static,
    {
        let socket = NativeSocket::new(handle.into())?;
        Ok(self.with_socket(socket, source, cleanup))
    }

    /// Opens a channel over any [`Socket`] implementation.
    pub fn with_socket<S, E, F>(self, socket: S, source: E, cleanup: F) -> Channel<S>
    where
        S: Socket,
        E: EventSource + 'static,
        F: FnOnce() + Send + 'static,
    {
        Channel::from_parts(socket, Box::new(source), Box::new(cleanup), self.config)
    }
}
