//! Error taxonomy for the I/O channel.
//!
//! Only construction failures ([`ChannelError::InvalidHandle`]) are returned
//! synchronously. Everything else reaches the caller through the handler of
//! the operation that failed.

use bytes::Bytes;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// The syscall direction a [`ChannelError::SocketIo`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => f.write_str("read"),
            IoOp::Write => f.write_str("write"),
        }
    }
}

/// Errors reported by a [`Channel`](crate::Channel).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid socket handle {fd}: {reason}")]
    InvalidHandle { fd: RawFd, reason: String },

    #[error("channel is closed")]
    ChannelClosed,

    #[error("a drain is already pending on this channel")]
    DrainAlreadyPending,

    #[error("write queue full: {queued} bytes queued, limit is {limit}")]
    QueueFull { queued: usize, limit: usize },

    #[error("socket {op} failed after {transferred} bytes: {source}")]
    SocketIo {
        op: IoOp,
        transferred: usize,
        #[source]
        source: io::Error,
    },
}

impl ChannelError {
    pub(crate) fn socket_io(op: IoOp, transferred: usize, source: io::Error) -> Self {
        ChannelError::SocketIo {
            op,
            transferred,
            source,
        }
    }

    /// Returns `true` when the error means the connection itself is gone.
    ///
    /// Resets, broken pipes and the like tear the channel down; other socket
    /// errors only fail the operation that hit them.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            ChannelError::SocketIo { source, .. } => is_fatal_kind(source.kind()),
            _ => false,
        }
    }

    /// The underlying OS error, if this is a [`ChannelError::SocketIo`].
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            ChannelError::SocketIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub(crate) fn is_fatal_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// A failed write: the bytes that never reached the socket and why.
#[derive(Debug, Error)]
#[error("{error} ({} bytes unsent)", unsent.len())]
pub struct WriteError {
    /// Suffix of the payload that was not accepted by the socket.
    pub unsent: Bytes,
    #[source]
    pub error: ChannelError,
}

impl WriteError {
    pub(crate) fn new(unsent: Bytes, error: ChannelError) -> Self {
        Self { unsent, error }
    }
}
