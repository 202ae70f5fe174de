//! Read side: draining a readable socket into a caller-supplied reader.

use super::dispatch::Completion;
use super::{ChannelState, CloseReason, Core};
use crate::error::{ChannelError, IoOp};
use crate::reactor::{Direction, Readiness};
use crate::socket::Socket;

use bytes::{Bytes, BytesMut};
use std::io;
use tracing::{debug, trace, warn};

/// Destination for drained bytes.
///
/// Bytes are staged while the socket is read and handed over when the drain
/// finishes: `append` is called once per successful read, in socket order,
/// right before the drain handler runs. The channel is not locked at that
/// point, so `append` may write replies or drain again.
pub trait ByteReader: Send + 'static {
    fn append(&mut self, bytes: &[u8]);
}

impl ByteReader for Vec<u8> {
    fn append(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl ByteReader for BytesMut {
    fn append(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// What one drain delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Bytes appended to the reader by this drain.
    pub bytes_read: usize,
    /// The peer closed its side; the channel is closing.
    pub end_of_stream: bool,
}

pub type DrainResult = Result<DrainOutcome, ChannelError>;

trait PendingDrain: Send {
    fn finish(self: Box<Self>, chunks: Vec<Bytes>, result: DrainResult) -> Completion;
}

struct DrainRequest<R, H> {
    reader: R,
    handler: H,
}

impl<R, H> PendingDrain for DrainRequest<R, H>
where
    R: ByteReader,
    H: FnOnce(R, DrainResult) + Send + 'static,
{
    fn finish(self: Box<Self>, chunks: Vec<Bytes>, result: DrainResult) -> Completion {
        let DrainRequest { mut reader, handler } = *self;
        Box::new(move || {
            for chunk in &chunks {
                reader.append(chunk);
            }
            handler(reader, result)
        })
    }
}

/// The one outstanding drain of a channel and the chunks read for it so far.
pub(crate) struct DrainSlot {
    request: Box<dyn PendingDrain>,
    staging: BytesMut,
    chunks: Vec<Bytes>,
    bytes_read: usize,
}

impl DrainSlot {
    pub(crate) fn new<R, H>(reader: R, handler: H) -> Self
    where
        R: ByteReader,
        H: FnOnce(R, DrainResult) + Send + 'static,
    {
        Self {
            request: Box::new(DrainRequest { reader, handler }),
            staging: BytesMut::new(),
            chunks: Vec::new(),
            bytes_read: 0,
        }
    }

    fn stage(&mut self, bytes: &[u8]) {
        self.staging.extend_from_slice(bytes);
        self.chunks.push(self.staging.split().freeze());
        self.bytes_read += bytes.len();
    }

    fn outcome(&self, end_of_stream: bool) -> DrainOutcome {
        DrainOutcome {
            bytes_read: self.bytes_read,
            end_of_stream,
        }
    }

    /// The returned completion appends the staged chunks, then calls the
    /// handler.
    pub(crate) fn finish(self, result: DrainResult) -> Completion {
        self.request.finish(self.chunks, result)
    }
}

/// Answers a drain that never got to own the slot.
pub(crate) fn reject<R, H>(reader: R, handler: H, error: ChannelError) -> Completion
where
    R: ByteReader,
    H: FnOnce(R, DrainResult) + Send + 'static,
{
    Box::new(move || handler(reader, Err(error)))
}

impl<S: Socket> Core<S> {
    /// Reads until the socket would block, reports end of stream or fails.
    pub(super) fn on_readable(&mut self, readiness: Readiness, completions: &mut Vec<Completion>) {
        if self.state != ChannelState::Active {
            return;
        }

        if self.drain.is_none() {
            self.disable(Direction::Readable);
            return;
        }

        trace!(fd = self.fd, ?readiness, "socket readable");

        loop {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };

            match socket.read(&mut self.scratch) {
                Ok(0) => {
                    if let Some(slot) = self.drain.take() {
                        let outcome = slot.outcome(true);
                        debug!(
                            fd = self.fd,
                            bytes = outcome.bytes_read,
                            "drain reached end of stream"
                        );
                        completions.push(slot.finish(Ok(outcome)));
                    }
                    self.shutdown(CloseReason::PeerClosed, completions);
                    return;
                }
                Ok(n) => {
                    let n = n.min(self.scratch.len());
                    self.stats.reads += 1;
                    self.stats.bytes_read += n as u64;
                    if let Some(slot) = self.drain.as_mut() {
                        slot.stage(&self.scratch[..n]);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    trace!(fd = self.fd, "read would block");
                    self.disable(Direction::Readable);
                    if let Some(slot) = self.drain.take() {
                        let outcome = slot.outcome(false);
                        debug!(fd = self.fd, bytes = outcome.bytes_read, "drain complete");
                        completions.push(slot.finish(Ok(outcome)));
                    }
                    return;
                }
                Err(err) => {
                    warn!(fd = self.fd, error = %err, "read failed");
                    if let Some(slot) = self.drain.take() {
                        let error = ChannelError::socket_io(IoOp::Read, slot.bytes_read, err);
                        completions.push(slot.finish(Err(error)));
                    }
                    self.shutdown(CloseReason::ReadFailed, completions);
                    return;
                }
            }
        }
    }
}
