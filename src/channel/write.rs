//! Write side: the FIFO write queue and its partial-write state machine.
//!
//! A request is pending while queued, being sent while it is the head and
//! the socket accepts bytes, and ends exactly once: complete (cursor reached
//! the end), failed (a write syscall errored) or cancelled (channel closed).
//! Only the head is ever partially sent.

use super::dispatch::Completion;
use super::{ChannelState, CloseReason, Core};
use crate::error::{ChannelError, IoOp, WriteError};
use crate::reactor::{Direction, Readiness};
use crate::socket::Socket;

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use tracing::{trace, warn};

/// `Ok(n)` once all `n` bytes of the payload were accepted by the socket.
pub type WriteResult = Result<usize, WriteError>;

type WriteCallback = Box<dyn FnOnce(WriteResult) + Send>;

pub(crate) struct WriteRequest {
    payload: Bytes,
    cursor: usize,
    handler: WriteCallback,
}

impl WriteRequest {
    pub(crate) fn new<H>(payload: Bytes, handler: H) -> Self
    where
        H: FnOnce(WriteResult) + Send + 'static,
    {
        Self {
            payload,
            cursor: 0,
            handler: Box::new(handler),
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.payload[self.cursor..]
    }

    fn is_complete(&self) -> bool {
        self.cursor == self.payload.len()
    }

    fn complete(self) -> Completion {
        let WriteRequest {
            payload, handler, ..
        } = self;
        Box::new(move || handler(Ok(payload.len())))
    }

    pub(crate) fn fail(self, error: ChannelError) -> Completion {
        let WriteRequest {
            payload,
            cursor,
            handler,
        } = self;
        let unsent = payload.slice(cursor..);
        Box::new(move || handler(Err(WriteError::new(unsent, error))))
    }

    pub(crate) fn cancel(self) -> Completion {
        self.fail(ChannelError::ChannelClosed)
    }
}

pub(crate) struct WriteQueue {
    requests: VecDeque<WriteRequest>,
    queued_bytes: usize,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Bytes not yet accepted by the socket across all requests.
    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    fn push(&mut self, request: WriteRequest) {
        self.queued_bytes += request.remaining().len();
        self.requests.push_back(request);
    }

    fn head(&self) -> Option<&WriteRequest> {
        self.requests.front()
    }

    fn pop_head(&mut self) -> Option<WriteRequest> {
        let request = self.requests.pop_front()?;
        self.queued_bytes -= request.remaining().len();
        Some(request)
    }

    fn pop_tail(&mut self) -> Option<WriteRequest> {
        let request = self.requests.pop_back()?;
        self.queued_bytes -= request.remaining().len();
        Some(request)
    }

    /// Moves the head's cursor past `n` accepted bytes.
    fn advance_head(&mut self, n: usize) -> usize {
        match self.requests.front_mut() {
            Some(head) => {
                let n = n.min(head.payload.len() - head.cursor);
                head.cursor += n;
                self.queued_bytes -= n;
                n
            }
            None => 0,
        }
    }

    pub(crate) fn take_all(&mut self) -> VecDeque<WriteRequest> {
        self.queued_bytes = 0;
        std::mem::take(&mut self.requests)
    }
}

impl<S: Socket> Core<S> {
    pub(super) fn submit(&mut self, request: WriteRequest, completions: &mut Vec<Completion>) {
        if self.state != ChannelState::Active {
            completions.push(request.cancel());
            return;
        }

        if let Some(limit) = self.config.write_queue_limit {
            let queued = self.queue.queued_bytes();
            if queued + request.remaining().len() > limit {
                trace!(fd = self.fd, queued, limit, "write queue full");
                completions.push(request.fail(ChannelError::QueueFull { queued, limit }));
                return;
            }
        }

        let was_empty = self.queue.is_empty();
        self.queue.push(request);

        if was_empty && self.writable {
            self.flush(completions);
            return;
        }

        if let Err(err) = self.enable(Direction::Writable) {
            warn!(fd = self.fd, error = %err, "cannot register for writability");
            if let Some(request) = self.queue.pop_tail() {
                let error = ChannelError::socket_io(IoOp::Write, 0, err);
                completions.push(request.fail(error));
            }
            self.shutdown(CloseReason::WriteFailed, completions);
        }
    }

    pub(super) fn on_writable(&mut self, readiness: Readiness, completions: &mut Vec<Completion>) {
        if self.state != ChannelState::Active {
            return;
        }

        trace!(fd = self.fd, ?readiness, "socket writable");
        self.writable = true;
        self.flush(completions);
    }

    /// Sends from the head of the queue until it is empty, the socket would
    /// block, or the per-turn write budget is spent.
    fn flush(&mut self, completions: &mut Vec<Completion>) {
        let mut attempts = 0;

        loop {
            let Some(head) = self.queue.head() else {
                self.disable(Direction::Writable);
                return;
            };

            if head.is_complete() {
                if let Some(request) = self.queue.pop_head() {
                    completions.push(request.complete());
                }
                continue;
            }

            if attempts >= self.config.max_writes_per_turn {
                trace!(fd = self.fd, attempts, "write budget spent, yielding");
                self.rearm_writable(completions);
                return;
            }

            let Some(socket) = self.socket.as_mut() else {
                return;
            };

            attempts += 1;
            match socket.write(head.remaining()) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "write returned zero bytes");
                    if !self.fail_head(err, completions) {
                        return;
                    }
                }
                Ok(n) => {
                    let n = self.queue.advance_head(n);
                    self.stats.writes += 1;
                    self.stats.bytes_written += n as u64;
                    trace!(fd = self.fd, bytes = n, "wrote");
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    trace!(fd = self.fd, queued = self.queue.queued_bytes(), "write would block");
                    self.writable = false;
                    self.rearm_writable(completions);
                    return;
                }
                Err(err) => {
                    if !self.fail_head(err, completions) {
                        return;
                    }
                }
            }
        }
    }

    /// Fails the head request. Returns `false` if the error closed the channel.
    fn fail_head(&mut self, err: io::Error, completions: &mut Vec<Completion>) -> bool {
        let Some(request) = self.queue.pop_head() else {
            return true;
        };

        let error = ChannelError::socket_io(IoOp::Write, request.cursor, err);
        let fatal = error.is_connection_fatal();
        warn!(fd = self.fd, %error, fatal, "write failed");
        completions.push(request.fail(error));

        if fatal {
            self.shutdown(CloseReason::WriteFailed, completions);
            return false;
        }

        true
    }

    fn rearm_writable(&mut self, completions: &mut Vec<Completion>) {
        if let Err(err) = self.enable(Direction::Writable) {
            warn!(fd = self.fd, error = %err, "cannot register for writability");
            if let Some(request) = self.queue.pop_head() {
                let transferred = request.cursor;
                let error = ChannelError::socket_io(IoOp::Write, transferred, err);
                completions.push(request.fail(error));
            }
            self.shutdown(CloseReason::WriteFailed, completions);
        }
    }
}
