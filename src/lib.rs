//! Event-driven I/O channel over a single non-blocking stream socket.
//!
//! This crate decouples socket readiness from the code consuming a socket.
//! Readers receive every byte available at a readiness notification, writers
//! queue payloads that are sent across as many partial writes as it takes,
//! and each request is answered exactly once.
//!
//! # Architecture
//!
//! - **Channel**: owns the socket, drives the read drain and the write queue,
//!   and tears everything down exactly once
//! - **EventSource**: the readiness notification seam (epoll, kqueue, a run
//!   loop...); the channel only registers and unregisters handlers
//! - **ReadinessRegistry**: handler table plus a `poll(2)` driver for
//!   embedding channels in a simple loop
//! - **Socket**: the non-blocking read/write seam, backed by [`NativeSocket`]
//! - **ChannelBuilder**: fluent configuration

mod builder;
mod channel;
mod error;
pub mod reactor;
mod socket;

pub use builder::{ChannelBuilder, DEFAULT_MAX_WRITES_PER_TURN, DEFAULT_READ_BUFFER_SIZE};
pub use channel::{
    ByteReader, Channel, ChannelState, ChannelStats, CloseReason, DrainOutcome, DrainResult,
    WriteResult,
};
pub use error::{ChannelError, IoOp, WriteError};
pub use reactor::{Direction, EventSource, Interest, Readiness, ReadinessHandler, ReadinessRegistry};
pub use socket::{NativeSocket, Socket};
