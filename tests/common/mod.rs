#![allow(dead_code)]

use iochannel::{
    Channel, ChannelBuilder, Direction, Readiness, ReadinessRegistry, Socket, WriteResult,
};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

pub enum WriteStep {
    /// Accept up to this many bytes.
    Accept(usize),
    WouldBlock,
    Fail(io::ErrorKind),
}

#[derive(Default)]
pub struct Script {
    reads: VecDeque<ReadStep>,
    writes: VecDeque<WriteStep>,
    written: Vec<u8>,
    read_calls: usize,
    write_calls: usize,
    released: bool,
}

/// Test-side view of a [`ScriptedSocket`]. An exhausted script would block.
#[derive(Clone, Default)]
pub struct ScriptHandle(Arc<Mutex<Script>>);

impl ScriptHandle {
    pub fn read(&self, step: ReadStep) -> &Self {
        self.0.lock().unwrap().reads.push_back(step);
        self
    }

    pub fn write(&self, step: WriteStep) -> &Self {
        self.0.lock().unwrap().writes.push_back(step);
        self
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.lock().unwrap().written.clone()
    }

    pub fn read_calls(&self) -> usize {
        self.0.lock().unwrap().read_calls
    }

    pub fn write_calls(&self) -> usize {
        self.0.lock().unwrap().write_calls
    }

    pub fn released(&self) -> bool {
        self.0.lock().unwrap().released
    }
}

static NEXT_FD: AtomicI32 = AtomicI32::new(10_000);

pub struct ScriptedSocket {
    fd: RawFd,
    script: ScriptHandle,
}

impl ScriptedSocket {
    pub fn new() -> (Self, ScriptHandle) {
        let script = ScriptHandle::default();
        let socket = Self {
            fd: NEXT_FD.fetch_add(1, Ordering::Relaxed),
            script: script.clone(),
        };
        (socket, script)
    }
}

impl AsRawFd for ScriptedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Socket for ScriptedSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.0.lock().unwrap();
        script.read_calls += 1;

        match script.reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    script.reads.push_front(ReadStep::Data(rest));
                }
                Ok(n)
            }
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fail(kind)) => Err(kind.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.script.0.lock().unwrap();
        script.write_calls += 1;

        match script.writes.pop_front() {
            None | Some(WriteStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(WriteStep::Accept(limit)) => {
                let n = limit.min(buf.len());
                script.written.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Some(WriteStep::Fail(kind)) => Err(kind.into()),
        }
    }
}

impl Drop for ScriptedSocket {
    fn drop(&mut self) {
        self.script.0.lock().unwrap().released = true;
    }
}

/// A scripted channel wired to a registry the test drives by hand.
pub struct Harness {
    pub channel: Channel<ScriptedSocket>,
    pub script: ScriptHandle,
    pub registry: Arc<ReadinessRegistry>,
    pub fd: RawFd,
    cleanups: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_builder(ChannelBuilder::new())
    }

    pub fn with_builder(builder: ChannelBuilder) -> Self {
        let (socket, script) = ScriptedSocket::new();
        let fd = socket.as_raw_fd();
        let registry = Arc::new(ReadinessRegistry::new());
        let cleanups = Arc::new(AtomicUsize::new(0));

        let counter = cleanups.clone();
        let channel = builder.with_socket(socket, registry.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        Self {
            channel,
            script,
            registry,
            fd,
            cleanups,
        }
    }

    /// Delivers a readability notification. Returns whether anyone listened.
    pub fn readable(&self) -> bool {
        self.registry
            .dispatch(self.fd, Direction::Readable, Readiness::Ready)
    }

    pub fn writable(&self) -> bool {
        self.registry
            .dispatch(self.fd, Direction::Writable, Readiness::Ready)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

/// Collects write results tagged with a label, in completion order.
#[derive(Clone, Default)]
pub struct WriteLog(Arc<Mutex<Vec<(&'static str, WriteResult)>>>);

impl WriteLog {
    pub fn handler(&self, label: &'static str) -> impl FnOnce(WriteResult) + Send + 'static {
        let log = self.0.clone();
        move |result| log.lock().unwrap().push((label, result))
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(|(label, _)| *label).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<(&'static str, WriteResult)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}
