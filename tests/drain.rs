mod common;

use bytes::BytesMut;
use common::{Harness, ReadStep, ScriptedSocket, WriteLog, WriteStep};
use iochannel::{
    ByteReader, Channel, ChannelError, ChannelState, CloseReason, DrainOutcome, DrainResult, IoOp,
};
use std::io;
use std::sync::{Arc, Mutex};

type Drained = Arc<Mutex<Vec<(Vec<u8>, DrainResult)>>>;

fn recorder() -> (Drained, impl FnOnce(Vec<u8>, DrainResult) + Send + 'static) {
    let drained: Drained = Arc::default();
    let sink = drained.clone();
    let handler = move |bytes: Vec<u8>, result: DrainResult| {
        sink.lock().unwrap().push((bytes, result));
    };
    (drained, handler)
}

#[test_log::test]
fn drain_delivers_bytes_until_would_block() {
    let h = Harness::new();
    h.script
        .read(ReadStep::Data(b"hello ".to_vec()))
        .read(ReadStep::Data(b"world".to_vec()));

    let (drained, handler) = recorder();
    h.channel.drain(Vec::new(), handler);

    assert!(h.channel.interest().read);
    assert_eq!(h.script.read_calls(), 0, "reads wait for readiness");

    assert!(h.readable());

    let drained = drained.lock().unwrap();
    assert_eq!(drained.len(), 1);
    let (bytes, result) = &drained[0];
    assert_eq!(bytes, b"hello world");
    assert_eq!(
        result.as_ref().unwrap(),
        &DrainOutcome {
            bytes_read: 11,
            end_of_stream: false
        }
    );

    // Two chunks plus the read that would block.
    assert_eq!(h.script.read_calls(), 3);
    assert_eq!(h.channel.stats().bytes_read, 11);
    assert_eq!(h.channel.stats().reads, 2);
    assert!(!h.channel.interest().read);
    assert!(!h.readable());
}

#[test_log::test]
fn small_read_buffer_still_drains_everything() {
    let h = Harness::with_builder(iochannel::ChannelBuilder::new().read_buffer_size(3));
    h.script.read(ReadStep::Data(b"0123456789".to_vec()));

    let (drained, handler) = recorder();
    h.channel.drain(Vec::new(), handler);
    h.readable();

    let drained = drained.lock().unwrap();
    assert_eq!(drained[0].0, b"0123456789");
    assert_eq!(h.channel.stats().reads, 4);
}

#[test_log::test]
fn second_drain_is_rejected_while_one_is_pending() {
    let h = Harness::new();
    h.script.read(ReadStep::Data(b"abc".to_vec()));

    let (first, first_handler) = recorder();
    let (second, second_handler) = recorder();

    h.channel.drain(b"pre:".to_vec(), first_handler);
    h.channel.drain(vec![9, 9], second_handler);

    {
        let second = second.lock().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, vec![9, 9], "rejected reader comes back untouched");
        assert!(matches!(
            second[0].1,
            Err(ChannelError::DrainAlreadyPending)
        ));
    }
    assert!(first.lock().unwrap().is_empty());

    h.readable();

    let first = first.lock().unwrap();
    assert_eq!(first[0].0, b"pre:abc");
    assert_eq!(first[0].1.as_ref().unwrap().bytes_read, 3);
}

#[test_log::test]
fn zero_length_read_closes_exactly_once() {
    let h = Harness::new();
    let log = WriteLog::default();
    h.script
        .read(ReadStep::Data(b"bye".to_vec()))
        .read(ReadStep::Eof);

    let (drained, handler) = recorder();
    h.channel.write(&b"queued"[..], log.handler("queued"));
    h.channel.drain(Vec::new(), handler);
    h.readable();

    {
        let drained = drained.lock().unwrap();
        assert_eq!(drained[0].0, b"bye");
        assert_eq!(
            drained[0].1.as_ref().unwrap(),
            &DrainOutcome {
                bytes_read: 3,
                end_of_stream: true
            }
        );
    }

    assert_eq!(h.channel.state(), ChannelState::Closed);
    assert_eq!(h.channel.close_reason(), Some(CloseReason::PeerClosed));
    assert_eq!(h.cleanups(), 1);
    assert!(h.script.released());

    let results = log.take();
    assert!(matches!(
        results[0].1.as_ref().unwrap_err().error,
        ChannelError::ChannelClosed
    ));

    let reads = h.script.read_calls();

    h.channel.close();
    h.channel.write(&b"more"[..], log.handler("more"));
    let (late, late_handler) = recorder();
    h.channel.drain(Vec::new(), late_handler);
    assert!(!h.readable());

    assert_eq!(h.cleanups(), 1);
    assert_eq!(h.script.read_calls(), reads);
    assert_eq!(h.script.write_calls(), 0);
    assert!(matches!(
        late.lock().unwrap()[0].1,
        Err(ChannelError::ChannelClosed)
    ));
}

#[test_log::test]
fn fatal_read_error_reports_and_closes() {
    let h = Harness::new();
    h.script
        .read(ReadStep::Data(b"ab".to_vec()))
        .read(ReadStep::Fail(io::ErrorKind::ConnectionReset));

    let (drained, handler) = recorder();
    h.channel.drain(Vec::new(), handler);
    h.readable();

    let drained = drained.lock().unwrap();
    assert_eq!(drained[0].0, b"ab", "bytes read before the error are kept");
    match &drained[0].1 {
        Err(ChannelError::SocketIo {
            op, transferred, ..
        }) => {
            assert_eq!(*op, IoOp::Read);
            assert_eq!(*transferred, 2);
        }
        other => panic!("unexpected result {other:?}"),
    }

    assert_eq!(h.channel.close_reason(), Some(CloseReason::ReadFailed));
    assert_eq!(h.cleanups(), 1);
}

#[test_log::test]
fn interrupted_read_is_retried() {
    let h = Harness::new();
    h.script
        .read(ReadStep::Fail(io::ErrorKind::Interrupted))
        .read(ReadStep::Data(b"x".to_vec()));

    let (drained, handler) = recorder();
    h.channel.drain(Vec::new(), handler);
    h.readable();

    let drained = drained.lock().unwrap();
    assert_eq!(drained[0].0, b"x");
    assert_eq!(h.channel.state(), ChannelState::Active);
}

#[test_log::test]
fn drain_on_closed_channel_reports_closed() {
    let h = Harness::new();
    h.channel.close();

    let (drained, handler) = recorder();
    h.channel.drain(vec![1], handler);

    let drained = drained.lock().unwrap();
    assert_eq!(drained[0].0, vec![1]);
    assert!(matches!(drained[0].1, Err(ChannelError::ChannelClosed)));
}

#[test_log::test]
fn pending_drain_is_answered_before_cleanup() {
    let events = Arc::new(Mutex::new(Vec::new()));

    let (socket, _script) = common::ScriptedSocket::new();
    let registry = Arc::new(iochannel::ReadinessRegistry::new());
    let on_cleanup = events.clone();
    let channel = iochannel::Channel::with_socket(socket, registry, move || {
        on_cleanup.lock().unwrap().push("cleanup")
    });

    let on_drain = events.clone();
    channel.drain(Vec::new(), move |_bytes: Vec<u8>, result| {
        assert!(matches!(result, Err(ChannelError::ChannelClosed)));
        on_drain.lock().unwrap().push("drain");
    });

    channel.close();

    assert_eq!(*events.lock().unwrap(), vec!["drain", "cleanup"]);
}

#[test_log::test]
fn drains_can_be_rearmed_from_the_handler() {
    let h = Harness::new();
    h.script.read(ReadStep::Data(b"one".to_vec()));

    let collected = Arc::new(Mutex::new(Vec::new()));

    let channel = h.channel.clone();
    let sink = collected.clone();
    h.channel.drain(Vec::new(), move |bytes: Vec<u8>, result| {
        assert!(result.is_ok());
        sink.lock().unwrap().extend_from_slice(&bytes);

        let sink = sink.clone();
        channel.drain(bytes, move |bytes: Vec<u8>, result| {
            assert!(result.is_ok());
            *sink.lock().unwrap() = bytes;
        });
    });

    h.readable();
    assert_eq!(*collected.lock().unwrap(), b"one");
    assert!(h.channel.interest().read, "second drain is armed");

    h.script.read(ReadStep::Data(b"two".to_vec()));
    h.readable();
    assert_eq!(*collected.lock().unwrap(), b"onetwo");
}

#[test_log::test]
fn bytes_mut_reader_accumulates() {
    let h = Harness::new();
    h.script.read(ReadStep::Data(b"framed".to_vec()));

    let out = Arc::new(Mutex::new(BytesMut::new()));
    let sink = out.clone();
    h.channel
        .drain(BytesMut::with_capacity(64), move |buf: BytesMut, result| {
            assert_eq!(result.unwrap().bytes_read, 6);
            *sink.lock().unwrap() = buf;
        });
    h.readable();

    assert_eq!(&out.lock().unwrap()[..], b"framed");
}

struct ReplyingReader {
    channel: Channel<ScriptedSocket>,
    received: Vec<u8>,
    pending_seen: Vec<usize>,
}

impl ByteReader for ReplyingReader {
    fn append(&mut self, bytes: &[u8]) {
        self.received.extend_from_slice(bytes);
        self.channel.write(b"ack:".to_vec(), |result| assert!(result.is_ok()));
        self.pending_seen.push(self.channel.pending_writes());
    }
}

#[test_log::test]
fn reader_may_call_back_into_the_channel() {
    let h = Harness::new();
    h.script
        .read(ReadStep::Data(b"ping".to_vec()))
        .write(WriteStep::Accept(usize::MAX));

    let reader = ReplyingReader {
        channel: h.channel.clone(),
        received: Vec::new(),
        pending_seen: Vec::new(),
    };

    let done = Arc::new(Mutex::new(None));
    let sink = done.clone();
    h.channel
        .drain(reader, move |reader: ReplyingReader, result| {
            assert_eq!(result.unwrap().bytes_read, 4);
            *sink.lock().unwrap() = Some((reader.received, reader.pending_seen));
        });

    assert!(h.readable());

    let (received, pending_seen) = done.lock().unwrap().take().expect("drain answered");
    assert_eq!(received, b"ping");
    assert_eq!(pending_seen, vec![1]);

    assert!(h.writable());
    assert_eq!(h.script.written(), b"ack:");
    assert_eq!(h.channel.pending_writes(), 0);
}
