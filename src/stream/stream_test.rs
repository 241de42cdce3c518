use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;

use super::*;
use crate::message::MessageType;

/// Records every frame handed to it and lets tests simulate a send failure
/// or a terminal callback observation.
struct MockHost {
    sent: mpsc::UnboundedSender<Message>,
    terminal: mpsc::UnboundedSender<(u64, StreamRole)>,
    fail_next: StdMutex<bool>,
}

#[async_trait]
impl MuxerHandle for MockHost {
    async fn send(&self, msg: Message) -> Result<()> {
        let mut fail = self.fail_next.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(Error::MuxerClosed);
        }
        let _ = self.sent.send(msg);
        Ok(())
    }

    async fn on_stream_terminal(&self, id: u64, role: StreamRole) {
        let _ = self.terminal.send((id, role));
    }
}

fn make_stream(role: StreamRole) -> (Arc<Stream>, mpsc::UnboundedReceiver<Message>, mpsc::UnboundedReceiver<(u64, StreamRole)>) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (term_tx, term_rx) = mpsc::unbounded_channel();
    let host = Arc::new(MockHost {
        sent: sent_tx,
        terminal: term_tx,
        fail_next: StdMutex::new(false),
    });
    let stream = Arc::new(Stream::new(7, role, "s".to_string(), 4, host));
    (stream, sent_rx, term_rx)
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn initiator_start_sends_new_stream() {
    init_logger();
    let (stream, mut sent, _term) = make_stream(StreamRole::Initiator);
    stream.start().await.unwrap();
    let msg = sent.recv().await.unwrap();
    assert_eq!(msg.message_type, MessageType::NewStream);
    assert_eq!(msg.id, 7);
}

#[tokio::test]
async fn receiver_start_sends_nothing() {
    let (stream, mut sent, _term) = make_stream(StreamRole::Receiver);
    stream.start().await.unwrap();
    assert!(sent.try_recv().is_err());
}

#[tokio::test]
async fn double_start_is_rejected() {
    let (stream, _sent, _term) = make_stream(StreamRole::Receiver);
    stream.start().await.unwrap();
    assert_eq!(stream.start().await.unwrap_err(), Error::DoubleSink);
}

#[tokio::test]
async fn write_fragments_at_max_msg_size() {
    let (stream, mut sent, _term) = make_stream(StreamRole::Initiator);
    stream.start().await.unwrap();
    sent.recv().await.unwrap(); // NEW_STREAM

    tokio_test::assert_ok!(stream.write(b"abcdefg").await);
    let first = sent.recv().await.unwrap();
    let second = sent.recv().await.unwrap();
    assert_eq!(first.data, Bytes::from_static(b"abcd"));
    assert_eq!(second.data, Bytes::from_static(b"efg"));
}

#[tokio::test]
async fn read_blocks_until_pushed_then_returns_data() {
    let (stream, _sent, _term) = make_stream(StreamRole::Receiver);

    let reader = stream.clone();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    });

    tokio::task::yield_now().await;
    let mut list = ByteList::new();
    list.append(Bytes::from_static(b"hello"));
    stream.source_push(list).await;

    let got = handle.await.unwrap();
    assert_eq!(got, b"hello");
}

#[tokio::test]
async fn read_returns_eof_after_close_read_with_empty_buffer() {
    let (stream, _sent, _term) = make_stream(StreamRole::Receiver);
    stream.close_read().await;
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn end_after_close_read_fires_terminal_once_both_halves_done() {
    // Peer's CLOSE_* arrived first (closing our read side); our own end()
    // then closes the write side. Both halves are now ended, so the
    // terminal callback must fire even though end() was the call that
    // completed it, not close_write()/close().
    let (stream, mut sent, mut term) = make_stream(StreamRole::Receiver);
    stream.close_read().await;
    assert!(term.try_recv().is_err());

    stream.end().await.unwrap();
    let close_msg = sent.recv().await.unwrap();
    assert_eq!(close_msg.message_type, MessageType::CloseReceiver);

    let (id, role) = term.recv().await.unwrap();
    assert_eq!(id, 7);
    assert_eq!(role, StreamRole::Receiver);
    assert!(stream.close_time().await.is_some());
}

#[tokio::test]
async fn reset_ends_both_halves_with_reset_error() {
    let (stream, _sent, mut term) = make_stream(StreamRole::Receiver);
    stream.reset().await;

    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap_err(), Error::StreamReset);
    assert_eq!(stream.write(b"x").await.unwrap_err(), Error::SinkEnded);

    let (id, role) = term.recv().await.unwrap();
    assert_eq!(id, 7);
    assert_eq!(role, StreamRole::Receiver);
}

#[tokio::test]
async fn abort_ends_both_halves_without_sending_reset() {
    let (stream, mut sent, _term) = make_stream(StreamRole::Receiver);
    stream
        .abort(Error::StreamAborted("boom".to_string()))
        .await;
    assert!(sent.try_recv().is_err());

    let mut buf = [0u8; 16];
    match stream.read(&mut buf).await {
        Err(Error::StreamAborted(msg)) => assert_eq!(msg, "boom"),
        other => panic!("expected StreamAborted, got {other:?}"),
    }
}

#[tokio::test]
async fn close_sends_close_frame_and_fires_terminal_once_both_halves_done() {
    let (stream, mut sent, mut term) = make_stream(StreamRole::Initiator);
    stream.start().await.unwrap();
    sent.recv().await.unwrap(); // NEW_STREAM

    stream.close().await.unwrap();
    let close_msg = sent.recv().await.unwrap();
    assert_eq!(close_msg.message_type, MessageType::CloseInitiator);

    let (id, role) = term.recv().await.unwrap();
    assert_eq!(id, 7);
    assert_eq!(role, StreamRole::Initiator);
    assert!(stream.close_time().await.is_some());
}

#[tokio::test]
async fn failed_start_tears_down_stream_locally() {
    let (sent_tx, _sent_rx) = mpsc::unbounded_channel();
    let (term_tx, mut term_rx) = mpsc::unbounded_channel();
    let host = Arc::new(MockHost {
        sent: sent_tx,
        terminal: term_tx,
        fail_next: StdMutex::new(true),
    });
    let stream = Arc::new(Stream::new(9, StreamRole::Initiator, "s".into(), 4, host));
    let err = stream.start().await.unwrap_err();
    assert_eq!(err, Error::MuxerClosed);
    let (id, _) = term_rx.recv().await.unwrap();
    assert_eq!(id, 9);
}
