//! The per-connection multiplexer.
//!
//! Owns the two stream registries, the decoder/encoder pair, the inbound-cap
//! rate limiter, and the task that reads the transport and dispatches
//! decoded frames to streams. This is the largest component here and
//! the thing everything else (codec, streams) exists to serve.

#[cfg(test)]
mod multiplexer_test;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::byte_list::ByteList;
use crate::codec::decoder::Decoder;
use crate::codec::encoder::Encoder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{opposite_reset_type, Message, MessageType};
use crate::rate_limiter::TokenBucket;
use crate::stream::{MuxerHandle, Stream, StreamRole};

/// Bytes read from the transport per `read()` call.
const READ_BUF_SIZE: usize = 65536;

/// A bidirectional endpoint sitting on top of one transport connection.
///
/// `Muxer` owns the connection-level state: two
/// disjoint stream registries, a monotonically increasing initiator-id
/// counter, the decoder/encoder pair, the inbound-cap rate limiter, and the
/// close latch. A background task drives the read side; `new_stream` and the
/// per-stream write path drive the write side directly.
pub struct Muxer {
    inner: Arc<Inner>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Arc<Stream>>>,
    ended_rx: Mutex<mpsc::UnboundedReceiver<Arc<Stream>>>,
    read_task: JoinHandle<()>,
}

struct Inner {
    config: Config,
    initiators: Mutex<HashMap<u64, Arc<Stream>>>,
    receivers: Mutex<HashMap<u64, Arc<Stream>>>,
    next_initiator_id: AtomicU64,
    encoder: Mutex<Encoder>,
    writer: Mutex<Pin<BoxedWriter>>,
    closed: AtomicBool,
    rate_limiter: TokenBucket,
    // `None` once `close` has run: dropping the sender half closes the
    // channel, so a caller blocked in `accept_stream`/`next_ended_stream`
    // drains whatever is already queued and then sees `recv()` resolve to
    // `None`, regardless of which code path (explicit `Muxer::close`, a
    // fatal dispatch error, or transport EOF) triggered the close.
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Arc<Stream>>>>,
    ended_tx: Mutex<Option<mpsc::UnboundedSender<Arc<Stream>>>>,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxes `w` as a trait object. A standalone function with an explicit
/// return type gives the compiler a coercion site for `Pin<Box<W>>` ->
/// `Pin<Box<dyn AsyncWrite + Send + Unpin>>`, which a struct-literal field
/// initializer does not.
fn box_writer<W: AsyncWrite + Send + Unpin + 'static>(w: W) -> Pin<BoxedWriter> {
    Box::pin(w)
}

impl Muxer {
    /// Wraps `transport` (any reliable, in-order, duplex byte channel) as an
    /// mplex endpoint, and spawns the background task that reads and
    /// dispatches inbound frames.
    pub fn new<T>(transport: T, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer): (ReadHalf<T>, WriteHalf<T>) = tokio::io::split(transport);
        Self::from_halves(reader, writer, config)
    }

    /// Like [`Muxer::new`], but takes independent read/write halves. Useful
    /// when the transport is already split (e.g. a duplex pair built from two
    /// unidirectional channels).
    pub fn from_halves<R, W>(reader: R, writer: W, config: Config) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            rate_limiter: TokenBucket::new(config.disconnect_threshold),
            config,
            initiators: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            next_initiator_id: AtomicU64::new(0),
            encoder: Mutex::new(Encoder::new()),
            writer: Mutex::new(box_writer(writer)),
            closed: AtomicBool::new(false),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            ended_tx: Mutex::new(Some(ended_tx)),
        });

        let read_task = tokio::spawn(read_loop(inner.clone(), reader));

        Muxer {
            inner,
            incoming_rx: Mutex::new(incoming_rx),
            ended_rx: Mutex::new(ended_rx),
            read_task,
        }
    }

    /// Opens a new initiator-side stream and sends its `NEW_STREAM` frame.
    /// Fails with [`Error::MuxerClosed`] or
    /// [`Error::TooManyOutboundStreams`] without registering anything.
    pub async fn new_stream(&self, name: Option<String>) -> Result<Arc<Stream>> {
        self.inner.new_stream(name).await
    }

    /// Destroys every live stream with `err` (or [`Error::MuxerClosed`] if
    /// none given) and latches closed. Idempotent.
    pub async fn close(&self, err: Option<Error>) {
        self.inner.close(err).await;
    }

    /// Snapshot of every currently-registered stream, both sides concatenated.
    pub async fn streams(&self) -> Vec<Arc<Stream>> {
        self.inner.streams().await
    }

    /// Awaits the next receiver-side stream created by an inbound
    /// `NEW_STREAM`. Returns `None` once the multiplexer is closed and no
    /// more are pending.
    pub async fn accept_stream(&self) -> Option<Arc<Stream>> {
        self.incoming_rx.lock().await.recv().await
    }

    /// Awaits the next stream whose both halves have ended and which has
    /// just been removed from its registry. Returns `None` once the
    /// multiplexer is closed and no more are pending.
    pub async fn next_ended_stream(&self) -> Option<Arc<Stream>> {
        self.ended_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Background task body: reads raw bytes from `reader`, feeds them to the
/// decoder, and dispatches every resulting message in order. The next
/// physical read never begins decoding/dispatch until the previous batch is
/// fully dispatched — trivially true here since this is the only task that
/// ever touches the decoder or dispatches.
async fn read_loop<R>(inner: Arc<Inner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    log::debug!("read_loop entered");
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    'read: loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!("transport read returned EOF, closing muxer");
                inner.close(Some(Error::Io("transport closed".to_string()))).await;
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::warn!("failed to read from transport: {e}");
                inner.close(Some(Error::from(e))).await;
                break;
            }
        };
        log::trace!("read {n} bytes from transport");

        let messages = match decoder.write(Bytes::copy_from_slice(&buf[..n])) {
            Ok(messages) => messages,
            Err(e) => {
                // InvalidType: unrecoverable protocol violation.
                log::warn!("decoder rejected inbound frame: {e}");
                inner.close(Some(e)).await;
                break;
            }
        };

        for msg in messages {
            if inner.dispatch(msg).await.is_err() {
                // Only a fatal dispatch error (TooManyOpenStreams) returns
                // Err here; the multiplexer has already closed itself.
                break 'read;
            }
        }
    }
    log::debug!("read_loop exited");
}

impl Inner {
    async fn new_stream(self: &Arc<Self>, name: Option<String>) -> Result<Arc<Stream>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::MuxerClosed);
        }

        let stream = {
            let mut initiators = self.initiators.lock().await;
            if initiators.len() >= self.config.max_outbound_streams {
                return Err(Error::TooManyOutboundStreams);
            }
            let id = self.next_initiator_id.fetch_add(1, Ordering::SeqCst);
            let name = name.unwrap_or_else(|| id.to_string());
            let stream = Arc::new(Stream::new(
                id,
                StreamRole::Initiator,
                name,
                self.config.max_msg_size,
                self.clone() as Arc<dyn MuxerHandle>,
            ));
            initiators.insert(id, stream.clone());
            stream
        };
        log::debug!("opened outbound stream i{}", stream.id());
        // Synchronous construction triggers NEW_STREAM emission.
        stream.start().await?;
        Ok(stream)
    }

    async fn close(self: &Arc<Self>, err: Option<Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let err = err.unwrap_or(Error::MuxerClosed);
        log::debug!("closing muxer: {err}");

        let streams = self.streams().await;
        for stream in streams {
            stream.abort(err.clone()).await;
        }

        // Dropping the sender halves closes both channels: a caller parked in
        // `accept_stream`/`next_ended_stream` drains whatever is already
        // queued and then observes `recv()` resolve to `None`.
        self.incoming_tx.lock().await.take();
        self.ended_tx.lock().await.take();
    }

    async fn streams(&self) -> Vec<Arc<Stream>> {
        let initiators = self.initiators.lock().await;
        let receivers = self.receivers.lock().await;
        initiators
            .values()
            .cloned()
            .chain(receivers.values().cloned())
            .collect()
    }

    /// Inbound dispatch for one decoded frame.
    async fn dispatch(self: &Arc<Self>, msg: Message) -> Result<()> {
        if msg.message_type == MessageType::NewStream {
            self.handle_new_stream(msg).await
        } else {
            self.handle_stream_frame(msg).await;
            Ok(())
        }
    }

    async fn handle_new_stream(self: &Arc<Self>, msg: Message) -> Result<()> {
        let at_cap = {
            let receivers = self.receivers.lock().await;
            receivers.len() == self.config.max_inbound_streams
        };

        if at_cap {
            log::warn!(
                "rejecting NEW_STREAM id={} over inbound cap {}",
                msg.id,
                self.config.max_inbound_streams
            );
            let reset = Message::control(msg.id, MessageType::ResetReceiver);
            let _ = self.send(reset).await;

            if !self.rate_limiter.try_consume().await {
                log::warn!("disconnect_threshold breached, destroying muxer");
                self.close(Some(Error::TooManyOpenStreams)).await;
                return Err(Error::TooManyOpenStreams);
            }
            return Ok(());
        }

        let name = String::from_utf8_lossy(&msg.data).into_owned();
        log::debug!("accepted inbound stream r{} name={name:?}", msg.id);
        let stream = Arc::new(Stream::new(
            msg.id,
            StreamRole::Receiver,
            name,
            self.config.max_msg_size,
            self.clone() as Arc<dyn MuxerHandle>,
        ));
        {
            let mut receivers = self.receivers.lock().await;
            receivers.insert(msg.id, stream.clone());
        }
        // A receiver's start() sends nothing; it only flips sink_started.
        let _ = stream.start().await;
        if let Some(tx) = self.incoming_tx.lock().await.as_ref() {
            let _ = tx.send(stream);
        }
        Ok(())
    }

    async fn handle_stream_frame(self: &Arc<Self>, msg: Message) {
        let to_initiators = msg.message_type.routes_to_initiators_map();
        let stream = {
            let map = if to_initiators {
                self.initiators.lock().await
            } else {
                self.receivers.lock().await
            };
            map.get(&msg.id).cloned()
        };

        let stream = match stream {
            Some(s) => s,
            None => {
                log::debug!(
                    "dropping {:?} for unknown stream id={}",
                    msg.message_type,
                    msg.id
                );
                return;
            }
        };

        match msg.message_type {
            MessageType::MessageInitiator | MessageType::MessageReceiver => {
                if stream.source_readable_length() > self.config.max_stream_buffer_size {
                    log::warn!(
                        "stream id={} exceeded max_stream_buffer_size={}, resetting",
                        msg.id,
                        self.config.max_stream_buffer_size
                    );
                    if let Ok(reset_type) = opposite_reset_type(msg.message_type) {
                        let reset = Message::control(msg.id, reset_type);
                        let _ = self.send(reset).await;
                    }
                    stream.abort(Error::InputBufferFull).await;
                } else {
                    let mut data = ByteList::new();
                    data.append(msg.data);
                    stream.source_push(data).await;
                }
            }
            MessageType::CloseInitiator | MessageType::CloseReceiver => {
                stream.close_read().await;
            }
            MessageType::ResetInitiator | MessageType::ResetReceiver => {
                stream.reset().await;
            }
            MessageType::NewStream => unreachable!("NewStream routed separately"),
        }
    }
}

#[async_trait]
impl MuxerHandle for Inner {
    async fn send(&self, msg: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::MuxerClosed);
        }
        let chunks = {
            let mut encoder = self.encoder.lock().await;
            encoder.write(&msg)
        };
        let mut writer = self.writer.lock().await;
        for chunk in chunks {
            writer.write_all(&chunk).await.map_err(Error::from)?;
        }
        Ok(())
    }

    async fn on_stream_terminal(&self, id: u64, role: StreamRole) {
        let removed = match role {
            StreamRole::Initiator => self.initiators.lock().await.remove(&id),
            StreamRole::Receiver => self.receivers.lock().await.remove(&id),
        };
        if let Some(stream) = removed {
            if let Some(tx) = self.ended_tx.lock().await.as_ref() {
                let _ = tx.send(stream);
            }
        }
    }
}
