//! Per-stream state machine and its `AsyncRead`/`AsyncWrite` adapter.

#[cfg(test)]
mod stream_test;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, Notify};

use crate::byte_list::ByteList;
use crate::error::{Error, Result};
use crate::message::{Message, MessageType};

/// Which side opened this stream. Direction suffixes on wire types encode
/// the sender's role.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamRole {
    Initiator,
    Receiver,
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRole::Initiator => write!(f, "initiator"),
            StreamRole::Receiver => write!(f, "receiver"),
        }
    }
}

/// The narrow async surface a [`Stream`] needs from its owning multiplexer:
/// send an outbound frame, and learn that both halves have ended so the
/// multiplexer can drop it from its registry and fire the end-of-stream
/// callback. A trait object, rather than a generic parameter, keeps `Stream`
/// free of the transport's concrete type.
#[async_trait]
pub(crate) trait MuxerHandle: Send + Sync {
    async fn send(&self, msg: Message) -> Result<()>;
    async fn on_stream_terminal(&self, id: u64, role: StreamRole);
}

/// A logical, ordered, bytewise duplex channel multiplexed within a connection.
pub struct Stream {
    id: u64,
    role: StreamRole,
    name: String,
    open_time: Instant,
    close_time: Mutex<Option<Instant>>,
    max_msg_size: usize,
    host: Arc<dyn MuxerHandle>,

    source_ended: AtomicBool,
    sink_ended: AtomicBool,
    sink_started: AtomicBool,
    end_error: Mutex<Option<Error>>,

    // One-shot local-cancellation markers, set by close_write/reset/abort.
    // Consulted only if the initial NEW_STREAM send in `start` fails, so a
    // concurrent local teardown can be told apart from a genuine transport
    // failure.
    close_requested: AtomicBool,
    reset_requested: AtomicBool,
    abort_requested: AtomicBool,

    read_buf: Mutex<VecDeque<Bytes>>,
    readable_len: AtomicUsize,
    read_notify: Notify,

    pending_outbound: Mutex<ByteList>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("name", &self.name)
            .field("source_ended", &self.source_ended.load(Ordering::SeqCst))
            .field("sink_ended", &self.sink_ended.load(Ordering::SeqCst))
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        role: StreamRole,
        name: String,
        max_msg_size: usize,
        host: Arc<dyn MuxerHandle>,
    ) -> Self {
        Stream {
            id,
            role,
            name,
            open_time: Instant::now(),
            close_time: Mutex::new(None),
            max_msg_size,
            host,
            source_ended: AtomicBool::new(false),
            sink_ended: AtomicBool::new(false),
            sink_started: AtomicBool::new(false),
            end_error: Mutex::new(None),
            close_requested: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            read_buf: Mutex::new(VecDeque::new()),
            readable_len: AtomicUsize::new(0),
            read_notify: Notify::new(),
            pending_outbound: Mutex::new(ByteList::new()),
        }
    }

    /// The wire id, as chosen by the initiator.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    /// `"i{id}"` for an initiator-side stream, `"r{id}"` for a receiver-side
    /// one. Unique within a given multiplexer only.
    pub fn external_id(&self) -> String {
        match self.role {
            StreamRole::Initiator => format!("i{}", self.id),
            StreamRole::Receiver => format!("r{}", self.id),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open_time(&self) -> Instant {
        self.open_time
    }

    pub async fn close_time(&self) -> Option<Instant> {
        *self.close_time.lock().await
    }

    /// Performs this stream's one-time start action: an initiator sends
    /// `NEW_STREAM`; a receiver does nothing but still marks its sink
    /// started. Called once by the multiplexer, but the `Arc<Stream>` is
    /// already registered in the multiplexer's registry by the time this
    /// runs, so a concurrent `close`/`reset`/`abort` from another task (e.g.
    /// a racing `Muxer::close`) can legitimately land first — `start`
    /// discriminates that case from a genuine send failure before surfacing
    /// an error to the caller.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        if self.sink_started.swap(true, Ordering::SeqCst) {
            return Err(Error::DoubleSink);
        }

        if self.role == StreamRole::Initiator {
            let msg = Message::new_stream(self.id, &self.name);
            if let Err(e) = self.host.send(msg).await {
                return Err(self.handle_start_failure(e).await);
            }
        }
        Ok(())
    }

    /// Translates a failed initial `NEW_STREAM` send into the right local
    /// error, checking for a racing local cancellation in close → reset →
    /// abort precedence. If none of those requested the teardown, this is an
    /// unexpected transport failure: the stream ends locally and a
    /// best-effort `RESET_*` is sent to tell the peer, swallowing any
    /// failure of that second send.
    async fn handle_start_failure(self: &Arc<Self>, e: Error) -> Error {
        if self.close_requested.load(Ordering::SeqCst) {
            self.end_both(None).await;
            return Error::StreamClosed;
        }
        if self.reset_requested.load(Ordering::SeqCst) {
            self.end_both(Some(Error::StreamReset)).await;
            return Error::StreamReset;
        }
        if self.abort_requested.load(Ordering::SeqCst) {
            let latched = self.end_error.lock().await.clone();
            self.end_both(latched.clone()).await;
            return latched.unwrap_or(e);
        }
        log::warn!("[{}] NEW_STREAM send failed: {e}", self.external_id());
        self.end_both(Some(e.clone())).await;
        self.try_send_reset().await;
        e
    }

    /// Best-effort notification to the peer that this stream has ended
    /// abnormally. Failure is swallowed: if the transport can't carry this
    /// frame either, there is nothing more this stream can do about it.
    async fn try_send_reset(&self) {
        let msg = Message::control(self.id, self.reset_type());
        let _ = self.host.send(msg).await;
    }

    fn message_type(&self) -> MessageType {
        match self.role {
            StreamRole::Initiator => MessageType::MessageInitiator,
            StreamRole::Receiver => MessageType::MessageReceiver,
        }
    }

    fn close_type(&self) -> MessageType {
        match self.role {
            StreamRole::Initiator => MessageType::CloseInitiator,
            StreamRole::Receiver => MessageType::CloseReceiver,
        }
    }

    fn reset_type(&self) -> MessageType {
        match self.role {
            StreamRole::Initiator => MessageType::ResetInitiator,
            StreamRole::Receiver => MessageType::ResetReceiver,
        }
    }

    /// Appends `buf` to the pending outbound byte-list, then drains it,
    /// fragmenting at `max_msg_size`.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.sink_ended.load(Ordering::SeqCst) {
            return Err(Error::SinkEnded);
        }

        let mut pending = self.pending_outbound.lock().await;
        pending.append(Bytes::copy_from_slice(buf));

        while !pending.is_empty() {
            let take = pending.len().min(self.max_msg_size);
            let chunk = pending.sublist(0, take).to_bytes();
            pending.consume(take);

            let msg = Message::data_message(self.id, self.message_type(), chunk);
            self.host.send(msg).await?;
        }
        Ok(())
    }

    /// Drains any pending output, then half-closes the write side, sending
    /// `CLOSE_*` to the peer. If the source half is also already ended, the
    /// stream is now fully ended.
    pub async fn end(self: &Arc<Self>) -> Result<()> {
        if self.sink_ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let msg = Message::control(self.id, self.close_type());
        let result = self.host.send(msg).await;
        self.maybe_finish().await;
        result
    }

    /// Half-closes both directions locally.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.close_read().await;
        self.close_write().await
    }

    /// Marks the source half ended, waking any pending reader with EOF. If
    /// the sink half is also already ended, the stream is now fully ended.
    pub async fn close_read(self: &Arc<Self>) {
        if self.source_ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.read_notify.notify_waiters();
        self.maybe_finish().await;
    }

    /// Sends `CLOSE_*` to the peer and marks the sink half ended. If the
    /// source half is also already ended, the stream is now fully ended.
    pub async fn close_write(self: &Arc<Self>) -> Result<()> {
        self.close_requested.store(true, Ordering::SeqCst);
        if self.sink_ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let msg = Message::control(self.id, self.close_type());
        let result = self.host.send(msg).await;
        self.maybe_finish().await;
        result
    }

    /// Local error path: ends both halves quietly, recording `err` for the
    /// next reader. Never itself sends `RESET_*` to the peer.
    pub async fn abort(self: &Arc<Self>, err: Error) {
        log::debug!("[{}] aborting: {err}", self.external_id());
        self.abort_requested.store(true, Ordering::SeqCst);
        self.end_both(Some(err)).await;
    }

    /// Invoked by the multiplexer when the peer sent `RESET_*`: ends both
    /// halves immediately with a synthetic reset error. No frame is sent;
    /// the peer already knows.
    pub(crate) async fn reset(self: &Arc<Self>) {
        log::debug!("[{}] reset by peer", self.external_id());
        self.reset_requested.store(true, Ordering::SeqCst);
        self.end_both(Some(Error::StreamReset)).await;
    }

    async fn end_both(self: &Arc<Self>, err: Option<Error>) {
        if let Some(e) = err {
            let mut slot = self.end_error.lock().await;
            if slot.is_none() {
                *slot = Some(e);
            }
        }
        self.source_ended.store(true, Ordering::SeqCst);
        self.read_notify.notify_waiters();
        self.sink_ended.store(true, Ordering::SeqCst);
        self.maybe_finish().await;
    }

    /// If both halves are now ended, latches `close_time` and tells the
    /// multiplexer to drop this stream from its registry.
    async fn maybe_finish(self: &Arc<Self>) {
        if self.source_ended.load(Ordering::SeqCst) && self.sink_ended.load(Ordering::SeqCst) {
            {
                let mut close_time = self.close_time.lock().await;
                if close_time.is_none() {
                    *close_time = Some(Instant::now());
                    log::debug!("[{}] both halves ended", self.external_id());
                }
            }
            self.host.on_stream_terminal(self.id, self.role).await;
        }
    }

    /// Number of bytes currently queued for the application to read.
    pub fn source_readable_length(&self) -> usize {
        self.readable_len.load(Ordering::SeqCst)
    }

    /// Pushes inbound payload chunks into the readable buffer, one physical
    /// chunk at a time, and wakes a pending reader.
    pub(crate) async fn source_push(&self, data: ByteList) {
        if data.is_empty() {
            return;
        }
        let mut added = 0usize;
        {
            let mut buf = self.read_buf.lock().await;
            for chunk in data.chunks() {
                added += chunk.len();
                buf.push_back(chunk.clone());
            }
        }
        let readable = self.readable_len.fetch_add(added, Ordering::SeqCst) + added;
        log::trace!("[{}] readable={}", self.external_id(), readable);
        self.read_notify.notify_one();
    }

    /// Reads up to `out.len()` bytes. Returns `Ok(0)` at EOF (source ended,
    /// buffer drained, no error latched). Returns the latched error if the
    /// source ended abnormally (reset/abort).
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        loop {
            {
                let mut buf = self.read_buf.lock().await;
                if let Some(front) = buf.front_mut() {
                    let n = front.len().min(out.len());
                    out[..n].copy_from_slice(&front[..n]);
                    if n == front.len() {
                        buf.pop_front();
                    } else {
                        *front = front.slice(n..);
                    }
                    self.readable_len.fetch_sub(n, Ordering::SeqCst);
                    return Ok(n);
                }
            }

            if self.source_ended.load(Ordering::SeqCst) {
                let err = self.end_error.lock().await.clone();
                return match err {
                    Some(e) => Err(e),
                    None => Ok(0),
                };
            }

            self.read_notify.notified().await;
        }
    }
}

/// Default capacity of the temporary read buffer used by [`PollStream`].
const DEFAULT_READ_BUF_SIZE: usize = 8192;

/// State of the read `Future` in [`PollStream`].
enum ReadFut {
    Idle,
    Reading(Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>),
    RemainingData(Vec<u8>),
}

impl ReadFut {
    /// # Panics
    /// Panics if `ReadFut` is not `Reading`.
    fn get_reading_mut(&mut self) -> &mut Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>> {
        match self {
            ReadFut::Reading(ref mut fut) => fut,
            _ => panic!("expected ReadFut to be Reading"),
        }
    }
}

enum ShutdownFut {
    Idle,
    ShuttingDown(Pin<Box<dyn Future<Output = Result<()>> + Send>>),
    Done,
    Errored(Error),
}

impl ShutdownFut {
    /// # Panics
    /// Panics if `ShutdownFut` is not `ShuttingDown`.
    fn get_shutting_down_mut(&mut self) -> &mut Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        match self {
            ShutdownFut::ShuttingDown(ref mut fut) => fut,
            _ => panic!("expected ShutdownFut to be ShuttingDown"),
        }
    }
}

/// A wrapper around [`Stream`] implementing `AsyncRead`/`AsyncWrite`, for
/// callers who want to treat a logical stream as a plain Tokio byte stream.
///
/// Both `poll_read` and `poll_write` allocate temporary buffers, which costs
/// a bit of overhead per call.
pub struct PollStream {
    stream: Arc<Stream>,

    read_fut: ReadFut,
    write_fut: Option<Pin<Box<dyn Future<Output = Result<()>> + Send>>>,
    shutdown_fut: ShutdownFut,

    read_buf_cap: usize,
}

impl PollStream {
    pub fn new(stream: Arc<Stream>) -> Self {
        Self {
            stream,
            read_fut: ReadFut::Idle,
            write_fut: None,
            shutdown_fut: ShutdownFut::Idle,
            read_buf_cap: DEFAULT_READ_BUF_SIZE,
        }
    }

    #[must_use]
    pub fn into_inner(self) -> Arc<Stream> {
        self.stream
    }

    #[must_use]
    pub fn clone_inner(&self) -> Arc<Stream> {
        self.stream.clone()
    }

    pub fn id(&self) -> u64 {
        self.stream.id
    }

    /// Set the capacity of the temporary read buffer (default: 8192).
    pub fn set_read_buf_capacity(&mut self, capacity: usize) {
        self.read_buf_cap = capacity;
    }
}

impl AsyncRead for PollStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let fut = match self.read_fut {
            ReadFut::Idle => {
                let stream = self.stream.clone();
                let mut temp_buf = vec![0; self.read_buf_cap];
                self.read_fut = ReadFut::Reading(Box::pin(async move {
                    stream.read(temp_buf.as_mut_slice()).await.map(|n| {
                        temp_buf.truncate(n);
                        temp_buf
                    })
                }));
                self.read_fut.get_reading_mut()
            }
            ReadFut::Reading(ref mut fut) => fut,
            ReadFut::RemainingData(ref mut data) => {
                let remaining = buf.remaining();
                let len = std::cmp::min(data.len(), remaining);
                buf.put_slice(&data[..len]);
                if data.len() > remaining {
                    data.drain(0..len);
                } else {
                    self.read_fut = ReadFut::Idle;
                }
                return Poll::Ready(Ok(()));
            }
        };

        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(temp_buf)) if temp_buf.is_empty() => {
                self.read_fut = ReadFut::Idle;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(mut temp_buf)) => {
                let remaining = buf.remaining();
                let len = std::cmp::min(temp_buf.len(), remaining);
                buf.put_slice(&temp_buf[..len]);
                if temp_buf.len() > remaining {
                    temp_buf.drain(0..len);
                    self.read_fut = ReadFut::RemainingData(temp_buf);
                } else {
                    self.read_fut = ReadFut::Idle;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.read_fut = ReadFut::Idle;
                Poll::Ready(Err(e.into()))
            }
        }
    }
}

impl AsyncWrite for PollStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if let Some(fut) = self.write_fut.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(result) => {
                    self.write_fut = None;
                    match result {
                        Ok(()) => Poll::Ready(Ok(buf.len())),
                        Err(e) => Poll::Ready(Err(e.into())),
                    }
                }
            }
        } else {
            let stream = self.stream.clone();
            let bytes = buf.to_vec();
            let fut = self
                .write_fut
                .insert(Box::pin(async move { stream.write(&bytes).await }));

            match fut.as_mut().poll(cx) {
                // The data has already been handed off to an owned future, so
                // it's safe to report it as written even while pending.
                Poll::Pending => Poll::Ready(Ok(buf.len())),
                Poll::Ready(Ok(())) => {
                    self.write_fut = None;
                    Poll::Ready(Ok(buf.len()))
                }
                Poll::Ready(Err(e)) => {
                    self.write_fut = None;
                    Poll::Ready(Err(e.into()))
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.write_fut.as_mut() {
            Some(fut) => match fut.as_mut().poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(result) => {
                    self.write_fut = None;
                    Poll::Ready(result.map_err(Into::into))
                }
            },
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if let Poll::Pending = self.as_mut().poll_flush(cx) {
            return Poll::Pending;
        }

        let fut = match self.shutdown_fut {
            ShutdownFut::Done => return Poll::Ready(Ok(())),
            ShutdownFut::Errored(ref err) => return Poll::Ready(Err(err.clone().into())),
            ShutdownFut::ShuttingDown(ref mut fut) => fut,
            ShutdownFut::Idle => {
                let stream = self.stream.clone();
                self.shutdown_fut =
                    ShutdownFut::ShuttingDown(Box::pin(async move { stream.close_write().await }));
                self.shutdown_fut.get_shutting_down_mut()
            }
        };

        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                self.shutdown_fut = ShutdownFut::Errored(e.clone());
                Poll::Ready(Err(e.into()))
            }
            Poll::Ready(Ok(())) => {
                self.shutdown_fut = ShutdownFut::Done;
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl fmt::Debug for PollStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollStream")
            .field("stream", &self.stream)
            .field("read_buf_cap", &self.read_buf_cap)
            .finish()
    }
}

impl AsRef<Stream> for PollStream {
    fn as_ref(&self) -> &Stream {
        &self.stream
    }
}
