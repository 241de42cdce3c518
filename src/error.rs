use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds produced by the codec, the stream state machine, and the
/// multiplexer.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The decoder observed a `type` value outside `0..=6`. Fatal to the
    /// multiplexer: the peer that sent it has violated the protocol.
    #[error("decoded frame has invalid type {0}")]
    InvalidType(u64),

    /// Operation attempted after [`crate::Muxer::close`].
    #[error("multiplexer is closed")]
    MuxerClosed,

    /// `new_stream` rejected because the local outbound cap was reached.
    #[error("too many outbound streams")]
    TooManyOutboundStreams,

    /// The peer kept requesting new streams above the inbound cap and breached
    /// the rate limiter. The multiplexer returning this has already destroyed itself.
    #[error("too many open streams")]
    TooManyOpenStreams,

    /// Carried on stream ends triggered by a remote `RESET_*`.
    #[error("stream reset by peer")]
    StreamReset,

    /// Carried on stream ends triggered by a local `abort`.
    #[error("stream aborted: {0}")]
    StreamAborted(String),

    /// The per-stream inbound buffer ceiling was exceeded; the stream was reset
    /// and destroyed.
    #[error("stream input buffer full")]
    InputBufferFull,

    /// The sink was started twice on a single stream. Programmer error.
    #[error("stream sink started twice")]
    DoubleSink,

    /// A write was attempted after the sink had already ended. Programmer error.
    #[error("write after stream sink ended")]
    SinkEnded,

    /// The stream has already reached end-of-life; further reads/writes return
    /// this instead of blocking forever.
    #[error("stream closed")]
    StreamClosed,

    /// Transport-level I/O error, or any other non-protocol failure.
    #[error("io error: {0}")]
    Io(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            e @ Error::StreamClosed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())
            }
            e @ Error::StreamReset => {
                io::Error::new(io::ErrorKind::ConnectionReset, e.to_string())
            }
            e @ Error::MuxerClosed => io::Error::new(io::ErrorKind::NotConnected, e.to_string()),
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}

/// Internal-only signal used while parsing a varint or a frame header out of a
/// possibly-partial accumulator. Never escapes the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartialError {
    /// Not enough bytes buffered yet; wait for more input.
    NeedMoreData,
    /// The varint exceeded the 10-byte/70-bit ceiling.
    MalformedVarint,
}
