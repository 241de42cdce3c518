//! A pure Rust implementation of the libp2p **mplex** stream multiplexer.
//!
//! mplex carries many independent, ordered, bytewise duplex streams over a
//! single reliable byte-oriented transport (a TCP connection, a secured
//! channel, anything implementing [`tokio::io::AsyncRead`] +
//! [`tokio::io::AsyncWrite`]). Frames are length-delimited and
//! varint-prefixed; there is no flow-control window, no priority, and no
//! stream-id renegotiation — the only inbound safety valve is a per-stream
//! buffer ceiling enforced by reset.
//!
//! The multiplexer ([`Muxer`]) owns the connection: it decodes inbound bytes
//! into frames, dispatches them to the stream they address, enforces the
//! inbound-stream cap with a rate-limited disconnect policy, and serializes
//! outbound frames. Each logical [`Stream`] exposes an async duplex byte
//! interface ([`Stream::read`]/[`Stream::write`], or the [`PollStream`]
//! `AsyncRead`/`AsyncWrite` adapter for callers who want a plain Tokio byte
//! stream) with half-close and reset semantics.
//!
//! ```no_run
//! use mplex::{Config, Muxer};
//!
//! # async fn run(transport: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static) -> mplex::Result<()> {
//! let muxer = Muxer::new(transport, Config::default());
//!
//! let stream = muxer.new_stream(Some("greeting".to_string())).await?;
//! stream.write(b"hello").await?;
//! stream.end().await?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

mod byte_list;
mod codec;
mod config;
mod error;
mod message;
mod multiplexer;
mod rate_limiter;
mod stream;
mod varint;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::multiplexer::Muxer;
pub use crate::stream::{PollStream, Stream, StreamRole};
