//! Multiplexer tunables.

/// Configuration for a [`crate::Muxer`]. All fields are optional in the sense
/// that [`Config::default`] matches the documented defaults.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Outbound fragmentation ceiling per `MESSAGE_*` payload.
    pub max_msg_size: usize,
    /// Cap on concurrent receiver-side (inbound) streams.
    pub max_inbound_streams: usize,
    /// Cap on concurrent initiator-side (outbound) streams.
    pub max_outbound_streams: usize,
    /// Per-stream readable-buffer ceiling before forced reset.
    pub max_stream_buffer_size: usize,
    /// Rate-limiter capacity and per-second refill for post-cap `NEW_STREAM` bursts.
    pub disconnect_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_msg_size: 1024 * 1024,
            max_inbound_streams: 1024,
            max_outbound_streams: 1024,
            max_stream_buffer_size: 4 * 1024 * 1024,
            disconnect_threshold: 5,
        }
    }
}
