//! Token-bucket rate limiter for the post-cap `NEW_STREAM` burst policy.
//!
//! A `Muxer` owns exactly one `TokenBucket` rather than a generic keyed map,
//! since mplex only ever needs the one key ("new-stream"): a small,
//! `Instant`-driven unit owned directly by the multiplexer rather than a
//! generic timer wheel.

use std::time::Instant;

use tokio::sync::Mutex;

#[derive(Debug)]
struct State {
    tokens: f64,
    last_refill: Instant,
}

/// Capacity `disconnect_threshold`, refilling at `disconnect_threshold` tokens
/// per second. Consumed only after the inbound-stream cap has
/// already been hit.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<State>,
}

impl TokenBucket {
    pub(crate) fn new(capacity: u32) -> Self {
        let capacity = capacity as f64;
        TokenBucket {
            capacity,
            refill_per_sec: capacity,
            state: Mutex::new(State {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refills based on elapsed wall-clock time since the last call, then
    /// consumes one token if available. Returns `false` once capacity is
    /// exhausted and not yet refilled — the first such rejection is the
    /// signal to destroy the multiplexer with `TooManyOpenStreams`.
    pub(crate) async fn try_consume(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod rate_limiter_test {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_capacity_then_rejects() {
        let bucket = TokenBucket::new(3);
        assert!(bucket.try_consume().await);
        assert!(bucket.try_consume().await);
        assert!(bucket.try_consume().await);
        assert!(!bucket.try_consume().await);
    }

    #[tokio::test]
    async fn refills_over_time() {
        tokio::time::pause();
        let bucket = TokenBucket::new(1);
        assert!(bucket.try_consume().await);
        assert!(!bucket.try_consume().await);

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        assert!(bucket.try_consume().await);
    }
}
