//! Global token bucket.
//!
//! Caps aggregate throughput irrespective of client identity: many distinct
//! clients each inside their own per-client quota can still overload the
//! process in aggregate, and this is the ceiling that stops that.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Outcome of a bucket check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketVerdict {
    /// Whether a token was available and consumed
    pub allowed: bool,
    /// Time until one token accrues, zero when allowed
    pub retry_after: Duration,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilled continuously at a fixed rate.
///
/// Tokens stay within `[0, capacity]`; a computed excursion outside those
/// bounds (clock anomaly) is clamped rather than propagated.
pub(crate) struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket. Bounds are validated by the configuration
    /// before construction.
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Refill for elapsed time, then try to consume one token.
    pub fn check(&self, now: Instant) -> BucketVerdict {
        let mut state = self.state.lock();

        // last_refill only moves forward; a caller that sampled its clock
        // before a concurrent check must not rewind the refill point.
        if now > state.last_refill {
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
            state.last_refill = now;
        }
        if state.tokens < 0.0 {
            warn!(tokens = state.tokens, "token count below zero, clamping");
            state.tokens = 0.0;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            BucketVerdict {
                allowed: true,
                retry_after: Duration::ZERO,
            }
        } else {
            let wait = (1.0 - state.tokens) / self.refill_rate;
            BucketVerdict {
                allowed: false,
                retry_after: Duration::from_secs_f64(wait),
            }
        }
    }

    /// Tokens currently available, without refilling.
    pub fn available(&self) -> f64 {
        self.state.lock().tokens
    }
}
