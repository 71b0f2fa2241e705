//! Acknowledgement throttle — token bucket over the ack channel budget.
//!
//! One global bits-per-second budget, not per peer. Chunk receipt queues
//! acks instead of sending them when throttling is on; the retry sweep
//! drains the queue through this bucket, checking before each send and
//! committing the cost after.
//!
//! Bucket depth is one second of budget: idle time never banks more than
//! `rate` bits of burst.

use std::time::Instant;

/// Bits charged per acknowledgement packet (1000 bytes assumed).
pub const ACK_COST_BITS: f64 = 1000.0 * 8.0;

#[derive(Debug)]
pub struct AckThrottle {
    rate_bps: f64,
    available: f64,
    last_refill: Option<Instant>,
}

impl AckThrottle {
    pub fn new(rate_bps: f64) -> Self {
        Self {
            rate_bps,
            // Start full so the first acks of a session go out unthrottled.
            available: rate_bps,
            last_refill: None,
        }
    }

    pub fn set_rate(&mut self, rate_bps: f64) {
        self.rate_bps = rate_bps;
        self.available = self.available.min(rate_bps);
    }

    pub fn rate(&self) -> f64 {
        self.rate_bps
    }

    /// Returns true if spending `bits` now would exceed the budget.
    pub fn check_overflow(&mut self, bits: f64, now: Instant) -> bool {
        self.refill(now);
        bits > self.available
    }

    /// Commit `bits` against the budget.
    pub fn throttle_overflow(&mut self, bits: f64, now: Instant) {
        self.refill(now);
        self.available -= bits;
    }

    fn refill(&mut self, now: Instant) {
        if let Some(last) = self.last_refill {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.available = (self.available + elapsed * self.rate_bps).min(self.rate_bps);
        }
        self.last_refill = Some(now);
    }
}
