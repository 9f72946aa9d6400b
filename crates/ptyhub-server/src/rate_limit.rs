//! Token-bucket throttle for bytes forwarded into a PTY.
//!
//! Each connection owns one bucket. One token is one input byte; the bucket
//! starts full, refills continuously, and never holds more than its capacity.
//! Rejected input is dropped by the caller without telling the client.

use std::time::Instant;

/// A per-connection token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum tokens (burst size).
    capacity: f64,
    /// Tokens added per second.
    refill_per_sec: f64,
    /// Tokens currently available.
    tokens: f64,
    /// Last time the bucket was refilled.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// * `capacity` - Burst size in bytes.
    /// * `refill_per_sec` - Sustained rate in bytes per second.
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self::new_at(capacity, refill_per_sec, Instant::now())
    }

    /// Create a full bucket whose clock starts at `now`.
    pub fn new_at(capacity: u32, refill_per_sec: u32, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// Try to take `n` tokens now.
    ///
    /// Returns `true` and debits the bucket if enough tokens are available,
    /// otherwise returns `false` and leaves the bucket unchanged.
    pub fn take(&mut self, n: usize) -> bool {
        self.take_at(n, Instant::now())
    }

    /// Same as [`take`](Self::take) with an explicit clock reading.
    pub fn take_at(&mut self, n: usize, now: Instant) -> bool {
        self.refill(now);
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refilling up to `now`).
    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        // Clock readings older than the last refill add nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }
}
