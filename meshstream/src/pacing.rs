//! Outbound pacing: a token bucket sized to the mesh airtime budget.
//!
//! One token buys one frame on the air. The bucket refills continuously at
//! `rate` tokens per second up to `burst` capacity, so short bursts are
//! allowed but the sustained rate is bounded.

use std::time::{Duration, Instant};

pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32, now: Instant) -> Self {
        let capacity = burst as f64;
        Self {
            rate,
            capacity,
            tokens: capacity,
            refilled_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.refilled_at = now;
    }

    /// Consume one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// When the next token becomes available, if the bucket is currently
    /// empty.
    pub fn next_available(&self, now: Instant) -> Option<Instant> {
        if self.tokens >= 1.0 {
            return None;
        }
        let deficit = 1.0 - self.tokens;
        Some(now + Duration::from_secs_f64(deficit / self.rate))
    }
}
