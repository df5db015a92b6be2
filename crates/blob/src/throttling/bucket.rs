//! A single continuously replenished token bucket.

use std::time::Duration;

use tokio::time::Instant;

/// Slack for float accounting so a caller that slept exactly long enough
/// isn't sent back to sleep for a rounding error.
const EPSILON: f64 = 1e-9;

/// Bucket state. A non-positive rate means the bucket is unlimited.
#[derive(Debug)]
pub(super) struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, window: Duration, initial_fill: f64, now: Instant) -> Self {
        let capacity = capacity_for(rate, window);
        Self {
            rate,
            capacity,
            tokens: capacity * initial_fill,
            last_refill: now,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate <= 0.0
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens available right now.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Add the tokens accrued since the last refill, up to capacity.
    fn refill(&mut self, now: Instant) {
        if self.is_unlimited() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `n` tokens, or report how long until they will be available.
    ///
    /// Requests larger than the bucket are capped at its capacity so that
    /// oversized payloads wait for a full bucket instead of forever.
    pub fn try_take(&mut self, n: f64, now: Instant) -> Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }
        self.refill(now);

        let need = n.min(self.capacity);
        if self.tokens + EPSILON >= need {
            self.tokens = (self.tokens - need).max(0.0);
            return Ok(());
        }

        Err(Duration::from_secs_f64((need - self.tokens) / self.rate))
    }

    /// Whether [`TokenBucket::try_take`] would succeed for `n` right now.
    pub fn can_take(&mut self, n: f64, now: Instant) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill(now);
        self.tokens + EPSILON >= n.min(self.capacity)
    }

    /// Switch to a new rate, keeping the tokens already accrued (clamped to
    /// the new capacity). A bucket that was unlimited starts from the
    /// initial fill.
    pub fn set_rate(&mut self, rate: f64, window: Duration, initial_fill: f64, now: Instant) {
        let was_unlimited = self.is_unlimited();
        self.refill(now);

        self.rate = rate;
        self.capacity = capacity_for(rate, window);
        self.tokens = if self.is_unlimited() {
            0.0
        } else if was_unlimited {
            self.capacity * initial_fill
        } else {
            self.tokens.min(self.capacity)
        };
        self.last_refill = now;
    }
}

fn capacity_for(rate: f64, window: Duration) -> f64 {
    if rate <= 0.0 {
        0.0
    } else {
        rate * window.as_secs_f64()
    }
}
