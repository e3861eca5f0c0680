//! Token bucket rate limiter for bandwidth control.
//!
//! Tokens are bytes. The bucket refills at the configured rate up to one
//! second of burst. Reservations larger than the current balance put the
//! bucket into debt and report how long the caller must wait, so a single
//! large block never stalls forever behind a small capacity.

use std::time::{Duration, Instant};

/// Token bucket rate limiter for controlling bandwidth usage.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    capacity: u64,
    /// Current balance; negative while in debt
    tokens: f64,
    /// Tokens added per second
    refill_rate: u64,
    last_refill: Instant,
}

/// Errors that can occur during token bucket operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TokenBucketError {
    /// Not enough tokens available for the requested operation
    #[error("Insufficient tokens: requested {requested}, available {available}")]
    InsufficientTokens { requested: u64, available: u64 },
}

impl TokenBucket {
    /// Creates a full bucket with one second of burst capacity.
    ///
    /// A zero rate is raised to one token per second.
    pub fn new(refill_rate: u64) -> Self {
        Self::starting_at(refill_rate, Instant::now())
    }

    pub fn starting_at(refill_rate: u64, now: Instant) -> Self {
        let refill_rate = refill_rate.max(1);
        Self {
            capacity: refill_rate,
            tokens: refill_rate as f64,
            refill_rate,
            last_refill: now,
        }
    }

    /// Consumes `tokens` only if the whole amount is available.
    ///
    /// # Errors
    ///
    /// - `TokenBucketError::InsufficientTokens` - Balance below the request
    pub fn try_consume_at(&mut self, tokens: u64, now: Instant) -> Result<(), TokenBucketError> {
        self.refill(now);

        if self.tokens >= tokens as f64 {
            self.tokens -= tokens as f64;
            Ok(())
        } else {
            Err(TokenBucketError::InsufficientTokens {
                requested: tokens,
                available: self.tokens.max(0.0) as u64,
            })
        }
    }

    /// Takes `tokens` unconditionally and returns how long until the
    /// balance is non-negative again (zero when no wait is needed).
    pub fn reserve_at(&mut self, tokens: u64, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= tokens as f64;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate as f64)
        }
    }

    /// Current balance, zero while in debt.
    pub fn available_at(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens.max(0.0) as u64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = elapsed.as_secs_f64() * self.refill_rate as f64;
        self.tokens = (self.tokens + added).min(self.capacity as f64);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_full_with_one_second_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(1000, now);
        assert_eq!(bucket.capacity(), 1000);
        assert_eq!(bucket.available_at(now), 1000);
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        let bucket = TokenBucket::new(0);
        assert_eq!(bucket.refill_rate(), 1);
    }

    #[test]
    fn test_try_consume_insufficient_tokens() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(100, now);

        assert!(bucket.try_consume_at(90, now).is_ok());
        let result = bucket.try_consume_at(50, now);
        assert_eq!(
            result,
            Err(TokenBucketError::InsufficientTokens {
                requested: 50,
                available: 10
            })
        );
    }

    #[test]
    fn test_reserve_reports_wait_for_debt() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(1000, now);

        assert_eq!(bucket.reserve_at(1000, now), Duration::ZERO);
        let wait = bucket.reserve_at(500, now);
        assert_eq!(wait, Duration::from_millis(500));
        assert_eq!(bucket.available_at(now), 0);

        // Debt is paid back by refill
        assert_eq!(bucket.available_at(now + Duration::from_millis(600)), 100);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(50, now);
        bucket.reserve_at(50, now);

        assert_eq!(bucket.available_at(now + Duration::from_millis(100)), 5);
        assert_eq!(bucket.available_at(now + Duration::from_secs(10)), 50);
    }
}
