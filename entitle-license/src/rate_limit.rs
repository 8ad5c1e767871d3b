//! Token bucket for activation attempts.

use crate::config::RateLimitConfig;
use chrono::{DateTime, Utc};

/// A token bucket driven by an external clock.
///
/// State lives in memory only and resets when the process restarts. A clock
/// moved backwards refills nothing.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Option<DateTime<Utc>>,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: u32, refill_per_minute: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_minute) / 60.0,
            tokens: f64::from(capacity),
            last_refill: None,
        }
    }

    /// Creates a bucket from configuration.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_minute)
    }

    /// Takes one token at `now`. Returns false when the bucket is empty.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        self.tokens.floor() as u32
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        match self.last_refill {
            Some(last) if now > last => {
                let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
                self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                self.last_refill = Some(now);
            }
            Some(_) => {}
            None => self.last_refill = Some(now),
        }
    }
}
