//! Token-bucket rate limiter
//!
//! Tokens refill lazily from elapsed time on every admission check; there
//! is no background timer. The limiter never sleeps itself: [`RateLimiter::acquire`]
//! returns how long the caller must wait, and [`RateLimiter::until_ready`] is
//! the async convenience that sleeps and re-checks.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Token bucket configuration
///
/// # Example
///
/// ```
/// use pixelforge_engine::RateLimiterConfig;
///
/// // 50 requests per minute, bursting up to 50
/// let config = RateLimiterConfig::per_minute(50);
/// assert_eq!(config.capacity, 50.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens (burst size)
    pub capacity: f64,

    /// Tokens added per second
    pub refill_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::per_minute(50)
    }
}

impl RateLimiterConfig {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Allow `requests` per minute with a burst of the same size
    pub fn per_minute(requests: u32) -> Self {
        Self {
            capacity: requests as f64,
            refill_rate: requests as f64 / 60.0,
        }
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_refill_rate(mut self, refill_rate: f64) -> Self {
        self.refill_rate = refill_rate;
        self
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, config: &RateLimiterConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if config.refill_rate > 0.0 {
            self.tokens = (self.tokens + elapsed * config.refill_rate).min(config.capacity);
        }
        // Keep the later instant so an out-of-order `now` never rewinds the clock
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// Token-bucket admission control for outbound calls
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    fn starting_at(config: RateLimiterConfig, now: Instant) -> Self {
        let capacity = config.capacity.max(0.0);
        let config = RateLimiterConfig {
            capacity,
            refill_rate: config.refill_rate,
        };
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: now,
            }),
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Try to take `cost` tokens now
    ///
    /// Returns `Duration::ZERO` when admitted (tokens deducted). Otherwise
    /// returns the time needed to accumulate the deficit and leaves the token
    /// count untouched. Costs above capacity are clamped so they can be
    /// admitted eventually.
    pub fn acquire(&self, cost: f64) -> Duration {
        self.acquire_at(cost, Instant::now())
    }

    /// [`acquire`](Self::acquire) against an explicit clock reading
    pub fn acquire_at(&self, cost: f64, now: Instant) -> Duration {
        let cost = cost.clamp(0.0, self.config.capacity);
        let mut bucket = self.bucket.lock();
        bucket.refill(&self.config, now);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            trace!(cost, tokens_remaining = bucket.tokens, "Rate limit tokens acquired");
            return Duration::ZERO;
        }

        if self.config.refill_rate <= 0.0 {
            return Duration::MAX;
        }

        let deficit = cost - bucket.tokens;
        Duration::try_from_secs_f64(deficit / self.config.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Sleep until `cost` tokens have been taken, returning the total wait
    pub async fn until_ready(&self, cost: f64) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = self.acquire(cost);
            if wait.is_zero() {
                return waited;
            }
            debug!(
                cost,
                wait_ms = wait.as_millis() as u64,
                "Rate limit reached, waiting for tokens"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Tokens currently available, including pending refill
    pub fn available_tokens(&self) -> f64 {
        self.available_tokens_at(Instant::now())
    }

    fn available_tokens_at(&self, now: Instant) -> f64 {
        let bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        let refill = if self.config.refill_rate > 0.0 {
            elapsed * self.config.refill_rate
        } else {
            0.0
        };
        (bucket.tokens + refill).min(self.config.capacity)
    }

    pub fn capacity(&self) -> f64 {
        self.config.capacity
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
