//! Reliability patterns for outbound calls
//!
//! This module provides:
//! - [`RateLimiter`] - Token-bucket admission control
//! - [`CircuitBreaker`] - Three-state protection around a failing dependency
//! - [`RetryPolicy`] - Bounded retries with a fixed schedule or exponential backoff

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitPermit,
    CircuitSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::RetryPolicy;
