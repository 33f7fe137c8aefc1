//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_util::{duration_millis, duration_millis_vec};

/// Retry budget and backoff for request tasks
///
/// Delays come from `schedule` when it is non-empty (the last entry is
/// repeated once the schedule runs out), otherwise from exponential backoff
/// between `initial_interval` and `max_interval`.
///
/// # Example
///
/// ```
/// use pixelforge_engine::RetryPolicy;
/// use std::time::Duration;
///
/// // Default: 3 retries after 1s, 2s and 5s
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_retry(3), Duration::from_secs(5));
/// assert_eq!(policy.delay_for_retry(7), Duration::from_secs(5));
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(5)
///     .with_initial_interval(Duration::from_millis(500))
///     .with_jitter(0.0);
/// assert_eq!(policy.delay_for_retry(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,

    /// Fixed delay per retry; empty means exponential backoff
    #[serde(default, with = "duration_millis_vec")]
    pub schedule: Vec<Duration>,

    /// Initial delay before first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed_schedule(vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(5),
        ])
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy
    ///
    /// - 3 retries
    /// - 1 second initial interval
    /// - 30 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            schedule: vec![],
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Retry once per schedule entry, waiting that entry's delay
    pub fn fixed_schedule(schedule: Vec<Duration>) -> Self {
        let max_interval = schedule.iter().copied().max().unwrap_or_default();
        Self {
            max_retries: schedule.len() as u32,
            initial_interval: schedule.first().copied().unwrap_or_default(),
            max_interval,
            schedule,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            schedule: vec![],
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            schedule: vec![],
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the number of retries after the initial attempt
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replace the delay schedule
    pub fn with_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given retry (1-based: 1 is the first retry)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = if self.schedule.is_empty() {
            let secs = self.initial_interval.as_secs_f64()
                * self.backoff_coefficient.powi(retry as i32 - 1);
            secs.min(self.max_interval.as_secs_f64())
        } else {
            let idx = (retry as usize - 1).min(self.schedule.len() - 1);
            self.schedule[idx].as_secs_f64()
        };

        // Apply jitter
        let jittered = if self.jitter > 0.0 && base > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = base * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (base + jitter_offset).max(0.0)
        } else {
            base
        };

        Duration::from_secs_f64(jittered)
    }
}
