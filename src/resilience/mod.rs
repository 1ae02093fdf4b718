//! Failure isolation for remote tier calls.
//!
//! - [`CircuitBreaker`] stops calling the remote tier during an outage
//! - [`RetryPolicy`] retries transient remote write failures with
//!   exponential backoff

mod circuit_breaker;
mod retry;

use std::time::Duration;

use serde::Deserialize;

use crate::utils::duration_serde;

pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_OPEN_STATE_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Circuit breaker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,

    /// How long an open breaker rejects calls before probing.
    #[serde(with = "duration_serde")]
    pub open_state_duration: Duration,

    /// Probe calls allowed while half-open. The same number of probe
    /// successes closes the breaker.
    pub half_open_max_calls: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_state_duration: DEFAULT_OPEN_STATE_DURATION,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl ResilienceConfig {
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn open_state_duration(mut self, duration: Duration) -> Self {
        self.open_state_duration = duration;
        self
    }

    #[must_use]
    pub fn half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls.max(1);
        self
    }
}

/// Retry settings for remote writes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,

    #[serde(with = "duration_serde")]
    pub max_delay: Duration,

    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}
