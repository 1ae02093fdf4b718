use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::RetryConfig;

/// Exponential backoff retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.config.multiplier.max(1.0).powi(exponent);
        let secs = self.config.initial_delay.as_secs_f64() * factor;
        // Out-of-range products (huge caps, infinity) fall back to the cap.
        Duration::try_from_secs_f64(secs)
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// or attempts run out. The last error is returned.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && retryable(&e) => {
                    let delay = self.delay_after(attempt);
                    debug!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying remote call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default()
                .max_attempts(attempts)
                .initial_delay(Duration::from_millis(1)),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(10), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_with_unbounded_cap() {
        let policy = RetryPolicy::new(RetryConfig::default().max_delay(Duration::MAX));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(33), policy.delay_after(40));

        let huge = RetryPolicy::new(
            RetryConfig::default()
                .initial_delay(Duration::MAX)
                .max_delay(Duration::MAX),
        );
        assert_eq!(huge.delay_after(5), Duration::MAX);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = fast_policy(3)
            .run(
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_policy(2)
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_policy(5)
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("open".to_string())
                },
                |e| e != "open",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
