use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

/// Bounded exponential backoff.
///
/// Only used for startup work (opening the store). Upstream completions are
/// never retried: a failed completion becomes fallback text instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based).
    #[inline]
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(10);
        let multiplier = 1_u64 << shift;
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(multiplier)
                .min(self.backoff_max_ms),
        )
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        operation = label,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_attempts,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
        })
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy(3);
        assert_eq!(p.backoff_delay(0), Duration::from_millis(1));
        assert_eq!(p.backoff_delay(1), Duration::from_millis(2));
        assert_eq!(p.backoff_delay(5), Duration::from_millis(4));
        assert_eq!(p.backoff_delay(u32::MAX), Duration::from_millis(4));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(policy(0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = policy(3)
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy(2)
            .run("always", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {n}"))
            })
            .await;
        assert_eq!(result.unwrap_err(), "failure 1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
