//! Bounded retry for cloud writes that fail on optimistic-lock conflicts.
//!
//! Only [`Error::Conflict`] is retried. Every other failure is returned
//! immediately so the caller can aggregate it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retry settings for conflicting writes
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts, used by tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (0-indexed), before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(16) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or
/// `max_attempts` is exhausted.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                let delay = config.backoff(attempt - 1);
                let jittered = if delay.is_zero() {
                    delay
                } else {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                };
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "Conflict on cloud write, retrying"
                );
                tokio::time::sleep(jittered).await;
            }
            Err(Error::Conflict(msg)) => {
                debug!(operation = %operation_name, attempt, "Conflict retries exhausted");
                return Err(Error::Conflict(format!(
                    "{operation_name}: {msg} (after {attempt} attempts)"
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.backoff(0), Duration::from_millis(500));
        assert_eq!(cfg.backoff(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff(2), Duration::from_secs(2));
        assert_eq!(cfg.backoff(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out = retry_on_conflict(&RetryConfig::immediate(3), "update", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Conflict("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_on_conflict(&RetryConfig::immediate(2), "update", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Conflict("busy".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_on_conflict(&RetryConfig::immediate(5), "create", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::cloud("InvalidParameter", "bad"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::CloudApi { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
