//! Exponential backoff with jitter for transient LM-call failures.
//!
//! Grounded in the agent-SDK corpus's dedicated retry module (the
//! `open-agent-sdk-rust` / `slb350-open-agent-sdk-rust` crates declare `rand`
//! specifically for retry jitter); generalized here into a small reusable
//! helper rather than a single-shot inline loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use subterm_error::CoreError;

/// Retry policy: powers-of-2 backoff (spec.md §4.1: "exponential backoff
/// (powers of 2 seconds)") with up to `max_retries` attempts and +/-20%
/// jitter to avoid thundering-herd retries against the LM endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(base_secs * jitter)
    }
}

/// Runs `op` up to `policy.max_retries + 1` times, retrying only on
/// `CoreError::is_retryable()` errors, with exponential backoff between
/// attempts. Returns the last error once retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(policy: RetryPolicy, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "retryable LM error on attempt {}/{}: {e}; backing off {:?}",
                    attempt + 1,
                    policy.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_up_to_max() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        };
        let result: Result<u32, CoreError> = retry_with_backoff(policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoreError::Transient("flake".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        };
        let result: Result<u32, CoreError> = retry_with_backoff(policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::Configuration("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_and_returns_last_error() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
        };
        let result: Result<u32, CoreError> =
            retry_with_backoff(policy, || async { Err(CoreError::Transient("down".into())) })
                .await;
        assert!(matches!(result, Err(CoreError::Transient(_))));
    }
}
