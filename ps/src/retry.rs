//! Retry with linear backoff
//!
//! Attempt `n` (0-based) that fails waits `base * (n + 1)` before attempt `n + 1`.
//! Only transport-level failures are retried; anything else is returned immediately.

use std::future::Future;
use std::time::Duration;

use sharestore::{ShareError, ShareResult};
use tracing::{debug, warn};

/// Bounded retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Backoff unit
    pub base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
        }
    }

    /// Delay after failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base * (attempt + 1)
    }

    /// Total time spent sleeping if every attempt fails
    pub fn total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1)).map(|n| self.delay_for(n)).sum()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out
    ///
    /// Exhaustion is reported as [`ShareError::ConnectionExhausted`].
    pub async fn run<T, F, Fut>(&self, mut op: F) -> ShareResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ShareResult<T>>,
    {
        for attempt in 0..self.max_attempts {
            match op(attempt).await {
                Ok(value) => {
                    debug!(attempt, "RetryPolicy::run: succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if attempt + 1 < self.max_attempts {
                        let delay = self.delay_for(attempt);
                        warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "Attempt failed, retrying");
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(attempt = attempt + 1, error = %e, "Final attempt failed");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(ShareError::ConnectionExhausted {
            attempts: self.max_attempts,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_linear_schedule() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        // Sleeps happen between attempts only: 100 + 200 + 300
        assert_eq!(policy.total_delay(), Duration::from_millis(600));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    proptest! {
        #[test]
        fn prop_total_delay_is_triangular(attempts in 1u32..40, base_ms in 0u64..5_000) {
            let policy = RetryPolicy::new(attempts, Duration::from_millis(base_ms));
            let gaps = u64::from(attempts - 1);
            prop_assert_eq!(policy.total_delay(), Duration::from_millis(base_ms * gaps * (gaps + 1) / 2));
        }

        #[test]
        fn prop_each_delay_grows_by_base(attempt in 0u32..1_000, base_ms in 0u64..5_000) {
            let policy = RetryPolicy::new(5, Duration::from_millis(base_ms));
            prop_assert_eq!(policy.delay_for(attempt + 1) - policy.delay_for(attempt), policy.base);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(5));

        let counter = calls.clone();
        let result: ShareResult<()> = policy
            .run(|_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ShareError::TransportUnavailable("refused".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(ShareError::ConnectionExhausted { attempts: 3 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let result = policy
            .run(|attempt| async move {
                if attempt < 2 {
                    Err(ShareError::TransportUnavailable("not yet".to_string()))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_secs(60));

        let counter = calls.clone();
        let result: ShareResult<()> = policy
            .run(|_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ShareError::Unauthorized)
                }
            })
            .await;

        assert!(matches!(result, Err(ShareError::Unauthorized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
