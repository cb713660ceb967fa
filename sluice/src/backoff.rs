//! Backoff-based retry for stage operations against unreliable sources.
//!
//! Admission and structural errors are never retried; this module only
//! wraps extract/transform/load operations, with exponential backoff and
//! full jitter by default.

use crate::errors::EtlError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Retry behavior for one stage operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: usize,
    /// Base delay between retries.
    pub base_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Randomize each delay between zero and the computed value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let cap = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let raw = match self.strategy {
            BackoffStrategy::Exponential => {
                let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(2u64.saturating_pow(shift))
            }
            BackoffStrategy::Linear => base.saturating_mul(attempt as u64 + 1),
            BackoffStrategy::Constant => base,
        };
        let capped = raw.min(cap);

        let jittered = if self.jitter && capped > 0 {
            rand::thread_rng().gen_range(0..=capped)
        } else {
            capped
        };

        Duration::from_millis(jittered)
    }
}

/// Runs `operation` with the policy's retry budget, sleeping the backoff
/// delay between attempts. The last error wins once the budget is spent.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, EtlError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EtlError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    operation = op_name,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Phase, StageError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn flaky_error() -> EtlError {
        EtlError::Stage(StageError::new(Phase::Extract, "p", "transient"))
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_linear_and_constant_delays() {
        let linear = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_strategy(BackoffStrategy::Linear)
            .with_jitter(false);
        assert_eq!(linear.delay_for(2), Duration::from_millis(300));

        let constant = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_strategy(BackoffStrategy::Constant)
            .with_jitter(false);
        assert_eq!(constant.delay_for(9), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);

        assert_eq!(policy.delay_for(20), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_below_computed_delay() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_strategy(BackoffStrategy::Constant);

        for _ in 0..20 {
            assert!(policy.delay_for(0) <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_with_backoff_succeeds_after_failures() {
        let policy = RetryPolicy::new()
            .with_max_retries(4)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();

        let result = with_backoff(&policy, "extract", || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(flaky_error())
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
    async fn test_with_backoff_exhausts_budget() {
        let policy = RetryPolicy::new()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();

        let result: Result<(), _> = with_backoff(&policy, "load", || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(flaky_error())
            }
        })
        .await;

        assert!(result.is_err());
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_policy_fails_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();

        let result: Result<(), _> = with_backoff(&RetryPolicy::none(), "transform", || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(flaky_error())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
