//! Token-bucket rate limiting for extractors talking to budgeted sources.
//!
//! When the configured request budget is exhausted, `acquire` suspends the
//! calling stage without blocking other pipeline executions.

use super::config::ExtractorConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A token bucket refilled at a fixed rate.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// A limiter allowing `rate` requests per second, with a burst
    /// capacity of one second's worth of tokens.
    #[must_use]
    pub fn per_second(rate: u32) -> Self {
        Self::new(f64::from(rate.max(1)), f64::from(rate.max(1)))
    }

    /// A limiter allowing `rate` requests per minute.
    #[must_use]
    pub fn per_minute(rate: u32) -> Self {
        let per_sec = f64::from(rate.max(1)) / 60.0;
        Self::new(per_sec.max(1.0), per_sec)
    }

    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Builds the effective limiter for an extractor config: the stricter
    /// of the per-second and per-minute budgets, or `None` when
    /// unthrottled.
    #[must_use]
    pub fn from_config(config: &ExtractorConfig) -> Option<Arc<Self>> {
        let per_sec = config.requests_per_second.map(|r| f64::from(r.max(1)));
        let per_min = config
            .requests_per_minute
            .map(|r| f64::from(r.max(1)) / 60.0);

        let rate = match (per_sec, per_min) {
            (Some(s), Some(m)) => s.min(m),
            (Some(s), None) => s,
            (None, Some(m)) => m,
            (None, None) => return None,
        };

        Some(Arc::new(Self::new(rate.max(1.0), rate)))
    }

    /// Takes one token immediately if available.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Suspends until a token is available, then takes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}
