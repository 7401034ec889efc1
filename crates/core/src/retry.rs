//! Retry budget and backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// base * 2^(retry - 1)
    Exponential,
    /// base * retry
    Linear,
}

/// How many times a transiently failing job is retried, and how long to wait
/// in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Reschedules allowed after the first attempt (0 = never retry).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF)
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the given retry (1-indexed). Retry 0 is the original
    /// attempt and has no delay.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((retry - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(retry)).min(max_ms),
        };

        // Uniform in +/- jitter * delay, so retries of many jobs spread out.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            jitter_range * rand::random_range(-1.0..=1.0)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// `attempt` is 0-indexed: attempt 0 is the first delivery.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_matches_service_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(10));
    }

    #[test]
    fn should_retry_allows_exactly_max_retries() {
        let policy = RetryPolicy::default();
        let retried = (0..10).filter(|attempt| policy.should_retry(*attempt)).count();
        assert_eq!(retried, 3);
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(1))
        };
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_grows_by_base() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::fixed(5, Duration::from_secs(2))
        };
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(6));
    }

    #[test]
    fn jitter_spreads_delays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::fixed(3, Duration::from_secs(1))
        };
        let delays: Vec<Duration> = (0..64).map(|_| policy.delay_for_retry(1)).collect();

        for delay in &delays {
            assert!(*delay >= Duration::from_millis(500), "{delay:?}");
            assert!(*delay <= Duration::from_millis(1500), "{delay:?}");
        }
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn jittered_delay_stays_near_the_base(retry in 1u32..20, base_ms in 1u64..10_000, jitter in 0.0f64..=1.0) {
            let policy = RetryPolicy {
                jitter,
                ..RetryPolicy::fixed(20, Duration::from_millis(base_ms))
            };
            let delay = policy.delay_for_retry(retry).as_millis() as f64;
            let spread = base_ms as f64 * jitter;
            prop_assert!(delay >= base_ms as f64 - spread - 1.0);
            prop_assert!(delay <= base_ms as f64 + spread + 1.0);
        }

        #[test]
        fn delay_never_exceeds_cap_plus_jitter(retry in 0u32..200, base_ms in 0u64..5_000, cap_ms in 0u64..60_000) {
            let policy = RetryPolicy::exponential(10, Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
            let delay = policy.delay_for_retry(retry).as_millis() as f64;
            let bound = (base_ms.max(cap_ms) as f64) * 1.1 + 1.0;
            prop_assert!(delay <= bound);
        }
    }
}
