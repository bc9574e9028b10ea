//! Capped exponential backoff with bounded jitter
//!
//! Used for viewer reconnection and for upstream start retries. The delay of
//! attempt `n` (1-based) is `min(base * 2^(n-1) * (1 + j), max)` where `j` is
//! drawn from `[0, jitter_ratio)`. With `jitter_ratio <= 1` the largest
//! possible delay of attempt `n` never exceeds the smallest delay of attempt
//! `n + 1`, so delays are non-decreasing until they reach the cap.

use rand::Rng;
use std::time::Duration;

use crate::config::{LifecycleConfig, ReconnectConfig};

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Clamped to `[0, 1]`
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        let jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            base,
            max: max.max(base),
            jitter_ratio,
        }
    }

    /// Viewer reconnection policy
    pub fn for_reconnect(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_ratio,
        )
    }

    /// Upstream start retry policy (no jitter)
    pub fn for_start_retry(config: &LifecycleConfig) -> Self {
        Self::new(
            Duration::from_millis(config.start_retry_base_ms),
            Duration::from_millis(config.start_retry_max_ms),
            0.0,
        )
    }

    /// Delay for `attempt` with a random jitter factor
    ///
    /// `attempt` is the retry count after it was incremented for this
    /// failure, so the first retry waits `base` and each further one doubles.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_ratio)
        } else {
            0.0
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// Delay for `attempt` with an explicit jitter factor
    ///
    /// `jitter` is clamped to `[0, jitter_ratio]`. Attempt 0 is treated as 1.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(30);
        let jitter = jitter.clamp(0.0, self.jitter_ratio);
        let base_ms = self.base.as_secs_f64() * 1000.0;
        let raw_ms = base_ms * f64::from(1u32 << exponent) * (1.0 + jitter);
        let max_ms = self.max.as_secs_f64() * 1000.0;
        Duration::from_micros((raw_ms.min(max_ms) * 1000.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(8), jitter)
    }

    #[test]
    fn test_doubles_until_cap() {
        let p = policy(0.0);
        let delays: Vec<u64> = (1..=7)
            .map(|n| p.delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn test_worst_jitter_never_overtakes_next_attempt() {
        let p = policy(1.0);
        for n in 1..10 {
            let worst = p.delay_with_jitter(n, 1.0);
            let best_next = p.delay_with_jitter(n + 1, 0.0);
            assert!(worst <= best_next, "attempt {} -> {:?} > {:?}", n, worst, best_next);
        }
    }

    #[test]
    fn test_random_delays_are_bounded() {
        let p = policy(0.2);
        for _ in 0..100 {
            let d = p.delay(2);
            assert!(d >= Duration::from_millis(1000));
            assert!(d < Duration::from_millis(1200));
            assert!(p.delay(20) <= Duration::from_secs(8));
        }
    }

    #[test]
    fn test_jitter_ratio_clamped() {
        assert_eq!(policy(3.0).jitter_ratio, 1.0);
        assert_eq!(policy(-1.0).jitter_ratio, 0.0);
        assert_eq!(policy(f64::NAN).jitter_ratio, 0.0);
    }
}
