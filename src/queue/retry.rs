use std::time::Duration;

use rand::Rng;
use serde::{Serialize, Deserialize};

/// How many times a failed task may be retried
///
/// `max_retry: None` retries forever; `Some(n)` allows `n` retries after the
/// first attempt, so `Some(0)` dead-letters on the first failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retry: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Dead,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self { max_retry: None }
    }

    pub fn max(max_retry: u32) -> Self {
        Self { max_retry: Some(max_retry) }
    }

    pub fn from_setting(max_retry: Option<u32>) -> Self {
        Self { max_retry }
    }

    /// Decide the fate of a task after its `failures`-th failed attempt
    pub fn decide<R: Rng + ?Sized>(
        &self,
        failures: u32,
        retriable: bool,
        backoff: &BackoffSettings,
        rng: &mut R,
    ) -> RetryDecision {
        if !retriable {
            return RetryDecision::Dead;
        }

        match self.max_retry {
            Some(max) if failures > max => RetryDecision::Dead,
            _ => RetryDecision::Retry {
                delay: backoff.delay(failures, rng),
            },
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// Delay before the first retry, in milliseconds
    pub initial_ms: u64,

    /// Growth factor applied per additional failure
    pub multiplier: u32,

    /// Upper bound on any single delay, in milliseconds
    pub max_ms: u64,

    /// Random spread as a fraction of the delay (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 2,
            max_ms: 600_000,
            jitter: 0.2,
        }
    }
}

impl BackoffSettings {
    /// Delay before retrying after the `failures`-th failure
    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let max = self.max_ms as f64;
        let base = (self.initial_ms as f64 * f64::from(self.multiplier).powi(exponent)).min(max);

        let jittered = if self.jitter > 0.0 {
            base * (1.0 + rng.gen_range(-self.jitter..=self.jitter))
        } else {
            base
        };

        Duration::from_millis(jittered.clamp(0.0, max) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter() -> BackoffSettings {
        BackoffSettings {
            initial_ms: 1_000,
            multiplier: 2,
            max_ms: 10_000,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);

        let delays: Vec<u64> = (1..=6)
            .map(|failures| backoff.delay(failures, &mut rng).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
        assert_eq!(backoff.delay(u32::MAX, &mut rng), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = BackoffSettings {
            jitter: 0.2,
            ..no_jitter()
        };
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let delay = backoff.delay(2, &mut rng).as_millis() as u64;
            assert!((1_600..=2_400).contains(&delay), "delay {}", delay);
        }
    }

    #[test]
    fn test_unlimited_policy_always_retries_retriable_failures() {
        let policy = RetryPolicy::unlimited();
        let mut rng = StdRng::seed_from_u64(1);

        for failures in [1, 25, 10_000] {
            assert!(matches!(
                policy.decide(failures, true, &no_jitter(), &mut rng),
                RetryDecision::Retry { .. }
            ));
        }
    }

    #[test]
    fn test_max_retry_ceiling() {
        let policy = RetryPolicy::max(2);
        let mut rng = StdRng::seed_from_u64(1);

        assert!(matches!(policy.decide(1, true, &no_jitter(), &mut rng), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(2, true, &no_jitter(), &mut rng), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(3, true, &no_jitter(), &mut rng), RetryDecision::Dead);

        assert_eq!(RetryPolicy::max(0).decide(1, true, &no_jitter(), &mut rng), RetryDecision::Dead);
    }

    #[test]
    fn test_terminal_failures_skip_retry() {
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(
            RetryPolicy::unlimited().decide(1, false, &no_jitter(), &mut rng),
            RetryDecision::Dead
        );
    }
}
