//! Retry delay policy.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and additive jitter.
///
/// Attempt `n` (1-based) waits `initial_delay * multiplier^(n-1)`, capped
/// at `max_delay`, plus up to `jitter` of that base drawn at random. The
/// result never exceeds `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fraction of the base delay added as random jitter. Zero disables it.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Creates a policy with the given initial delay and defaults otherwise.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Self::default()
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Disables jitter, making delays deterministic.
    pub fn without_jitter(self) -> Self {
        self.with_jitter(0.0)
    }

    /// Returns the delay before retry number `attempt`, without jitter.
    ///
    /// Attempt 0 has no delay.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Returns the delay before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 + factor).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_without_jitter() {
        let policy = BackoffPolicy::default().without_jitter();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
    }

    #[test]
    fn capped_at_max_delay() {
        let policy = BackoffPolicy::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_multiplier(10.0);
        assert_eq!(policy.base_delay(6), Duration::from_secs(5));
        assert!(policy.delay(6) <= Duration::from_secs(5));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn negative_jitter_is_clamped() {
        let policy = BackoffPolicy::default().with_jitter(-1.0);
        assert_eq!(policy.jitter, 0.0);
    }

    proptest! {
        #[test]
        fn jitter_stays_in_bounds(attempt in 1u32..20) {
            let policy = BackoffPolicy::default();
            let base = policy.base_delay(attempt);
            let delay = policy.delay(attempt);
            prop_assert!(delay >= base);
            prop_assert!(delay <= base.mul_f64(1.25).min(policy.max_delay));
        }
    }
}
