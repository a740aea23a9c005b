//! Reconnection backoff policy.
//!
//! Exponential backoff with uniform jitter. The policy is pure: the caller
//! supplies the random input so simulation stays reproducible.
//!
//! With the default policy the delay for attempt `n` (zero-based) is
//! `min(500ms * 2^n, 30s)` scaled by a factor drawn uniformly from
//! `[0.8, 1.2]`, so every delay lies in `[400ms, 36s]`.

use std::time::Duration;

/// Delay before the first reconnection attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the un-jittered delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Jitter applied on both sides of the base delay, in percent.
pub const DEFAULT_JITTER_PERCENT: u64 = 20;

/// Reconnection backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Symmetric jitter in percent of the base delay (0..=100).
    pub jitter_percent: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay for a zero-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_millis() as u64;
        let cap = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        Duration::from_millis(initial.saturating_mul(factor).min(cap))
    }

    /// Jittered delay for a zero-based attempt number.
    ///
    /// `random` is any uniformly distributed `u64`.
    pub fn delay(&self, attempt: u32, random: u64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let spread = base * self.jitter_percent.min(100) / 100;
        if spread == 0 {
            return Duration::from_millis(base);
        }
        let offset = random % (2 * spread + 1);
        Duration::from_millis(base - spread + offset)
    }

    /// Smallest delay this policy can produce.
    pub fn min_delay(&self) -> Duration {
        let base = self.base_delay(0).as_millis() as u64;
        Duration::from_millis(base - base * self.jitter_percent.min(100) / 100)
    }

    /// Largest delay this policy can produce.
    pub fn max_jittered_delay(&self) -> Duration {
        let cap = self.max_delay.as_millis() as u64;
        Duration::from_millis(cap + cap * self.jitter_percent.min(100) / 100)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn base_delay_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_millis(500));
        assert_eq!(policy.base_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(5), Duration::from_millis(16_000));
        assert_eq!(policy.base_delay(6), Duration::from_secs(30));
        assert_eq!(policy.base_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn documented_bounds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.min_delay(), Duration::from_millis(400));
        assert_eq!(policy.max_jittered_delay(), Duration::from_secs(36));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = ReconnectPolicy { jitter_percent: 0, ..ReconnectPolicy::default() };
        assert_eq!(policy.delay(2, u64::MAX), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(attempt in 0u32..100, random in any::<u64>()) {
            let policy = ReconnectPolicy::default();
            let delay = policy.delay(attempt, random);
            let base = policy.base_delay(attempt);

            prop_assert!(delay >= policy.min_delay());
            prop_assert!(delay <= policy.max_jittered_delay());
            prop_assert!(delay >= base * 4 / 5);
            prop_assert!(delay <= base * 6 / 5);
        }
    }
}
