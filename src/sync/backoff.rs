//! Reconnection backoff

use crate::config::ReconnectSettings;
use std::time::Duration;

/// Exponential backoff with a hard cap and a bounded number of attempts
///
/// `delay(attempt) = min(initial * multiplier^attempt, max_delay)`
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            multiplier: settings.multiplier.max(1.0),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
        }
    }

    /// Delay before reconnection attempt `attempt` (0-based), ignoring the limit
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before attempt `attempt`, or `None` once attempts are exhausted
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.delay_for(attempt))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), policy.initial_delay);
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 10);
    }

    #[test]
    fn test_growth_by_multiplier() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2250));
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn test_stops_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (0..).map_while(|a| policy.next_delay(a)).collect();
        assert_eq!(delays.len(), 10);
        assert!(policy.next_delay(10).is_none());
    }

    proptest! {
        #[test]
        fn prop_delays_non_decreasing_and_capped(
            initial_ms in 1u64..5_000,
            multiplier in 1.0f64..4.0,
            max_ms in 1_000u64..60_000,
        ) {
            let policy = ReconnectPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                multiplier,
                max_delay: Duration::from_millis(max_ms),
                max_attempts: 20,
            };
            let mut previous = Duration::ZERO;
            for attempt in 0..20 {
                let delay = policy.delay_for(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }
}
