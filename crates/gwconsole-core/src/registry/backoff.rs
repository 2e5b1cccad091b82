// ── Reconnect backoff ──

use std::time::Duration;

/// Exponential backoff configuration for the notification link.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Consecutive failed attempts before giving up and reporting on the
    /// error topic. `None` means retry forever. Default: 10.
    pub max_retries: Option<u32>,

    /// Spread each delay by up to ±this fraction. Default: 0 (exact
    /// 1s, 2s, 4s, ... schedule).
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: Some(10),
            jitter_ratio: 0.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt number `attempt` (zero-based).
    ///
    /// `delay = min(initial * 2^attempt, max) * jitter`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        // Deterministic "jitter" seeded from the attempt number.
        // Not random, but enough to spread consoles that dropped together.
        let jitter_factor = 1.0 + self.jitter_ratio * (f64::from(attempt) * 7.3).sin();
        let with_jitter = if jitter_factor.is_finite() {
            (capped * jitter_factor).max(0.0)
        } else {
            capped
        };

        // Saturates when the delay overflows `Duration` (`max_delay:
        // Duration::MAX`).
        Duration::try_from_secs_f64(with_jitter)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `true` once `failures` consecutive attempts have failed and the
    /// configured cap is reached.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_retries.is_some_and(|max| failures >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, Some(10));
    }

    #[test]
    fn backoff_doubles_without_jitter() {
        let config = ReconnectConfig::default();

        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
        assert_eq!(config.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.delay_for(5), Duration::from_secs(30));
        assert_eq!(config.delay_for(40), Duration::from_secs(30));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let config = ReconnectConfig {
            jitter_ratio: 0.25,
            ..ReconnectConfig::default()
        };

        for attempt in 0..12 {
            let exact = ReconnectConfig::default().delay_for(attempt).as_secs_f64();
            let spread = config.delay_for(attempt).as_secs_f64();
            assert!(
                (spread - exact).abs() <= exact * 0.25 + 1e-9,
                "attempt {attempt}: {spread} too far from {exact}"
            );
        }
    }

    #[test]
    fn uncapped_delay_saturates_instead_of_panicking() {
        let uncapped = ReconnectConfig {
            max_delay: Duration::MAX,
            max_retries: None,
            ..ReconnectConfig::default()
        };
        assert_eq!(uncapped.delay_for(3), Duration::from_secs(8));
        assert_eq!(uncapped.delay_for(100), Duration::MAX);
        assert_eq!(uncapped.delay_for(u32::MAX), Duration::MAX);

        let broken_jitter = ReconnectConfig {
            jitter_ratio: f64::NAN,
            ..ReconnectConfig::default()
        };
        assert_eq!(broken_jitter.delay_for(2), Duration::from_secs(4));

        let infinite_jitter = ReconnectConfig {
            jitter_ratio: f64::INFINITY,
            ..ReconnectConfig::default()
        };
        assert_eq!(infinite_jitter.delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn exhausted_honours_cap() {
        let capped = ReconnectConfig {
            max_retries: Some(3),
            ..ReconnectConfig::default()
        };
        assert!(!capped.exhausted(2));
        assert!(capped.exhausted(3));

        let forever = ReconnectConfig {
            max_retries: None,
            ..ReconnectConfig::default()
        };
        assert!(!forever.exhausted(u32::MAX));
    }
}
