use std::time::Duration;

const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX: Duration = Duration::from_secs(60);
const DEFAULT_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL,
            max: DEFAULT_MAX,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// Exponential reconnect delay: `initial`, `initial * m`, `initial * m^2`, ...
/// capped at `max`, back to `initial` after [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial.min(config.max);
        Self { config, current }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay the next attempt would wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay for this attempt and advances to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let multiplier = if self.config.multiplier.is_finite() && self.config.multiplier >= 1.0 {
            self.config.multiplier
        } else {
            1.0
        };
        let next = delay.as_secs_f64() * multiplier;
        self.current = if next >= self.config.max.as_secs_f64() {
            self.config.max
        } else {
            Duration::from_secs_f64(next)
        };
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial.min(self.config.max);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn grows_by_half_each_attempt() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 1.5,
        });
        let delays: Vec<u128> = (0..4).map(|_| backoff.next_delay().as_micros()).collect();
        assert_eq!(delays, vec![100_000, 150_000, 225_000, 337_500]);
    }

    #[test_timeout::timeout]
    fn caps_at_maximum() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_secs(40),
            max: Duration::from_secs(60),
            multiplier: 1.5,
        });
        assert_eq!(backoff.next_delay(), Duration::from_secs(40));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test_timeout::timeout]
    fn reset_returns_to_initial_delay() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_millis(2250));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
