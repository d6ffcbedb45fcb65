use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Same delay between every attempt, forever. Bound it with [`Iterator::take`].
pub struct Interval {
    interval: Duration,
}

impl Interval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.interval)
    }
}

/// Exponentially growing delay `base * factor^(attempt - 1)`, capped at `max`, with a
/// multiplicative jitter drawn from `[1 - jitter, 1 + jitter]`.
pub struct Exponential {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    /// `None` retries forever.
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(
        base: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base,
            max,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_millis(
        base_ms: u64,
        max_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Starts over from the base delay, e.g. after a successful poll.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    fn delay(&self, attempt: u16) -> Duration {
        let exponent = i32::from(attempt.max(1) - 1);
        let mut millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

impl From<&RetryConfig> for Exponential {
    /// Retries a delivery `max_attempts - 1` times after the first try.
    fn from(config: &RetryConfig) -> Self {
        Exponential::from_millis(
            config.initial_interval_ms,
            config.max_interval_ms,
            config.factor,
            config.jitter,
            Some(config.max_attempts.saturating_sub(1)),
        )
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.attempt >= max_attempts
        {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_repeats() {
        let mut interval = Interval::from_millis(5);
        assert_eq!(interval.next(), Some(Duration::from_millis(5)));
        assert_eq!(interval.next(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn exponential_grows_and_caps() {
        let delays: Vec<_> = Exponential::from_millis(100, 500, 2.0, 0.0, None)
            .take(5)
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn exponential_stops_after_max_attempts() {
        let mut backoff = Exponential::from_millis(1, 10, 2.0, 0.0, Some(2));
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 0.5, None);
        let delay = backoff.next().unwrap();
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn retry_config_counts_the_first_try() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_interval_ms: 1,
            max_interval_ms: 1,
            factor: 1.0,
            jitter: 0.0,
        };
        assert_eq!(Exponential::from(&config).count(), 2);
    }
}
