use std::time::Duration;

use rand::Rng;

/// An exponential strategy: the cool-off grows as
/// `base_interval * factor^(attempt - 1)`, capped at `max_interval`, with
/// optional jitter applied to spread out competing retriers.
#[derive(Debug, Clone)]
pub struct Exponential {
    /// The starting retry interval.
    base_interval: Duration,
    /// The cap on the retry interval.
    max_interval: Duration,
    /// The multiplier applied per attempt.
    factor: f64,
    /// Randomization factor between 0.0 and 1.0; 0.0 disables jitter.
    jitter: f64,
    /// Maximum number of retries. `None` retries indefinitely.
    max_attempts: Option<u16>,
    current_attempt: u16,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter,
            max_attempts,
            current_attempt: 0,
        }
    }

    pub fn from_millis(
        base_interval_ms: u64,
        max_interval_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms),
            Duration::from_millis(max_interval_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Resets the attempt counter so the strategy starts over from the base
    /// interval. Call after a successful attempt when reusing the strategy.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    fn delay_for(&self, attempt: u16) -> Duration {
        // attempt is always >= 1 here; powi(0) gives the base interval
        let base_ms = (self.base_interval.as_millis() as f64)
            * self.factor.powi(i32::from(attempt) - 1);

        if self.jitter == 0.0 {
            return Duration::from_millis(base_ms as u64).min(self.max_interval);
        }

        // jitter of j scales the delay uniformly into [1-j, 1+j]
        let scale: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base_ms * scale) as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.current_attempt >= max_attempts
        {
            return None;
        }
        self.current_attempt += 1;
        Some(self.delay_for(self.current_attempt))
    }
}
