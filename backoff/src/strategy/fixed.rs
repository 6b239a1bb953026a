use std::time::Duration;

/// A fixed-interval strategy: every retry cools off for the same duration,
/// forever. Bound the number of attempts with [`Iterator::take`].
#[derive(Debug, Clone)]
pub struct Interval {
    duration: Duration,
}

impl Interval {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.duration)
    }
}
