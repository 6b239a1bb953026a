//! Backoff strategies. A strategy is an `Iterator<Item = Duration>` whose
//! items are the cool-off periods between retry attempts.

pub mod exponential;
pub mod fixed;
