//! Retry-with-backoff utilities.
//!
//! A backoff [`strategy`] is any `Iterator<Item = Duration>`; exhaustion of the
//! iterator ends the retries. [`retry`] drives an async operation against a
//! strategy and a predicate that decides whether an error is worth retrying.

pub mod strategy;

mod retry;
pub use retry::retry;
