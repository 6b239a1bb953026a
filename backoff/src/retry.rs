use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Runs `operation`, retrying failures for which `can_retry` returns true,
/// sleeping between attempts for the durations yielded by `backoff`.
///
/// The first run is not a retry: a strategy yielding `n` durations allows
/// `n + 1` attempts in total. A non-retryable error, or exhaustion of the
/// strategy, returns the last error observed.
pub async fn retry<I, F, Fut, T, E, C>(backoff: I, mut operation: F, can_retry: C) -> Result<T, E>
where
    I: IntoIterator<Item = Duration>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let mut backoff = backoff.into_iter();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !can_retry(&e) {
                    return Err(e);
                }
                match backoff.next() {
                    Some(interval) => sleep(interval).await,
                    None => return Err(e),
                }
            }
        }
    }
}
