//! Bounded exponential backoff around fallible async operations

use std::future::Future;

use swarmroute_core::{Result, RetryPolicy};
use tracing::{debug, warn};

/// Retry `op` according to `policy`.
///
/// Errors that are not retryable end the loop at once. `op` receives the
/// 0-indexed attempt number.
pub async fn retry_with_backoff<T, F, Fut>(name: &str, policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => match policy.next_delay(attempt) {
                Some(delay) => {
                    debug!("{} attempt {} failed ({}), retrying in {:?}", name, attempt + 1, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!("{} failed after {} attempts: {}", name, attempt + 1, e);
                    return Err(e);
                }
            },
        }
    }
}
