//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether an error is worth retrying against the same backend
//! - Execute retries with exponential backoff + jitter
//!
//! # Design Decisions
//! - Never retry authentication, configuration or caller-input errors
//! - Never retry local guard failures; the caller fails over instead
//! - Jittered backoff prevents thundering herd

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::resilience::backoff::retry_delay;

/// Run `operation`, retrying up to `max_retries` times on retryable errors.
///
/// Returns the last error once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(
    backend: &str,
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries && e.is_retryable() => {
                let delay = retry_delay(attempt, base_delay);
                tracing::debug!(
                    backend = %backend,
                    attempt = attempt + 1,
                    max_retries,
                    delay = ?delay,
                    error = %e,
                    "Retrying call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
