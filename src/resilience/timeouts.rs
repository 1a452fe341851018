//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap backend calls with a deadline
//! - Map elapsed deadlines to `OrchestratorError::Timeout`
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - The wrapped future is dropped on timeout; the remote side may still finish

use std::future::Future;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Race `future` against `after`.
pub async fn with_timeout<T, F>(backend: &str, after: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, future).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::Timeout {
            backend: backend.to_string(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_fires() {
        let result: Result<()> = with_timeout("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(OrchestratorError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_inner_result_passes_through() {
        let result = with_timeout("fast", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
