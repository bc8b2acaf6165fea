//! Per-call time budget for backend and provider calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{OpContext, Result, StorageError};

/// Runs `fut` under `budget`; an elapsed budget becomes [`StorageError::Timeout`].
pub(crate) async fn bounded<T, F>(budget: Duration, context: OpContext, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(%context, ?budget, "Storage call timed out");
            Err(StorageError::Timeout {
                context,
                after: budget,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_budget_is_timeout_error() {
        let context = OpContext::chat("get_recent", 3);
        let err = bounded(Duration::from_secs(1), context, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StorageError>(())
        })
        .await
        .unwrap_err();
        match err {
            StorageError::Timeout { context: c, after } => {
                assert_eq!(c, context);
                assert_eq!(after, Duration::from_secs(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_passes_result_through() {
        let out = bounded(Duration::from_secs(1), OpContext::new("x"), async { Ok(7) }).await;
        assert_eq!(out.unwrap(), 7);
    }
}
