//! Deadline wrapper for store calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Bound `fut` by `limit`; a timeout becomes an error of `kind` naming `op`.
///
/// `kind` is the error kind of the call being bounded, so a slow relational
/// write surfaces as [`Error::StoreWrite`] and a slow broker as
/// [`Error::BrokerUnavailable`].
pub async fn bounded<T, F>(op: &str, limit: Duration, kind: fn(String) -> Error, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(kind(format!("{op} timed out after {}ms", limit.as_millis()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_uses_kind_and_names_op() {
        let err = bounded(
            "commit_aggregates",
            Duration::from_millis(5),
            Error::StoreWrite,
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, Error::StoreWrite(ref m) if m == "commit_aggregates timed out after 5ms")
        );
    }

    #[tokio::test]
    async fn test_inner_result_passes_through() {
        let ok = bounded("recent", Duration::from_secs(1), Error::Cache, async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);

        let err = bounded::<(), _>("recent", Duration::from_secs(1), Error::Cache, async {
            Err(Error::InvalidInput("bad".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
