//! Exponential backoff for cache backend calls.

use std::future::Future;

use keel_core::{CacheError, KeelResult, RetryConfig};

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only transient errors (see `KeelError::is_transient`) are retried. When the
/// attempts run out the last error is wrapped in `CacheError::Transient`.
pub async fn with_backoff<T, F, Fut>(retry: &RetryConfig, operation: &str, mut op: F) -> KeelResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KeelResult<T>>,
{
    let max_attempts = retry.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = retry.delay_after(attempt);
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Cache operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_transient() => {
                return Err(CacheError::Transient {
                    operation: operation.to_string(),
                    attempts: attempt,
                    reason: err.to_string(),
                }
                .into())
            }
            Err(err) => return Err(err),
        }
    }

    Err(CacheError::Transient {
        operation: operation.to_string(),
        attempts: max_attempts,
        reason: "no attempt made".to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::KeelError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn transient() -> KeelError {
        CacheError::Backend {
            reason: "connection reset".to_string(),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = tokio::time::Instant::now();

        let value = with_backoff(&RetryConfig::default(), "get", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 10ms then 20ms
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retry = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        };

        let err = with_backoff(&retry, "set", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            KeelError::Cache(CacheError::Transient {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "set");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected transient error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = with_backoff(&RetryConfig::default(), "get", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(KeelError::from(CacheError::Serialization {
                reason: "bad bytes".to_string(),
            }))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, KeelError::Cache(CacheError::Serialization { .. })));
    }
}
