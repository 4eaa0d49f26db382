//! Batch transaction retry
//!
//! Lock contention on the target database (SQLITE_BUSY, SQLITE_LOCKED, pool
//! exhaustion) is transient: the whole transaction is retried with the shared
//! backoff policy. Anything else fails at once.

use crate::error::{IngestError, IngestResult};
use crate::services::backoff::{sleep_cancellable, BackoffPolicy};
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Whether a database error is lock contention worth retrying
pub fn is_lock_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6, extended codes keep the low byte
            let primary = db_err
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            matches!(primary, Some(5) | Some(6))
                || db_err.message().contains("database is locked")
        }
        other => other.to_string().contains("database is locked"),
    }
}

/// Map a database error to `TransactionConflict` when it is lock contention
pub fn classify(err: IngestError) -> IngestError {
    match err {
        IngestError::Common(legis_common::Error::Database(ref db_err)) if is_lock_error(db_err) => {
            IngestError::TransactionConflict(db_err.to_string())
        }
        other => other,
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempt ceiling is reached
///
/// Each call of `operation` must be a complete transaction.
pub async fn retry_transaction<F, Fut, T>(
    operation_name: &str,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> IngestResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IngestResult<T>>,
{
    let start_time = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await.map_err(classify) {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if err.is_transient() && policy.allows_retry(attempt) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Database busy, will retry after backoff"
                );
                sleep_cancellable(delay, cancel).await?;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation failed: retry ceiling reached"
                    );
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy(attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let cancel = CancellationToken::new();
        let result = retry_transaction("test_op", &policy(3), &cancel, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_conflict_retried_then_succeeds() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = retry_transaction("test_op", &policy(4), &cancel, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(IngestError::TransactionConflict("database is locked".to_string()))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ceiling_reached() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: IngestResult<()> = retry_transaction("test_op", &policy(3), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::TransactionConflict("busy".to_string()))
        })
        .await;

        assert!(matches!(result, Err(IngestError::TransactionConflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_lock_error_fails_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: IngestResult<()> = retry_transaction("test_op", &policy(5), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::from(sqlx::Error::RowNotFound))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_timeout_is_lock_error() {
        assert!(is_lock_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_lock_error(&sqlx::Error::RowNotFound));
    }
}
