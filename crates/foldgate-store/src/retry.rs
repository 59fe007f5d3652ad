// SPDX-License-Identifier: Apache-2.0

use crate::{StoreError, StoreErrorCode};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 120,
        }
    }
}

/// Retries a whole transaction on transient backend errors. Retry happens at
/// the transaction level only; a half-finalized transaction has already
/// rolled itself back, so re-running the closure starts clean.
pub async fn with_transaction_retry<T, Fut, F>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last: Option<StoreError> = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if err.code.is_transient() => {
                last = Some(err);
                if attempt + 1 < attempts {
                    let backoff = policy.base_backoff_ms.saturating_mul(attempt as u64 + 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| StoreError::new(StoreErrorCode::Internal, "retry budget empty")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
        };
        let out = with_transaction_retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n < 2 {
                    Err(StoreError::new(StoreErrorCode::Io, "flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .expect("eventually succeeds");
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let err = with_transaction_retry::<(), _, _>(&policy, || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StoreError::new(StoreErrorCode::Validation, "bad input")) }
        })
        .await
        .expect_err("fails fast");
        assert_eq!(err.code, StoreErrorCode::Validation);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
