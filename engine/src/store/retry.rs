//! Bounded retry for transient storage failures.
//!
//! Only [`StorageError::Unavailable`] is retried. Conflicts and corruption are
//! business-level outcomes and go straight back to the caller.
//!
//! Backoff doubles from `initial_backoff_ms` up to `max_backoff_ms`.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// How hard to retry a storage call before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

/// Run a storage operation, retrying transient failures up to the policy bound.
pub fn with_retry<T, F>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> StorageResult<T>
where
    F: FnMut() -> StorageResult<T>,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff_ms = policy.initial_backoff_ms;
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation() {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Storage operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %err,
                        "Storage operation failed: retries exhausted"
                    );
                    return Err(err);
                }

                let sleep_ms = backoff_ms.min(policy.max_backoff_ms);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = sleep_ms,
                    error = %err,
                    "Storage unavailable, will retry after backoff"
                );
                if sleep_ms > 0 {
                    thread::sleep(Duration::from_millis(sleep_ms));
                }
                backoff_ms = (backoff_ms.max(1) * 2).min(policy.max_backoff_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    #[test]
    fn test_succeeds_first_attempt() {
        let mut calls = 0;
        let result = with_retry(&fast(3), "read", || {
            calls += 1;
            Ok::<_, StorageError>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retries_transient_then_succeeds() {
        let mut calls = 0;
        let result = with_retry(&fast(3), "read", || {
            calls += 1;
            if calls < 3 {
                Err(StorageError::unavailable("k", "timeout"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_gives_up_after_bound() {
        let mut calls = 0;
        let result: StorageResult<()> = with_retry(&fast(2), "read", || {
            calls += 1;
            Err(StorageError::unavailable("k", "down"))
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_conflict_not_retried() {
        let mut calls = 0;
        let result: StorageResult<()> = with_retry(&fast(5), "write", || {
            calls += 1;
            Err(StorageError::Conflict {
                key: "k".into(),
                expected: 1,
                found: 2,
            })
        });
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        assert_eq!(calls, 1);
    }
}
