//! Resilience: bounded retries for backend calls.
//!
//! Each attempt runs under its own timeout. Transient failures back off
//! exponentially (`initial, 2×initial, 4×initial, …` capped at `max`);
//! permanent failures stop immediately.
//!
//! ```text
//! attempt 1 ──Transient──► sleep(b) ──► attempt 2 ──Transient──► sleep(2b) ──► …
//!     └─Permanent──► Exhausted { attempts: 1 }
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::error::BackendError;

/// Retry and per-attempt timeout policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Timeout applied to each attempt individually.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// All attempts failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: BackendError,
}

/// Run `op` under `policy`, retrying transient failures with backoff.
///
/// `label` identifies the call in logs.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let timeout = policy.attempt_timeout();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_transient() || attempt >= max_attempts {
            return Err(RetryExhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        let backoff = policy.backoff_after(attempt);
        warn!(
            call = label,
            attempt,
            max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Transient backend error, retrying"
        );
        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 250,
            attempt_timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff_after(1), Duration::from_millis(100));
        assert_eq!(p.backoff_after(2), Duration::from_millis(200));
        assert_eq!(p.backoff_after(3), Duration::from_millis(250));
        assert_eq!(p.backoff_after(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&policy(3), "test", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Transient("503".into()))
            }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&policy(5), "test", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Permanent("bad column".into()))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let result = retry_with_backoff(&policy(2), "test", |attempt| async move {
            if attempt == 1 {
                std::future::pending::<()>().await;
            }
            Ok::<_, BackendError>(attempt)
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
