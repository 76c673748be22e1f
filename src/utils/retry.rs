//! Bounded fixed-delay retries for transient store failures

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::AuditResult;

/// Retry policy composed by the audit log around store-facing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Run `f` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Only transient errors (throttling, unavailability) are retried. The
/// operation must be idempotent. Cancellation interrupts the delay and
/// returns the last error.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancellationToken,
    mut f: F,
) -> AuditResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AuditResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(err.context(format!("{} failed after {} attempts", operation, attempt)));
        }

        warn!(
            operation,
            attempt,
            max_attempts,
            error = %err,
            "Transient store failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(err.context(format!("{} cancelled after {} attempts", operation, attempt)));
            }
            _ = tokio::time::sleep(policy.delay) => {}
        }
        attempt += 1;
    }
}
