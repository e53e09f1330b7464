//! Retry of timed out device calls.
//!
//! Only [`ScanError::DeviceTimeout`] is retried; every other error, including
//! a failure reported by the device, is surfaced immediately.

use crate::error::ScanResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Defines a policy for retrying an operation.
///
/// Specifies how many times to retry a timed out operation and how long to
/// wait between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    ///
    /// Total attempts will be `max_attempts + 1`. Set to 0 to disable retries.
    pub max_attempts: u32,

    /// The constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// One retry after 50ms.
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: crate::limits::RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Run `op`, retrying while it times out and the budget allows.
///
/// `op` receives the zero-based attempt number.
pub async fn retry_on_timeout<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> ScanResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ScanResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                attempt += 1;
                warn!(attempt, error = %err, "device call timed out, retrying");
                if !policy.backoff_delay.is_zero() {
                    tokio::time::sleep(policy.backoff_delay).await;
                }
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout() -> ScanError {
        ScanError::DeviceTimeout {
            device: "samx".into(),
            operation: "set".into(),
            timeout: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_a_timeout_once() {
        let calls = AtomicU32::new(0);
        let result = retry_on_timeout(&RetryPolicy::default(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(timeout())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn surfaces_second_timeout() {
        let calls = AtomicU32::new(0);
        let result: ScanResult<()> = retry_on_timeout(&RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(timeout()) }
        })
        .await;
        assert!(matches!(result, Err(ScanError::DeviceTimeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn device_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ScanResult<()> = retry_on_timeout(&RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ScanError::DeviceError {
                    device: "samx".into(),
                    operation: "set".into(),
                    message: "stalled".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
