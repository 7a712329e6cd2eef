//! Bounded microphone acquisition

use std::future::Future;
use std::time::Duration;
use voice_client_core::{CallError, Result};

/// Outcome of one acquisition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireError {
    /// Device busy, permission prompt pending, and similar; worth retrying
    Transient(String),
    /// Retrying cannot help
    Fatal(CallError),
}

/// Try to open the microphone up to `retries + 1` times with a fixed delay
///
/// `open` receives the 1-based attempt number and yields whatever the
/// backend holds on to. Exhausting every attempt yields
/// `CallError::PermissionDenied` carrying the number of attempts made.
pub async fn acquire_with_retry<T, F, Fut>(retries: u32, backoff: Duration, mut open: F) -> Result<T>
where
    F: FnMut(u32) -> Fut + Send,
    Fut: Future<Output = std::result::Result<T, AcquireError>> + Send,
{
    let attempts = retries + 1;

    for attempt in 1..=attempts {
        match open(attempt).await {
            Ok(acquired) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Microphone acquired after retry");
                }
                return Ok(acquired);
            },
            Err(AcquireError::Fatal(err)) => {
                tracing::warn!(attempt, error = %err, "Microphone acquisition failed permanently");
                return Err(err);
            },
            Err(AcquireError::Transient(reason)) => {
                tracing::warn!(attempt, attempts, %reason, "Microphone acquisition failed");
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            },
        }
    }

    Err(CallError::PermissionDenied { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let started = tokio::time::Instant::now();
        let result = acquire_with_retry(3, Duration::from_millis(500), |attempt| async move {
            if attempt < 3 {
                Err(AcquireError::Transient("busy".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_permission_denied() {
        let mut calls = 0;
        let result: Result<()> = acquire_with_retry(2, Duration::from_millis(100), |_| {
            calls += 1;
            std::future::ready(Err(AcquireError::Transient("denied".into())))
        })
        .await;

        assert_eq!(calls, 3);
        assert_eq!(result, Err(CallError::PermissionDenied { attempts: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_retrying() {
        let mut calls = 0;
        let result: Result<()> = acquire_with_retry(5, Duration::from_millis(100), |_| {
            calls += 1;
            std::future::ready(Err(AcquireError::Fatal(CallError::Device(
                "no input device".into(),
            ))))
        })
        .await;

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(CallError::Device(_))));
    }
}
