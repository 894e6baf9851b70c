//! Retry-until-success-or-cancelled polling
//!
//! Used for every bounded wait in a switchover: replica sync, traffic
//! binding confirmation and gateway readiness.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Run `op` every `interval` until it succeeds, `deadline` elapses or `cancel` fires.
///
/// Cancellation is observed while an attempt is in flight and while sleeping
/// between attempts, so it never waits for the next tick. The error returned at
/// the deadline carries the last attempt's failure.
pub async fn poll_until_success_or_cancelled<T, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    deadline: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let expiry = tokio::time::sleep(deadline);
    tokio::pin!(expiry);

    let mut last_error = String::from("no attempt completed");
    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = &mut expiry => return Err(Error::DeadlineExceeded { last_error }),
            result = op() => result,
        };

        match attempt {
            Ok(value) => return Ok(value),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                debug!("Poll attempt failed, retrying: {}", e);
                last_error = e.to_string();
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = &mut expiry => return Err(Error::DeadlineExceeded { last_error }),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let result = poll_until_success_or_cancelled(
            &cancel,
            Duration::from_millis(5),
            Duration::from_secs(5),
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::TrafficCoordinatorError("not yet".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_reports_last_error() {
        let cancel = CancellationToken::new();
        let result: Result<()> = poll_until_success_or_cancelled(
            &cancel,
            Duration::from_millis(5),
            Duration::from_millis(50),
            || async { Err(Error::TrafficCoordinatorError("still binding".to_string())) },
        )
        .await;
        match result {
            Err(Error::DeadlineExceeded { last_error }) => {
                assert!(last_error.contains("still binding"))
            }
            other => panic!("expected deadline, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_long_interval() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<()> = poll_until_success_or_cancelled(
            &cancel,
            Duration::from_secs(60),
            Duration::from_secs(120),
            || async { Err(Error::TrafficCoordinatorError("waiting".to_string())) },
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_in_flight_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<()> = poll_until_success_or_cancelled(
            &cancel,
            Duration::from_millis(5),
            Duration::from_secs(120),
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
