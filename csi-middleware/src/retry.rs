//! Calling-side retry with exponential backoff.
//!
//! Only meant for the calling side of an RPC. The serving side reports
//! "operation pending" to its caller and leaves the retry policy to it.

use std::time::Duration;

use tonic::Status;
use tracing::warn;

use crate::chain::{CallResult, Next, Stage};
use crate::context::CallContext;
use crate::message::{CsiRequest, operation_name};
use crate::metrics;
use crate::serial::is_operation_pending;

/// Maximum number of retry attempts for transient failures
const MAX_RETRIES: u32 = 3;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 5000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: u32 = 2;

/// Check if a call outcome indicates a retryable error.
///
/// Retryable errors are transient failures that may succeed on retry:
/// - Unavailable: Server temporarily unavailable
/// - ResourceExhausted: Rate limited, may succeed after backoff
/// - Aborted: Operation aborted, can be retried
/// - Unknown: Unknown error, might be transient
/// - Operation pending: another call holds the volume lock
pub fn is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        tonic::Code::Unavailable
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted
            | tonic::Code::Unknown
    ) || is_operation_pending(status)
}

/// Stage re-running the rest of the chain on retryable errors.
#[derive(Debug, Clone)]
pub struct RetryStage {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryStage {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl RetryStage {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }
}

#[tonic::async_trait]
impl Stage for RetryStage {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult {
        let operation = operation_name(request.method());
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let status = match next.run(ctx.clone(), request.clone()).await {
                Ok(response) => return Ok(response),
                Err(status) => status,
            };
            attempt += 1;

            // Never sleep past the caller's deadline
            let out_of_time = ctx.remaining().is_some_and(|remaining| remaining <= backoff);
            if !is_retryable(&status) || attempt > self.max_retries || out_of_time {
                if attempt > 1 {
                    warn!(
                        operation,
                        attempts = attempt,
                        code = ?status.code(),
                        "Operation failed after retries"
                    );
                }
                return Err(status);
            }

            warn!(
                operation,
                attempt,
                max_retries = self.max_retries,
                code = ?status.code(),
                backoff_ms = backoff.as_millis() as u64,
                "Retryable error, backing off"
            );

            // Record retry metric
            metrics::record_retry(operation);

            tokio::time::sleep(backoff).await;

            // Exponential backoff with cap
            backoff = (backoff * BACKOFF_MULTIPLIER).min(self.max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tonic::Code;

    use super::*;
    use crate::chain::{Handler, Pipeline};
    use crate::csi;
    use crate::lock::LockKey;
    use crate::serial::operation_pending;

    /// Fails with the given status a number of times, then succeeds.
    struct Flaky {
        status: Status,
        failures: usize,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(status: Status, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                status,
                failures,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[tonic::async_trait]
    impl Handler for Flaky {
        async fn call(&self, _ctx: CallContext, _request: CsiRequest) -> CallResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.status.clone());
            }
            Ok(csi::DeleteVolumeResponse {}.into())
        }
    }

    fn fast_retry() -> Arc<RetryStage> {
        Arc::new(RetryStage::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
        ))
    }

    fn delete() -> CsiRequest {
        csi::DeleteVolumeRequest {
            volume_id: "vol-1".into(),
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&Status::unavailable("down")));
        assert!(is_retryable(&Status::aborted("conflict")));
        assert!(is_retryable(&operation_pending(&LockKey::id("v"))));
        assert!(!is_retryable(&Status::failed_precondition("wrong state")));
        assert!(!is_retryable(&Status::not_found("gone")));
        assert!(!is_retryable(&Status::invalid_argument("bad")));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let handler = Flaky::new(Status::unavailable("down"), 2);
        let pipeline = Pipeline::new(vec![fast_retry()], handler.clone());

        pipeline.invoke(CallContext::new(), delete()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_operation_pending() {
        let handler = Flaky::new(operation_pending(&LockKey::id("vol-1")), 1);
        let pipeline = Pipeline::new(vec![fast_retry()], handler.clone());

        pipeline.invoke(CallContext::new(), delete()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let handler = Flaky::new(Status::unavailable("down"), 10);
        let pipeline = Pipeline::new(vec![fast_retry()], handler.clone());

        let err = pipeline.invoke(CallContext::new(), delete()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let handler = Flaky::new(Status::not_found("gone"), 10);
        let pipeline = Pipeline::new(vec![fast_retry()], handler.clone());

        let err = pipeline.invoke(CallContext::new(), delete()).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stops_at_deadline() {
        let handler = Flaky::new(Status::unavailable("down"), 10);
        let retry = Arc::new(RetryStage::new(
            3,
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let pipeline = Pipeline::new(vec![retry], handler.clone());

        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let start = std::time::Instant::now();
        pipeline.invoke(ctx, delete()).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
