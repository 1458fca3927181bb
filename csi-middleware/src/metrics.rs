//! Prometheus metrics for the middleware
//!
//! Provides per-RPC call metrics, volume lock contention and retry counters.
//! Recording goes through the `metrics` facade, so nothing is exported until
//! a recorder is installed with [`init_metrics`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tonic::Code;
use tracing::info;

use crate::chain::{CallResult, Next, Stage};
use crate::context::CallContext;
use crate::message::{CsiRequest, operation_name};

/// Metric names
pub mod names {
    /// Counter: calls by operation and outcome (`success` or a status code label)
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: call duration in seconds by operation
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: calls turned away because their volume lock was busy
    pub const CSI_LOCK_PENDING_TOTAL: &str = "csi_lock_pending_total";
    /// Counter: calling-side retries by operation
    pub const CSI_RETRIES_TOTAL: &str = "csi_retries_total";
}

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(%addr, "Serving Prometheus metrics at /metrics");
    Ok(())
}

/// Count one completed call and record how long it took.
pub fn record_operation(operation: &'static str, outcome: &'static str, elapsed: Duration) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation, "status" => outcome)
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(elapsed.as_secs_f64());
}

pub fn record_lock_pending(operation: &'static str) {
    counter!(names::CSI_LOCK_PENDING_TOTAL, "operation" => operation).increment(1);
}

pub fn record_retry(operation: &'static str) {
    counter!(names::CSI_RETRIES_TOTAL, "operation" => operation).increment(1);
}

/// Label value for a call outcome, e.g. `failed_precondition`.
pub fn outcome_label(result: &CallResult) -> &'static str {
    let code = match result {
        Ok(_) => return "success",
        Err(status) => status.code(),
    };
    match code {
        Code::Ok => "success",
        Code::Cancelled => "cancelled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

/// Measures one call from creation until [`OperationTimer::finish`].
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Record the call under the label of its outcome.
    pub fn finish(self, result: &CallResult) {
        record_operation(self.operation, outcome_label(result), self.start.elapsed());
    }
}

/// Chain stage timing every call by operation and outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsStage;

#[tonic::async_trait]
impl Stage for MetricsStage {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult {
        let timer = OperationTimer::start(operation_name(request.method()));
        let result = next.run(ctx, request).await;
        timer.finish(&result);
        result
    }
}
