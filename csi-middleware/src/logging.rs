//! Request/response logging stage.

use std::time::Instant;

use tracing::{Level, debug, enabled, warn};

use crate::chain::{CallResult, Next, Stage};
use crate::context::CallContext;
use crate::message::CsiRequest;

/// Logs every call with its method, correlation ID and elapsed time.
///
/// Requests are logged with their secrets replaced. Successful responses
/// are logged at debug level, failures at warn.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStage;

#[tonic::async_trait]
impl Stage for LoggingStage {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult {
        let method = request.method();
        let request_id = ctx.request_id().unwrap_or_default();
        let volume_id = request.volume_id().unwrap_or_default().to_string();

        if enabled!(Level::DEBUG) {
            debug!(method, request_id, request = ?request.redacted(), "CSI request");
        }

        let start = Instant::now();
        let result = next.run(ctx, request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => {
                debug!(method, request_id, elapsed_ms, response = ?response, "CSI response");
            }
            Err(status) => {
                warn!(
                    method,
                    request_id,
                    volume_id,
                    elapsed_ms,
                    code = ?status.code(),
                    message = status.message(),
                    "CSI call failed"
                );
            }
        }
        result
    }
}
