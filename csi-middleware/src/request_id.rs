//! Request correlation.
//!
//! Every call gets a numeric correlation ID: the one propagated by the
//! caller under `csi.requestid`, or a freshly allocated one. The rest of
//! the chain runs inside a tracing span carrying the ID and method, so all
//! log lines of a call can be tied together.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{Instrument, info_span};

use crate::chain::{CallResult, Next, Stage};
use crate::context::CallContext;
use crate::message::CsiRequest;

/// Process-wide ID source shared by every `RequestIdStage`.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Assigns or propagates the correlation ID of each call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestIdStage;

impl RequestIdStage {
    pub fn new() -> Self {
        Self
    }
}

#[tonic::async_trait]
impl Stage for RequestIdStage {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult {
        let (ctx, request_id) = match ctx.request_id() {
            Some(request_id) => (ctx, request_id),
            None => {
                let request_id = allocate_request_id();
                (ctx.with_request_id(request_id), request_id)
            }
        };

        let span = info_span!("csi", request_id, method = request.method());
        next.run(ctx, request).instrument(span).await
    }
}
