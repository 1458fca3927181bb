//! Per-call execution context.
//!
//! A `CallContext` is created once per call from the transport metadata and
//! handed down the chain by value. Stages that need to add information (the
//! request identity stage assigning a correlation ID, for example) build an
//! extended copy with the `with_*` methods instead of mutating shared state.

use std::time::Duration;

use tokio::time::Instant;
use tonic::Request;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tracing::debug;

/// Metadata key carrying the numeric correlation ID of a call.
pub const REQUEST_ID_KEY: &str = "csi.requestid";

/// Metadata key carrying the protocol version declared by the caller.
pub const VERSION_KEY: &str = "csi.version";

/// Standard gRPC deadline header.
const GRPC_TIMEOUT_KEY: &str = "grpc-timeout";

/// Explicit, immutable call context threaded through every stage.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    request_id: Option<u64>,
    version: Option<String>,
    deadline: Option<Instant>,
    metadata: MetadataMap,
}

impl CallContext {
    /// Empty context: no correlation ID, no deadline, no metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from inbound request metadata.
    ///
    /// Picks up the correlation ID, the declared version and the
    /// `grpc-timeout` deadline. The remaining entries are kept so they can
    /// be propagated on outbound calls.
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let mut metadata = metadata.clone();

        let request_id = metadata
            .get(REQUEST_ID_KEY)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let version = metadata
            .get(VERSION_KEY)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let deadline = metadata
            .remove(GRPC_TIMEOUT_KEY)
            .and_then(|v| v.to_str().ok().and_then(parse_grpc_timeout))
            .map(|timeout| Instant::now() + timeout);

        Self {
            request_id,
            version,
            deadline,
            metadata,
        }
    }

    /// Correlation ID, if one has been assigned or propagated.
    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    /// Protocol version declared by the caller.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Instant after which the caller no longer waits for a result.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline (zero once it has passed).
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Propagated request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Add a propagated ASCII metadata entry.
    ///
    /// Entries whose key or value is not valid ASCII metadata are skipped.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        let Ok(name) = AsciiMetadataKey::from_bytes(key.as_bytes()) else {
            debug!(key, "Skipping invalid metadata key");
            return self;
        };
        match value.parse::<AsciiMetadataValue>() {
            Ok(value) => {
                self.metadata.insert(name, value);
            }
            Err(_) => debug!(key, "Skipping metadata value that is not valid ASCII"),
        }
        self
    }

    /// Metadata to send on an outbound call, including the correlation ID
    /// and the declared version.
    pub fn to_metadata(&self) -> MetadataMap {
        let mut metadata = self.metadata.clone();
        if let Some(request_id) = self.request_id {
            metadata.insert(REQUEST_ID_KEY, AsciiMetadataValue::from(request_id));
        }
        if let Some(Ok(value)) = self.version.as_deref().map(str::parse::<AsciiMetadataValue>) {
            metadata.insert(VERSION_KEY, value);
        }
        metadata
    }

    /// Wrap a message into a tonic request carrying this context's
    /// metadata and remaining deadline.
    pub fn into_request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        *request.metadata_mut() = self.to_metadata();
        if let Some(remaining) = self.remaining() {
            request.set_timeout(remaining);
        }
        request
    }
}

/// Parse a `grpc-timeout` header value (`<digits><unit>`).
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    // gRPC caps the amount at 8 digits
    if digits.len() > 8 {
        return None;
    }
    let amount = digits.parse::<u64>().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}
