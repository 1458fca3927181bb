use std::collections::HashMap;

use tonic::Status;

use crate::context::CallContext;
use crate::csi;

/// Storage-side view of volume state, consulted to detect operations whose
/// effect already holds.
///
/// Implemented by the storage backend. Errors are returned to the caller
/// unchanged.
#[tonic::async_trait]
pub trait IdempotencyOracle: Send + Sync {
    /// ID of the volume named `name`, if it exists.
    async fn volume_id(&self, ctx: &CallContext, name: &str) -> Result<Option<String>, Status>;

    /// Volume attributes, looked up by `id` or else by `name`.
    async fn volume(
        &self,
        ctx: &CallContext,
        id: &str,
        name: &str,
    ) -> Result<Option<csi::Volume>, Status>;

    /// Publish context if `volume_id` is attached to `node_id`.
    async fn controller_published(
        &self,
        ctx: &CallContext,
        volume_id: &str,
        node_id: &str,
    ) -> Result<Option<HashMap<String, String>>, Status>;

    /// Whether `volume_id` is published at `target_path` on this host.
    async fn node_published(
        &self,
        ctx: &CallContext,
        volume_id: &str,
        publish_context: &HashMap<String, String>,
        target_path: &str,
    ) -> Result<bool, Status>;
}
