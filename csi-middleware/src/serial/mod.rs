//! Volume-scoped serialization and idempotency.
//!
//! [`SerialVolume`] admits at most one mutating call per volume at a time.
//! Calls are keyed by volume ID, except CreateVolume which is keyed by the
//! requested name. A call that cannot take its lock within the configured
//! timeout fails with an "operation pending" `FailedPrecondition` without
//! reaching the plugin.
//!
//! With an [`IdempotencyOracle`] configured, the stage asks the storage
//! backend whether the requested effect already holds (volume exists,
//! already attached, already unpublished...) and answers with a synthesized
//! success instead of repeating the side effect. After a failed attempt the
//! oracle is skipped for the next attempt of that method on that volume, so
//! the plugin gets a clean retry.
//!
//! CreateVolume takes the name lock first. If the oracle already knows a
//! volume by that name, the stage also takes the ID lock and looks the
//! volume up again by ID before answering from it, since the volume may
//! have been deleted in between.

mod memo;
mod oracle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tonic::{Code, Status};
use tracing::{debug, trace, warn};

pub use oracle::IdempotencyOracle;

use crate::chain::{CallResult, Next, Stage};
use crate::context::CallContext;
use crate::csi;
use crate::lock::{LockKey, LockProvider, VolumeLock};
use crate::message::{CsiRequest, CsiResponse, operation_name};
use crate::metrics;
use memo::ErrorMemo;

/// Message prefix of the "operation pending" error.
pub const OPERATION_PENDING: &str = "operation pending";

/// Error returned when the lock for `key` could not be obtained.
pub fn operation_pending(key: &LockKey) -> Status {
    Status::failed_precondition(format!("{OPERATION_PENDING} for {key}"))
}

/// Whether `status` reports a busy volume lock.
pub fn is_operation_pending(status: &Status) -> bool {
    status.code() == Code::FailedPrecondition && status.message().starts_with(OPERATION_PENDING)
}

fn volume_not_found(volume_id: &str) -> Status {
    Status::not_found(format!("volume {volume_id} not found"))
}

/// How a request is serialized.
enum Plan {
    PassThrough,
    Create { name: String },
    Volume { key: LockKey, check: Check },
}

/// Oracle check for an ID-keyed request.
enum Check {
    /// Serialization only.
    None,
    Delete,
    ControllerPublish {
        node_id: String,
    },
    ControllerUnpublish {
        node_id: String,
    },
    NodePublish {
        publish_context: HashMap<String, String>,
        target_path: String,
    },
    NodeUnpublish {
        target_path: String,
    },
}

impl Plan {
    fn volume(volume_id: &str, check: Check) -> Self {
        let key = LockKey::id(volume_id);
        if key.is_empty() {
            // Left for the validator to reject
            return Plan::PassThrough;
        }
        Plan::Volume { key, check }
    }

    fn of(request: &CsiRequest) -> Self {
        match request {
            CsiRequest::CreateVolume(r) if !r.name.is_empty() => Plan::Create {
                name: r.name.clone(),
            },
            CsiRequest::DeleteVolume(r) => Plan::volume(&r.volume_id, Check::Delete),
            CsiRequest::ControllerPublishVolume(r) => Plan::volume(
                &r.volume_id,
                Check::ControllerPublish {
                    node_id: r.node_id.clone(),
                },
            ),
            CsiRequest::ControllerUnpublishVolume(r) => Plan::volume(
                &r.volume_id,
                Check::ControllerUnpublish {
                    node_id: r.node_id.clone(),
                },
            ),
            CsiRequest::ControllerExpandVolume(r) => Plan::volume(&r.volume_id, Check::None),
            CsiRequest::NodeStageVolume(r) => Plan::volume(&r.volume_id, Check::None),
            CsiRequest::NodeUnstageVolume(r) => Plan::volume(&r.volume_id, Check::None),
            CsiRequest::NodePublishVolume(r) => Plan::volume(
                &r.volume_id,
                Check::NodePublish {
                    publish_context: r.publish_context.clone(),
                    target_path: r.target_path.clone(),
                },
            ),
            CsiRequest::NodeUnpublishVolume(r) => Plan::volume(
                &r.volume_id,
                Check::NodeUnpublish {
                    target_path: r.target_path.clone(),
                },
            ),
            _ => Plan::PassThrough,
        }
    }
}

/// A held volume lock.
struct Held {
    key: LockKey,
    lock: Box<dyn VolumeLock>,
}

/// Chain stage serializing mutating calls per volume.
pub struct SerialVolume {
    locks: Arc<dyn LockProvider>,
    oracle: Option<Arc<dyn IdempotencyOracle>>,
    timeout: Duration,
    require_volume_exists: bool,
    memo: ErrorMemo,
}

impl std::fmt::Debug for SerialVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialVolume")
            .field("timeout", &self.timeout)
            .field("oracle", &self.oracle.is_some())
            .field("require_volume_exists", &self.require_volume_exists)
            .finish_non_exhaustive()
    }
}

impl SerialVolume {
    /// Serialize on `locks`, never waiting on a held lock.
    pub fn new(locks: Arc<dyn LockProvider>) -> Self {
        Self {
            locks,
            oracle: None,
            timeout: Duration::ZERO,
            require_volume_exists: false,
            memo: ErrorMemo::default(),
        }
    }

    /// How long to wait for a busy lock. Zero never waits on a held lock.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn IdempotencyOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Report NotFound instead of success when deleting or unpublishing a
    /// volume the oracle does not know.
    pub fn with_require_volume_exists(mut self, require: bool) -> Self {
        self.require_volume_exists = require;
        self
    }

    async fn acquire(
        &self,
        ctx: &CallContext,
        key: LockKey,
        method: &'static str,
    ) -> Result<Held, Status> {
        let mut lock = match self.locks.lock(ctx, &key).await {
            Ok(lock) => lock,
            Err(err) if err.is_cancelled() => return Err(self.pending(&key, method)),
            Err(err) => return Err(err.into()),
        };

        let outcome = lock.try_lock(self.timeout).await;
        if let Ok(true) = outcome {
            trace!(key = %key, method, "Volume lock acquired");
            return Ok(Held { key, lock });
        }

        if let Err(error) = lock.close().await {
            warn!(key = %key, error = %error, "Failed to close volume lock session");
        }
        match outcome {
            Err(err) if !err.is_cancelled() => Err(err.into()),
            _ => Err(self.pending(&key, method)),
        }
    }

    fn pending(&self, key: &LockKey, method: &'static str) -> Status {
        debug!(key = %key, method, "Volume lock busy, operation pending");
        metrics::record_lock_pending(operation_name(method));
        operation_pending(key)
    }

    /// Record the outcome in the error memo, then release the lock.
    async fn release(&self, held: Held, method: &'static str, result: &CallResult) {
        self.memo.record(&held.key, method, result);

        let Held { key, mut lock } = held;
        if let Err(error) = lock.unlock().await {
            warn!(key = %key, error = %error, "Failed to release volume lock");
        }
        if let Err(error) = lock.close().await {
            warn!(key = %key, error = %error, "Failed to close volume lock session");
        }
        trace!(key = %key, method, "Volume lock released");
    }

    /// Whether the oracle is skipped for this attempt.
    fn bypass(&self, key: &LockKey, method: &'static str) -> bool {
        let bypass = self.memo.contains(key, method);
        if bypass {
            debug!(key = %key, method, "Previous attempt failed, skipping idempotency check");
        }
        bypass
    }

    async fn serialize(
        &self,
        ctx: CallContext,
        request: CsiRequest,
        key: LockKey,
        check: Check,
        next: Next<'_>,
    ) -> CallResult {
        let method = request.method();
        let held = self.acquire(&ctx, key, method).await?;
        let volume_id = held.key.value();

        let result = match self.oracle.as_deref() {
            Some(oracle) if !matches!(check, Check::None) && !self.bypass(&held.key, method) => {
                match self.satisfied(oracle, &ctx, volume_id, &check).await {
                    Ok(Some(response)) => {
                        debug!(volume_id = %volume_id, method, "Operation already satisfied");
                        Ok(response)
                    }
                    Ok(None) => next.run(ctx, request).await,
                    Err(status) => Err(status),
                }
            }
            _ => next.run(ctx, request).await,
        };

        self.release(held, method, &result).await;
        result
    }

    /// Response to return without calling the plugin, if the requested
    /// effect already holds.
    async fn satisfied(
        &self,
        oracle: &dyn IdempotencyOracle,
        ctx: &CallContext,
        volume_id: &str,
        check: &Check,
    ) -> Result<Option<CsiResponse>, Status> {
        if let Check::None = check {
            return Ok(None);
        }
        let exists = oracle.volume(ctx, volume_id, "").await?.is_some();

        let response = match check {
            Check::None => None,
            Check::Delete => {
                if !exists {
                    return self.absent(volume_id, csi::DeleteVolumeResponse {}.into());
                }
                None
            }
            Check::ControllerPublish { node_id } => {
                if !exists {
                    return Err(volume_not_found(volume_id));
                }
                oracle
                    .controller_published(ctx, volume_id, node_id)
                    .await?
                    .map(|publish_context| {
                        csi::ControllerPublishVolumeResponse { publish_context }.into()
                    })
            }
            Check::ControllerUnpublish { node_id } => {
                let response = csi::ControllerUnpublishVolumeResponse {}.into();
                if !exists {
                    return self.absent(volume_id, response);
                }
                // An empty node means every node, the plugin decides
                if node_id.is_empty() {
                    return Ok(None);
                }
                match oracle.controller_published(ctx, volume_id, node_id).await? {
                    Some(_) => None,
                    None => Some(response),
                }
            }
            Check::NodePublish {
                publish_context,
                target_path,
            } => {
                if !exists {
                    return Err(volume_not_found(volume_id));
                }
                oracle
                    .node_published(ctx, volume_id, publish_context, target_path)
                    .await?
                    .then(|| csi::NodePublishVolumeResponse {}.into())
            }
            Check::NodeUnpublish { target_path } => {
                let response = csi::NodeUnpublishVolumeResponse {}.into();
                if !exists {
                    return self.absent(volume_id, response);
                }
                let published = oracle
                    .node_published(ctx, volume_id, &HashMap::new(), target_path)
                    .await?;
                (!published).then_some(response)
            }
        };
        Ok(response)
    }

    /// Outcome of a removal call for a volume that does not exist.
    fn absent(&self, volume_id: &str, success: CsiResponse) -> Result<Option<CsiResponse>, Status> {
        if self.require_volume_exists {
            return Err(volume_not_found(volume_id));
        }
        Ok(Some(success))
    }

    async fn create(
        &self,
        ctx: CallContext,
        request: CsiRequest,
        name: String,
        next: Next<'_>,
    ) -> CallResult {
        let method = request.method();
        let held = self
            .acquire(&ctx, LockKey::Name(name.clone()), method)
            .await?;

        let result = match self.oracle.as_deref() {
            Some(oracle) if !self.bypass(&held.key, method) => {
                match oracle.volume_id(&ctx, &name).await {
                    Ok(Some(volume_id)) if !volume_id.is_empty() => {
                        self.create_existing(oracle, ctx, request, volume_id, next)
                            .await
                    }
                    Ok(_) => next.run(ctx, request).await,
                    Err(status) => Err(status),
                }
            }
            _ => next.run(ctx, request).await,
        };

        self.release(held, method, &result).await;
        result
    }

    /// Second phase of CreateVolume once the name is known to be taken.
    async fn create_existing(
        &self,
        oracle: &dyn IdempotencyOracle,
        ctx: CallContext,
        request: CsiRequest,
        volume_id: String,
        next: Next<'_>,
    ) -> CallResult {
        let method = request.method();
        let held = self
            .acquire(&ctx, LockKey::Id(volume_id.clone()), method)
            .await?;

        let result = if self.bypass(&held.key, method) {
            next.run(ctx, request).await
        } else {
            match oracle.volume(&ctx, &volume_id, "").await {
                Ok(Some(volume)) => {
                    debug!(volume_id = %volume_id, "Volume already exists");
                    Ok(csi::CreateVolumeResponse {
                        volume: Some(volume),
                    }
                    .into())
                }
                // Deleted since the name lookup
                Ok(None) => next.run(ctx, request).await,
                Err(status) => Err(status),
            }
        };

        self.release(held, method, &result).await;
        result
    }
}

#[tonic::async_trait]
impl Stage for SerialVolume {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult {
        match Plan::of(&request) {
            Plan::PassThrough => next.run(ctx, request).await,
            Plan::Create { name } => self.create(ctx, request, name, next).await,
            Plan::Volume { key, check } => self.serialize(ctx, request, key, check, next).await,
        }
    }
}
