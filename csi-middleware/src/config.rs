//! Middleware configuration and pipeline assembly.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::chain::{Handler, Pipeline, Stage};
use crate::lock::{self, EtcdConfig, EtcdLockProvider, LockProvider, MemoryLockProvider};
use crate::logging::LoggingStage;
use crate::metrics::MetricsStage;
use crate::request_id::RequestIdStage;
use crate::serial::{IdempotencyOracle, SerialVolume};
use crate::validator::{SpecValidator, ValidatorConfig};

/// Where volume locks live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LockBackend {
    /// Process-local lock table
    #[default]
    Memory,
    /// Leases in an etcd cluster, shared by every process using the domain
    Etcd(EtcdConfig),
}

/// Serving-side middleware settings.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// How long a call waits for a busy volume lock. Zero never waits on a
    /// held lock.
    pub lock_timeout: Duration,
    pub lock_backend: LockBackend,
    /// Install the serialization/idempotency stage.
    pub serialize_volumes: bool,
    /// Report NotFound for delete/unpublish of volumes the oracle does not know.
    ///
    /// With an oracle and this unset, deleting an unknown volume succeeds
    /// before the validator sees it, so the validator's
    /// `success_delete_not_found` setting has no effect.
    pub require_volume_exists: bool,
    pub validator: ValidatorConfig,
    pub logging: bool,
    pub metrics: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            lock_backend: LockBackend::Memory,
            serialize_volumes: true,
            require_volume_exists: false,
            validator: ValidatorConfig::default(),
            logging: true,
            metrics: true,
        }
    }
}

/// Assembles the serving-side stage order:
/// request ID, logging, metrics, validator, serialization, then any extra
/// stages, then the terminal handler.
pub struct PipelineBuilder {
    config: MiddlewareConfig,
    oracle: Option<Arc<dyn IdempotencyOracle>>,
    locks: Option<Arc<dyn LockProvider>>,
    extra: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new(config: MiddlewareConfig) -> Self {
        Self {
            config,
            oracle: None,
            locks: None,
            extra: Vec::new(),
        }
    }

    /// Storage-side lookups used to short-circuit repeated calls.
    pub fn oracle(mut self, oracle: Arc<dyn IdempotencyOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Use this provider instead of the one described by the lock backend.
    pub fn lock_provider(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Append a stage after the built-in ones.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.extra.push(stage);
        self
    }

    async fn locks(&mut self) -> lock::Result<Arc<dyn LockProvider>> {
        if let Some(locks) = self.locks.take() {
            return Ok(locks);
        }
        match &self.config.lock_backend {
            LockBackend::Memory => Ok(Arc::new(MemoryLockProvider::new())),
            LockBackend::Etcd(etcd) => {
                info!(
                    endpoints = ?etcd.endpoints,
                    domain = %etcd.domain,
                    "Connecting to etcd lock backend"
                );
                Ok(Arc::new(EtcdLockProvider::connect(etcd).await?))
            }
        }
    }

    /// The stages in call order, connecting to the lock backend if needed.
    pub async fn stages(mut self) -> lock::Result<Vec<Arc<dyn Stage>>> {
        let mut stages: Vec<Arc<dyn Stage>> = vec![Arc::new(RequestIdStage::new())];

        if self.config.logging {
            stages.push(Arc::new(LoggingStage));
        }
        if self.config.metrics {
            stages.push(Arc::new(MetricsStage));
        }
        if self.config.validator.is_enabled() {
            stages.push(Arc::new(SpecValidator::new(self.config.validator.clone())));
        }
        if self.config.serialize_volumes {
            let locks = self.locks().await?;
            let mut serial = SerialVolume::new(locks)
                .with_timeout(self.config.lock_timeout)
                .with_require_volume_exists(self.config.require_volume_exists);
            if let Some(oracle) = self.oracle.take() {
                serial = serial.with_oracle(oracle);
            }
            stages.push(Arc::new(serial));
        }

        stages.append(&mut self.extra);
        Ok(stages)
    }

    pub async fn build(self, handler: Arc<dyn Handler>) -> lock::Result<Pipeline> {
        Ok(Pipeline::new(self.stages().await?, handler))
    }
}
