//! CSI Middleware Runtime
//!
//! Cross-cutting request processing for Container Storage Interface plugins
//! and clients. Every unary CSI call is run through an interceptor chain
//! that provides request correlation, logging, metrics, protocol validation
//! and volume-scoped serialization with idempotency short-circuiting.
//!
//! This library provides:
//! - The stage/handler chain shared by the calling and the serving side
//! - In-process and etcd-backed volume lock providers
//! - The serialization/idempotency stage and its storage-side oracle trait
//! - Tonic service adapters for the Identity, Controller and Node services

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod chain;
pub mod client;
pub mod config;
pub mod context;
pub mod lock;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod request_id;
pub mod retry;
pub mod serial;
pub mod server;
pub mod validator;

pub use chain::{Handler, Next, Pipeline, Stage, chain};
pub use client::{ChannelHandler, CsiClient};
pub use config::{LockBackend, MiddlewareConfig, PipelineBuilder};
pub use context::CallContext;
pub use lock::{EtcdLockProvider, LockKey, LockProvider, MemoryLockProvider, VolumeLock};
pub use message::{CsiRequest, CsiResponse};
pub use serial::{IdempotencyOracle, SerialVolume};
pub use server::{CsiMiddleware, PluginHandler};
pub use validator::{SpecValidator, ValidatorConfig};
