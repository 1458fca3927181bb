//! Calling side of the middleware.
//!
//! [`ChannelHandler`] is the terminal that issues a call on a tonic channel,
//! and [`CsiClient`] runs calls through a pipeline ending in it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::Status;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity, Uri};
use tower::service_fn;
use tracing::debug;

use crate::chain::{CallResult, Handler, Pipeline, Stage};
use crate::context::CallContext;
use crate::csi::controller_client::ControllerClient;
use crate::csi::identity_client::IdentityClient;
use crate::csi::node_client::NodeClient;
use crate::logging::LoggingStage;
use crate::message::{CsiRequest, CsiResponse};
use crate::request_id::RequestIdStage;
use crate::retry::RetryStage;

/// Errors establishing a channel to a CSI endpoint
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("failed to read TLS material: {0}")]
    Tls(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// TLS configuration for TCP endpoints
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub domain: String,
}

/// Connect to a CSI endpoint, `unix:///path/to/csi.sock` or `http(s)://host:port`.
pub async fn connect(endpoint: &str) -> Result<Channel, ConnectError> {
    connect_with_tls(endpoint, None).await
}

/// Connect with optional mTLS (TCP endpoints only) and robust connection
/// settings.
///
/// Connection settings:
/// - 10 second connect timeout (fail fast if the plugin is unreachable)
/// - TCP keepalive every 60 seconds
/// - HTTP/2 keepalive every 30 seconds with 10 second timeout
/// - Keepalive while idle to detect dead connections
///
/// No overall request timeout is set; each call carries its own deadline.
pub async fn connect_with_tls(
    endpoint: &str,
    tls: Option<TlsConfig>,
) -> Result<Channel, ConnectError> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(ConnectError::InvalidEndpoint(endpoint.to_string()));
        }
        let path = PathBuf::from(path);
        debug!(path = %path.display(), "Connecting to unix socket");
        // The authority is ignored, the connector dials the socket
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_timeout(Duration::from_secs(10))
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
            }))
            .await?;
        return Ok(channel);
    }

    let mut endpoint_builder = Endpoint::from_shared(endpoint.to_string())
        .map_err(|_| ConnectError::InvalidEndpoint(endpoint.to_string()))?
        // Connection establishment timeout
        .connect_timeout(Duration::from_secs(10))
        // TCP keepalive to detect dead connections at OS level
        .tcp_keepalive(Some(Duration::from_secs(60)))
        // Disable Nagle's algorithm for lower latency
        .tcp_nodelay(true)
        // HTTP/2 keepalive ping interval
        .http2_keep_alive_interval(Duration::from_secs(30))
        // How long to wait for keepalive response
        .keep_alive_timeout(Duration::from_secs(10))
        // Send keepalive even when no requests in flight
        .keep_alive_while_idle(true);

    if let Some(tls) = tls {
        let cert = tokio::fs::read(&tls.cert_path).await?;
        let key = tokio::fs::read(&tls.key_path).await?;
        let ca = tokio::fs::read(&tls.ca_path).await?;

        let tls_config = ClientTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .ca_certificate(Certificate::from_pem(ca))
            .domain_name(&tls.domain);

        endpoint_builder = endpoint_builder.tls_config(tls_config)?;
    }

    debug!(endpoint, "Connecting to CSI endpoint");
    Ok(endpoint_builder.connect().await?)
}

/// Terminal issuing calls on a transport channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    channel: Channel,
}

impl ChannelHandler {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[tonic::async_trait]
impl Handler for ChannelHandler {
    async fn call(&self, ctx: CallContext, request: CsiRequest) -> CallResult {
        let channel = self.channel.clone();
        let response: CsiResponse = match request {
            // Identity
            CsiRequest::GetPluginInfo(r) => IdentityClient::new(channel)
                .get_plugin_info(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::GetPluginCapabilities(r) => IdentityClient::new(channel)
                .get_plugin_capabilities(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::Probe(r) => IdentityClient::new(channel)
                .probe(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),

            // Controller
            CsiRequest::CreateVolume(r) => ControllerClient::new(channel)
                .create_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::DeleteVolume(r) => ControllerClient::new(channel)
                .delete_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ControllerPublishVolume(r) => ControllerClient::new(channel)
                .controller_publish_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ControllerUnpublishVolume(r) => ControllerClient::new(channel)
                .controller_unpublish_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ValidateVolumeCapabilities(r) => ControllerClient::new(channel)
                .validate_volume_capabilities(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ListVolumes(r) => ControllerClient::new(channel)
                .list_volumes(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::GetCapacity(r) => ControllerClient::new(channel)
                .get_capacity(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ControllerGetCapabilities(r) => ControllerClient::new(channel)
                .controller_get_capabilities(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ControllerExpandVolume(r) => ControllerClient::new(channel)
                .controller_expand_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),

            // Node
            CsiRequest::NodeStageVolume(r) => NodeClient::new(channel)
                .node_stage_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodeUnstageVolume(r) => NodeClient::new(channel)
                .node_unstage_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodePublishVolume(r) => NodeClient::new(channel)
                .node_publish_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodeUnpublishVolume(r) => NodeClient::new(channel)
                .node_unpublish_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodeGetCapabilities(r) => NodeClient::new(channel)
                .node_get_capabilities(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodeGetInfo(r) => NodeClient::new(channel)
                .node_get_info(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
        };
        Ok(response)
    }
}

/// Stages installed by [`CsiClient::new`]: correlation, logging, retry.
pub fn default_stages() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(RequestIdStage::new()),
        Arc::new(LoggingStage),
        Arc::new(RetryStage::default()),
    ]
}

/// CSI client running every call through a middleware pipeline.
#[derive(Debug, Clone)]
pub struct CsiClient {
    pipeline: Pipeline,
}

impl CsiClient {
    /// Client on `channel` with the default calling-side stages.
    pub fn new(channel: Channel) -> Self {
        Self::with_stages(channel, default_stages())
    }

    pub fn with_stages(channel: Channel, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            pipeline: Pipeline::new(stages, Arc::new(ChannelHandler::new(channel))),
        }
    }

    pub fn from_pipeline(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Issue one call.
    ///
    /// ```ignore
    /// let info: csi::GetPluginInfoResponse = client
    ///     .call(CallContext::new(), csi::GetPluginInfoRequest::default())
    ///     .await?;
    /// ```
    pub async fn call<Req, Resp>(&self, ctx: CallContext, request: Req) -> Result<Resp, Status>
    where
        Req: Into<CsiRequest>,
        Resp: TryFrom<CsiResponse, Error = Status>,
    {
        self.pipeline.unary(ctx, request).await
    }
}
