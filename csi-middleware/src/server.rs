//! Serving side of the middleware.
//!
//! [`CsiMiddleware`] implements the tonic Identity, Controller and Node
//! services by running every call through a [`Pipeline`]. The pipeline's
//! terminal is either a [`PluginHandler`] dispatching to local service
//! implementations, or a [`crate::client::ChannelHandler`] forwarding to
//! another endpoint.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::chain::{CallResult, Handler, Pipeline};
use crate::context::CallContext;
use crate::csi;
use crate::csi::controller_server::{Controller, ControllerServer};
use crate::csi::identity_server::{Identity, IdentityServer};
use crate::csi::node_server::{Node, NodeServer};
use crate::message::{CsiRequest, CsiResponse};

/// Tonic service adapter running calls through a pipeline.
#[derive(Debug, Clone)]
pub struct CsiMiddleware {
    pipeline: Pipeline,
}

impl CsiMiddleware {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn identity_server(&self) -> IdentityServer<Self> {
        IdentityServer::new(self.clone())
    }

    pub fn controller_server(&self) -> ControllerServer<Self> {
        ControllerServer::new(self.clone())
    }

    pub fn node_server(&self) -> NodeServer<Self> {
        NodeServer::new(self.clone())
    }

    async fn serve<Req, Resp>(&self, request: Request<Req>) -> Result<Response<Resp>, Status>
    where
        Req: Into<CsiRequest>,
        Resp: TryFrom<CsiResponse, Error = Status>,
    {
        let ctx = CallContext::from_metadata(request.metadata());
        let response = self.pipeline.unary(ctx, request.into_inner()).await?;
        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl Identity for CsiMiddleware {
    async fn get_plugin_info(
        &self,
        request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        self.serve(request).await
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        self.serve(request).await
    }

    async fn probe(
        &self,
        request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        self.serve(request).await
    }
}

#[tonic::async_trait]
impl Controller for CsiMiddleware {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        self.serve(request).await
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        self.serve(request).await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        self.serve(request).await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        self.serve(request).await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        self.serve(request).await
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        self.serve(request).await
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        self.serve(request).await
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        self.serve(request).await
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        self.serve(request).await
    }
}

#[tonic::async_trait]
impl Node for CsiMiddleware {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        self.serve(request).await
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        self.serve(request).await
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        self.serve(request).await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        self.serve(request).await
    }

    async fn node_get_capabilities(
        &self,
        request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        self.serve(request).await
    }

    async fn node_get_info(
        &self,
        request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        self.serve(request).await
    }
}

/// Terminal dispatching to in-process service implementations.
///
/// Calls for a service that was not provided fail with `Unimplemented`.
#[derive(Clone, Default)]
pub struct PluginHandler {
    identity: Option<Arc<dyn Identity>>,
    controller: Option<Arc<dyn Controller>>,
    node: Option<Arc<dyn Node>>,
}

impl std::fmt::Debug for PluginHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandler")
            .field("identity", &self.identity.is_some())
            .field("controller", &self.controller.is_some())
            .field("node", &self.node.is_some())
            .finish()
    }
}

impl PluginHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<dyn Node>) -> Self {
        self.node = Some(node);
        self
    }

    fn identity(&self) -> Result<&dyn Identity, Status> {
        self.identity
            .as_deref()
            .ok_or_else(|| Status::unimplemented("identity service is not provided"))
    }

    fn controller(&self) -> Result<&dyn Controller, Status> {
        self.controller
            .as_deref()
            .ok_or_else(|| Status::unimplemented("controller service is not provided"))
    }

    fn node(&self) -> Result<&dyn Node, Status> {
        self.node
            .as_deref()
            .ok_or_else(|| Status::unimplemented("node service is not provided"))
    }
}

#[tonic::async_trait]
impl Handler for PluginHandler {
    async fn call(&self, ctx: CallContext, request: CsiRequest) -> CallResult {
        let response: CsiResponse = match request {
            // Identity
            CsiRequest::GetPluginInfo(r) => self
                .identity()?
                .get_plugin_info(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::GetPluginCapabilities(r) => self
                .identity()?
                .get_plugin_capabilities(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::Probe(r) => self
                .identity()?
                .probe(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),

            // Controller
            CsiRequest::CreateVolume(r) => self
                .controller()?
                .create_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::DeleteVolume(r) => self
                .controller()?
                .delete_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ControllerPublishVolume(r) => self
                .controller()?
                .controller_publish_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ControllerUnpublishVolume(r) => self
                .controller()?
                .controller_unpublish_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ValidateVolumeCapabilities(r) => self
                .controller()?
                .validate_volume_capabilities(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ListVolumes(r) => self
                .controller()?
                .list_volumes(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::GetCapacity(r) => self
                .controller()?
                .get_capacity(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ControllerGetCapabilities(r) => self
                .controller()?
                .controller_get_capabilities(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::ControllerExpandVolume(r) => self
                .controller()?
                .controller_expand_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),

            // Node
            CsiRequest::NodeStageVolume(r) => self
                .node()?
                .node_stage_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodeUnstageVolume(r) => self
                .node()?
                .node_unstage_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodePublishVolume(r) => self
                .node()?
                .node_publish_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodeUnpublishVolume(r) => self
                .node()?
                .node_unpublish_volume(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodeGetCapabilities(r) => self
                .node()?
                .node_get_capabilities(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
            CsiRequest::NodeGetInfo(r) => self
                .node()?
                .node_get_info(ctx.into_request(r))
                .await?
                .into_inner()
                .into(),
        };
        Ok(response)
    }
}
