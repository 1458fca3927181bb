//! In-memory CSI plugin used by the integration tests.
//!
//! Implements the three CSI services on top of a small volume table and
//! doubles as the idempotency oracle for the same table, the way a real
//! storage backend would answer both.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tonic::{Request, Response, Status};

use csi_middleware::context::REQUEST_ID_KEY;
use csi_middleware::csi;
use csi_middleware::csi::controller_server::Controller;
use csi_middleware::csi::identity_server::Identity;
use csi_middleware::csi::node_server::Node;
use csi_middleware::{CallContext, IdempotencyOracle, PluginHandler};

pub const GIB: i64 = 1 << 30;
pub const DRIVER_NAME: &str = "memory.csi.example.org";
pub const NODE_ID: &str = "node-1";

#[derive(Default)]
struct State {
    names: HashMap<String, String>,
    volumes: HashMap<String, csi::Volume>,
    /// (volume_id, node_id) -> publish context
    attached: HashMap<(String, String), HashMap<String, String>>,
    /// (volume_id, target_path)
    mounted: HashSet<(String, String)>,
}

/// Lets a test hold CreateVolume inside the plugin.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct MemoryPlugin {
    state: Mutex<State>,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    /// Returned by the next mutating call instead of doing the work
    fail_next: Mutex<Option<Status>>,
    /// Returned by the next oracle lookup
    fail_lookup: Mutex<Option<Status>>,
    gate: Option<Arc<Gate>>,
    request_ids: Mutex<Vec<String>>,
}

impl MemoryPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated(gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Default::default()
        })
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, status: Status) {
        *self.fail_next.lock() = Some(status);
    }

    pub fn fail_lookup(&self, status: Status) {
        *self.fail_lookup.lock() = Some(status);
    }

    /// Correlation IDs seen in request metadata, in arrival order.
    pub fn request_ids(&self) -> Vec<String> {
        self.request_ids.lock().clone()
    }

    pub fn contains(&self, volume_id: &str) -> bool {
        self.state.lock().volumes.contains_key(volume_id)
    }

    /// Handler dispatching to this plugin's three services.
    pub fn handler(self: &Arc<Self>) -> PluginHandler {
        PluginHandler::new()
            .with_identity(self.clone())
            .with_controller(self.clone())
            .with_node(self.clone())
    }

    fn observe<T>(&self, request: &Request<T>) {
        if let Some(id) = request
            .metadata()
            .get(REQUEST_ID_KEY)
            .and_then(|v| v.to_str().ok())
        {
            self.request_ids.lock().push(id.to_string());
        }
    }

    fn injected_failure(&self) -> Result<(), Status> {
        match self.fail_next.lock().take() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

/// Size the plugin allocates: the limit when set, else the requirement.
fn allocation(range: Option<&csi::CapacityRange>) -> i64 {
    match range {
        Some(range) if range.limit_bytes > 0 => range.limit_bytes,
        Some(range) if range.required_bytes > 0 => range.required_bytes,
        _ => GIB,
    }
}

#[tonic::async_trait]
impl Identity for MemoryPlugin {
    async fn get_plugin_info(
        &self,
        request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        self.observe(&request);
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: "0.1.0".to_string(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        self.observe(&request);
        Ok(Response::new(csi::GetPluginCapabilitiesResponse::default()))
    }

    async fn probe(
        &self,
        request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        self.observe(&request);
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}

#[tonic::async_trait]
impl Controller for MemoryPlugin {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        self.observe(&request);
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.injected_failure()?;

        let req = request.into_inner();
        let mut state = self.state.lock();
        if let Some(volume) = state
            .names
            .get(&req.name)
            .and_then(|id| state.volumes.get(id))
        {
            return Ok(Response::new(csi::CreateVolumeResponse {
                volume: Some(volume.clone()),
            }));
        }

        let volume = csi::Volume {
            capacity_bytes: allocation(req.capacity_range.as_ref()),
            volume_id: uuid::Uuid::new_v4().to_string(),
            volume_context: req.parameters.clone(),
            ..Default::default()
        };
        state.names.insert(req.name, volume.volume_id.clone());
        state
            .volumes
            .insert(volume.volume_id.clone(), volume.clone());

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(volume),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        self.observe(&request);
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        let req = request.into_inner();
        let mut state = self.state.lock();
        if state.volumes.remove(&req.volume_id).is_none() {
            return Err(Status::not_found(format!(
                "volume {} does not exist",
                req.volume_id
            )));
        }
        state.names.retain(|_, id| *id != req.volume_id);
        state.attached.retain(|(id, _), _| *id != req.volume_id);
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        self.observe(&request);
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        let req = request.into_inner();
        let mut state = self.state.lock();
        if !state.volumes.contains_key(&req.volume_id) {
            return Err(Status::not_found(format!(
                "volume {} does not exist",
                req.volume_id
            )));
        }
        let publish_context = HashMap::from([(
            "device".to_string(),
            format!("/dev/mem/{}", req.volume_id),
        )]);
        state
            .attached
            .insert((req.volume_id, req.node_id), publish_context.clone());
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        self.observe(&request);
        self.injected_failure()?;

        let req = request.into_inner();
        let mut state = self.state.lock();
        state.attached.retain(|(id, node), _| {
            *id != req.volume_id || (!req.node_id.is_empty() && *node != req.node_id)
        });
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        self.observe(&request);
        Ok(Response::new(
            csi::ValidateVolumeCapabilitiesResponse::default(),
        ))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        self.observe(&request);
        let state = self.state.lock();
        let entries = state
            .volumes
            .values()
            .map(|volume| csi::list_volumes_response::Entry {
                volume: Some(volume.clone()),
                status: None,
            })
            .collect();
        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        self.observe(&request);
        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: 1024 * GIB,
            ..Default::default()
        }))
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        self.observe(&request);
        Ok(Response::new(
            csi::ControllerGetCapabilitiesResponse::default(),
        ))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        self.observe(&request);
        self.injected_failure()?;

        let req = request.into_inner();
        let mut state = self.state.lock();
        let volume = state
            .volumes
            .get_mut(&req.volume_id)
            .ok_or_else(|| Status::not_found(format!("volume {} does not exist", req.volume_id)))?;
        volume.capacity_bytes = allocation(req.capacity_range.as_ref());
        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: volume.capacity_bytes,
            node_expansion_required: false,
        }))
    }
}

#[tonic::async_trait]
impl Node for MemoryPlugin {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        self.observe(&request);
        self.injected_failure()?;
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        self.observe(&request);
        self.injected_failure()?;
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        self.observe(&request);
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        let req = request.into_inner();
        self.state
            .lock()
            .mounted
            .insert((req.volume_id, req.target_path));
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        self.observe(&request);
        self.injected_failure()?;

        let req = request.into_inner();
        self.state
            .lock()
            .mounted
            .remove(&(req.volume_id, req.target_path));
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        self.observe(&request);
        Ok(Response::new(csi::NodeGetCapabilitiesResponse::default()))
    }

    async fn node_get_info(
        &self,
        request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        self.observe(&request);
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: NODE_ID.to_string(),
            ..Default::default()
        }))
    }
}

#[tonic::async_trait]
impl IdempotencyOracle for MemoryPlugin {
    async fn volume_id(&self, _ctx: &CallContext, name: &str) -> Result<Option<String>, Status> {
        Ok(self.state.lock().names.get(name).cloned())
    }

    async fn volume(
        &self,
        _ctx: &CallContext,
        id: &str,
        name: &str,
    ) -> Result<Option<csi::Volume>, Status> {
        if let Some(status) = self.fail_lookup.lock().take() {
            return Err(status);
        }
        let state = self.state.lock();
        let id = if id.is_empty() {
            match state.names.get(name) {
                Some(id) => id.as_str(),
                None => return Ok(None),
            }
        } else {
            id
        };
        Ok(state.volumes.get(id).cloned())
    }

    async fn controller_published(
        &self,
        _ctx: &CallContext,
        volume_id: &str,
        node_id: &str,
    ) -> Result<Option<HashMap<String, String>>, Status> {
        Ok(self
            .state
            .lock()
            .attached
            .get(&(volume_id.to_string(), node_id.to_string()))
            .cloned())
    }

    async fn node_published(
        &self,
        _ctx: &CallContext,
        volume_id: &str,
        _publish_context: &HashMap<String, String>,
        target_path: &str,
    ) -> Result<bool, Status> {
        Ok(self
            .state
            .lock()
            .mounted
            .contains(&(volume_id.to_string(), target_path.to_string())))
    }
}

pub fn create_request(name: &str, required_bytes: i64, limit_bytes: i64) -> csi::CreateVolumeRequest {
    use csi::volume_capability::{AccessMode, AccessType, MountVolume, access_mode::Mode};

    csi::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: Some(csi::CapacityRange {
            required_bytes,
            limit_bytes,
        }),
        volume_capabilities: vec![csi::VolumeCapability {
            access_mode: Some(AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
            access_type: Some(AccessType::Mount(MountVolume::default())),
        }],
        ..Default::default()
    }
}

pub fn delete_request(volume_id: &str) -> csi::DeleteVolumeRequest {
    csi::DeleteVolumeRequest {
        volume_id: volume_id.to_string(),
        ..Default::default()
    }
}
