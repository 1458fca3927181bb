//! Closed request/response envelopes for the carried CSI RPCs.
//!
//! Every stage sees a call as a `CsiRequest` and produces a `CsiResponse`.
//! Each variant wraps the generated prost message and knows its
//! fully-qualified gRPC method name, which the validator registry and the
//! error memo use as their discriminator.

use tonic::Status;

use crate::csi;

/// Replacement text for secret values in logged messages.
pub const REDACTED: &str = "***stripped***";

/// A generated request type with a known method and response type.
pub trait RequestMessage: Sized + Send + 'static {
    /// Fully-qualified method name, e.g. `/csi.v1.Controller/CreateVolume`.
    const METHOD: &'static str;
    type Response: ResponseMessage;

    /// Borrow the typed message if `request` is of this kind.
    fn peek(request: &CsiRequest) -> Option<&Self>;
}

/// A generated response type.
pub trait ResponseMessage: Sized + Send + 'static {
    fn peek(response: &CsiResponse) -> Option<&Self>;
}

macro_rules! csi_messages {
    ($($service:literal => { $($rpc:ident($req:ident, $resp:ident),)* })*) => {
        /// A CSI request of any carried kind.
        #[derive(Debug, Clone, PartialEq)]
        pub enum CsiRequest {
            $($($rpc(csi::$req),)*)*
        }

        /// A CSI response of any carried kind.
        #[derive(Debug, Clone, PartialEq)]
        pub enum CsiResponse {
            $($($rpc(csi::$resp),)*)*
        }

        impl CsiRequest {
            /// Fully-qualified gRPC method name of this request.
            pub fn method(&self) -> &'static str {
                match self {
                    $($(CsiRequest::$rpc(_) => concat!("/csi.v1.", $service, "/", stringify!($rpc)),)*)*
                }
            }
        }

        impl CsiResponse {
            /// Fully-qualified gRPC method name this response answers.
            pub fn method(&self) -> &'static str {
                match self {
                    $($(CsiResponse::$rpc(_) => concat!("/csi.v1.", $service, "/", stringify!($rpc)),)*)*
                }
            }
        }

        $($(
            impl From<csi::$req> for CsiRequest {
                fn from(request: csi::$req) -> Self {
                    CsiRequest::$rpc(request)
                }
            }

            impl From<csi::$resp> for CsiResponse {
                fn from(response: csi::$resp) -> Self {
                    CsiResponse::$rpc(response)
                }
            }

            impl TryFrom<CsiResponse> for csi::$resp {
                type Error = Status;

                fn try_from(response: CsiResponse) -> Result<Self, Status> {
                    match response {
                        CsiResponse::$rpc(response) => Ok(response),
                        other => Err(Status::internal(format!(
                            "{}: pipeline produced a response for {}",
                            <csi::$req as RequestMessage>::METHOD,
                            other.method()
                        ))),
                    }
                }
            }

            impl RequestMessage for csi::$req {
                const METHOD: &'static str = concat!("/csi.v1.", $service, "/", stringify!($rpc));
                type Response = csi::$resp;

                fn peek(request: &CsiRequest) -> Option<&Self> {
                    match request {
                        CsiRequest::$rpc(request) => Some(request),
                        _ => None,
                    }
                }
            }

            impl ResponseMessage for csi::$resp {
                fn peek(response: &CsiResponse) -> Option<&Self> {
                    match response {
                        CsiResponse::$rpc(response) => Some(response),
                        _ => None,
                    }
                }
            }
        )*)*
    };
}

csi_messages! {
    "Identity" => {
        GetPluginInfo(GetPluginInfoRequest, GetPluginInfoResponse),
        GetPluginCapabilities(GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse),
        Probe(ProbeRequest, ProbeResponse),
    }
    "Controller" => {
        CreateVolume(CreateVolumeRequest, CreateVolumeResponse),
        DeleteVolume(DeleteVolumeRequest, DeleteVolumeResponse),
        ControllerPublishVolume(ControllerPublishVolumeRequest, ControllerPublishVolumeResponse),
        ControllerUnpublishVolume(ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse),
        ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse),
        ListVolumes(ListVolumesRequest, ListVolumesResponse),
        GetCapacity(GetCapacityRequest, GetCapacityResponse),
        ControllerGetCapabilities(ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse),
        ControllerExpandVolume(ControllerExpandVolumeRequest, ControllerExpandVolumeResponse),
    }
    "Node" => {
        NodeStageVolume(NodeStageVolumeRequest, NodeStageVolumeResponse),
        NodeUnstageVolume(NodeUnstageVolumeRequest, NodeUnstageVolumeResponse),
        NodePublishVolume(NodePublishVolumeRequest, NodePublishVolumeResponse),
        NodeUnpublishVolume(NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse),
        NodeGetCapabilities(NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse),
        NodeGetInfo(NodeGetInfoRequest, NodeGetInfoResponse),
    }
}

impl CsiRequest {
    /// Copy of the request with every secret value replaced, for logging.
    pub fn redacted(&self) -> CsiRequest {
        let mut request = self.clone();
        let secrets = match &mut request {
            CsiRequest::CreateVolume(r) => Some(&mut r.secrets),
            CsiRequest::DeleteVolume(r) => Some(&mut r.secrets),
            CsiRequest::ControllerPublishVolume(r) => Some(&mut r.secrets),
            CsiRequest::ControllerUnpublishVolume(r) => Some(&mut r.secrets),
            CsiRequest::ValidateVolumeCapabilities(r) => Some(&mut r.secrets),
            CsiRequest::ControllerExpandVolume(r) => Some(&mut r.secrets),
            CsiRequest::NodeStageVolume(r) => Some(&mut r.secrets),
            CsiRequest::NodePublishVolume(r) => Some(&mut r.secrets),
            _ => None,
        };
        if let Some(secrets) = secrets {
            for value in secrets.values_mut() {
                *value = REDACTED.to_string();
            }
        }
        request
    }

    /// Volume ID addressed by the request, when the RPC carries one.
    pub fn volume_id(&self) -> Option<&str> {
        let id = match self {
            CsiRequest::DeleteVolume(r) => &r.volume_id,
            CsiRequest::ControllerPublishVolume(r) => &r.volume_id,
            CsiRequest::ControllerUnpublishVolume(r) => &r.volume_id,
            CsiRequest::ValidateVolumeCapabilities(r) => &r.volume_id,
            CsiRequest::ControllerExpandVolume(r) => &r.volume_id,
            CsiRequest::NodeStageVolume(r) => &r.volume_id,
            CsiRequest::NodeUnstageVolume(r) => &r.volume_id,
            CsiRequest::NodePublishVolume(r) => &r.volume_id,
            CsiRequest::NodeUnpublishVolume(r) => &r.volume_id,
            _ => return None,
        };
        Some(id.as_str())
    }
}

/// Short operation name (`CreateVolume`) from a method path.
pub fn operation_name(method: &str) -> &str {
    method.rsplit('/').next().unwrap_or(method)
}
