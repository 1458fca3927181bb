//! CSI message validation stage.
//!
//! Checks request shapes before the rest of the chain runs and response
//! shapes after it returns. Checks are looked up in a registry keyed by
//! method name, built once when the stage is constructed; methods without
//! an entry pass unchecked.
//!
//! Request failures are reported as `InvalidArgument`, response failures as
//! `Internal`. The stage can also turn `AlreadyExists` from CreateVolume and
//! `NotFound` from DeleteVolume into successes.

mod error;
mod rules;

use std::collections::HashMap;

use tonic::{Code, Status};
use tracing::{debug, error};

pub use error::ValidationError;
pub use rules::{MAX_ID_LEN, MAX_MAP_LEN};

use crate::chain::{CallResult, Next, Stage};
use crate::context::CallContext;
use crate::csi;
use crate::message::{CsiRequest, CsiResponse, RequestMessage, ResponseMessage};

/// RPCs whose requests may be required to carry secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretRequirements {
    pub create_volume: bool,
    pub delete_volume: bool,
    pub controller_publish_volume: bool,
    pub controller_unpublish_volume: bool,
    pub node_stage_volume: bool,
    pub node_publish_volume: bool,
}

impl SecretRequirements {
    pub fn any(&self) -> bool {
        self.create_volume
            || self.delete_volume
            || self.controller_publish_volume
            || self.controller_unpublish_volume
            || self.node_stage_volume
            || self.node_publish_volume
    }
}

/// Independent validation toggles. All off by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Generic required-field and enumerated-value checks on requests.
    pub request_validation: bool,
    /// Generic required-field and enumerated-value checks on responses.
    pub response_validation: bool,
    pub requires_node_id: bool,
    pub requires_staging_target_path: bool,
    pub requires_volume_context: bool,
    pub requires_publish_context: bool,
    pub requires_secrets: SecretRequirements,
    /// Report `AlreadyExists` from CreateVolume as success.
    pub success_create_already_exists: bool,
    /// Report `NotFound` from DeleteVolume as success.
    pub success_delete_not_found: bool,
    /// Versions a caller may declare under `csi.version`. Empty accepts any.
    pub supported_versions: Vec<String>,
    /// Skip the CSI field size limits during request validation.
    pub disable_field_len_check: bool,
}

impl ValidatorConfig {
    /// Whether any check or reclassification is configured.
    pub fn is_enabled(&self) -> bool {
        self.request_validation
            || self.response_validation
            || self.requires_node_id
            || self.requires_staging_target_path
            || self.requires_volume_context
            || self.requires_publish_context
            || self.requires_secrets.any()
            || self.success_create_already_exists
            || self.success_delete_not_found
            || !self.supported_versions.is_empty()
    }
}

type RequestCheck = Box<dyn Fn(&ValidatorConfig, &CsiRequest) -> error::Result<()> + Send + Sync>;
type ResponseCheck =
    Box<dyn Fn(&ValidatorConfig, &CsiResponse) -> error::Result<()> + Send + Sync>;

struct Rule {
    request: RequestCheck,
    response: ResponseCheck,
}

fn rule<Req: RequestMessage>(
    request: fn(&ValidatorConfig, &Req) -> error::Result<()>,
    response: fn(&ValidatorConfig, &Req::Response) -> error::Result<()>,
) -> (&'static str, Rule) {
    let rule = Rule {
        request: Box::new(move |cfg: &ValidatorConfig, message: &CsiRequest| {
            match Req::peek(message) {
                Some(message) => request(cfg, message),
                None => Ok(()),
            }
        }),
        response: Box::new(move |cfg: &ValidatorConfig, message: &CsiResponse| {
            match <Req::Response as ResponseMessage>::peek(message) {
                Some(message) => response(cfg, message),
                None => Ok(()),
            }
        }),
    };
    (Req::METHOD, rule)
}

fn registry() -> HashMap<&'static str, Rule> {
    use rules::*;

    HashMap::from([
        rule::<csi::GetPluginInfoRequest>(no_check, get_plugin_info_response),
        rule::<csi::CreateVolumeRequest>(create_volume_request, create_volume_response),
        rule::<csi::DeleteVolumeRequest>(delete_volume_request, no_check),
        rule::<csi::ControllerPublishVolumeRequest>(
            controller_publish_volume_request,
            controller_publish_volume_response,
        ),
        rule::<csi::ControllerUnpublishVolumeRequest>(
            controller_unpublish_volume_request,
            no_check,
        ),
        rule::<csi::ValidateVolumeCapabilitiesRequest>(
            validate_volume_capabilities_request,
            validate_volume_capabilities_response,
        ),
        rule::<csi::ListVolumesRequest>(list_volumes_request, list_volumes_response),
        rule::<csi::GetCapacityRequest>(get_capacity_request, get_capacity_response),
        rule::<csi::ControllerExpandVolumeRequest>(controller_expand_volume_request, no_check),
        rule::<csi::NodeStageVolumeRequest>(node_stage_volume_request, no_check),
        rule::<csi::NodeUnstageVolumeRequest>(node_unstage_volume_request, no_check),
        rule::<csi::NodePublishVolumeRequest>(node_publish_volume_request, no_check),
        rule::<csi::NodeUnpublishVolumeRequest>(node_unpublish_volume_request, no_check),
        rule::<csi::NodeGetInfoRequest>(no_check, node_get_info_response),
    ])
}

/// Chain stage enforcing the configured message checks.
pub struct SpecValidator {
    config: ValidatorConfig,
    rules: HashMap<&'static str, Rule>,
}

impl std::fmt::Debug for SpecValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecValidator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SpecValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            rules: registry(),
        }
    }

    /// Check the declared version and the request shape.
    pub fn validate_request(
        &self,
        ctx: &CallContext,
        request: &CsiRequest,
    ) -> Result<(), ValidationError> {
        self.check_version(ctx)?;
        match self.rules.get(request.method()) {
            Some(rule) => (rule.request)(&self.config, request),
            None => Ok(()),
        }
    }

    pub fn validate_response(&self, response: &CsiResponse) -> Result<(), ValidationError> {
        match self.rules.get(response.method()) {
            Some(rule) => (rule.response)(&self.config, response),
            None => Ok(()),
        }
    }

    fn check_version(&self, ctx: &CallContext) -> Result<(), ValidationError> {
        let supported = &self.config.supported_versions;
        match ctx.version() {
            Some(version) if !supported.is_empty() && !supported.iter().any(|v| v == version) => {
                Err(ValidationError::UnsupportedVersion {
                    version: version.to_string(),
                    supported: supported.join(", "),
                })
            }
            _ => Ok(()),
        }
    }

    /// Turn a configured backend error into a success.
    fn reclassify(&self, method: &str, status: Status) -> CallResult {
        if self.config.success_create_already_exists
            && status.code() == Code::AlreadyExists
            && method == csi::CreateVolumeRequest::METHOD
        {
            debug!(method, message = status.message(), "Treating AlreadyExists as success");
            return Ok(csi::CreateVolumeResponse::default().into());
        }
        if self.config.success_delete_not_found
            && status.code() == Code::NotFound
            && method == csi::DeleteVolumeRequest::METHOD
        {
            debug!(method, message = status.message(), "Treating NotFound as success");
            return Ok(csi::DeleteVolumeResponse {}.into());
        }
        Err(status)
    }
}

#[tonic::async_trait]
impl Stage for SpecValidator {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult {
        if !self.config.is_enabled() {
            return next.run(ctx, request).await;
        }

        let method = request.method();
        if let Err(err) = self.validate_request(&ctx, &request) {
            debug!(method, error = %err, "Rejecting invalid request");
            return Err(Status::invalid_argument(format!("{method}: {err}")));
        }

        let response = match next.run(ctx, request).await {
            Ok(response) => response,
            Err(status) => return self.reclassify(method, status),
        };

        if let Err(err) = self.validate_response(&response) {
            error!(method, error = %err, "Plugin returned an invalid response");
            return Err(Status::internal(format!("{method}: invalid response: {err}")));
        }
        Ok(response)
    }
}
