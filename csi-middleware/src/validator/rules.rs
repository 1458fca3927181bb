//! Per-RPC shape checks.
//!
//! Each function checks one message kind. Generic required-field and
//! enumerated-value checks run under `request_validation` or
//! `response_validation`; the `requires_*` toggles add their own check
//! independently of those two switches.

use std::collections::HashMap;

use super::ValidatorConfig;
use super::error::{Result, ValidationError};
use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;

/// Maximum size of names and identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Maximum total size of a string map (keys plus values).
pub const MAX_MAP_LEN: usize = 4096;

/// Check that accepts every message.
pub(super) fn no_check<T>(_cfg: &ValidatorConfig, _message: &T) -> Result<()> {
    Ok(())
}

fn present(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ValidationError::Missing(field));
    }
    Ok(())
}

/// Present and within the identifier size limit.
fn required(cfg: &ValidatorConfig, field: &'static str, value: &str) -> Result<()> {
    present(field, value)?;
    if !cfg.disable_field_len_check && value.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_ID_LEN,
        });
    }
    Ok(())
}

fn map_size(cfg: &ValidatorConfig, field: &'static str, map: &HashMap<String, String>) -> Result<()> {
    if cfg.disable_field_len_check {
        return Ok(());
    }
    let size: usize = map.iter().map(|(k, v)| k.len() + v.len()).sum();
    if size > MAX_MAP_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_MAP_LEN,
        });
    }
    Ok(())
}

fn non_empty_map(enabled: bool, field: &'static str, map: &HashMap<String, String>) -> Result<()> {
    if enabled && map.is_empty() {
        return Err(ValidationError::Missing(field));
    }
    Ok(())
}

fn secrets(required: bool, map: &HashMap<String, String>) -> Result<()> {
    if required && map.is_empty() {
        return Err(ValidationError::MissingSecrets);
    }
    Ok(())
}

fn capability(capability: Option<&csi::VolumeCapability>) -> Result<()> {
    let capability = capability.ok_or(ValidationError::Missing("volume_capability"))?;
    if capability.access_type.is_none() {
        return Err(ValidationError::Missing("volume_capability.access_type"));
    }
    let access_mode = capability
        .access_mode
        .as_ref()
        .ok_or(ValidationError::Missing("volume_capability.access_mode"))?;
    match Mode::try_from(access_mode.mode) {
        Ok(Mode::Unknown) | Err(_) => Err(ValidationError::InvalidEnum {
            field: "volume_capability.access_mode.mode",
            value: access_mode.mode,
        }),
        Ok(_) => Ok(()),
    }
}

fn capabilities(capabilities: &[csi::VolumeCapability]) -> Result<()> {
    if capabilities.is_empty() {
        return Err(ValidationError::Missing("volume_capabilities"));
    }
    capabilities.iter().try_for_each(|c| capability(Some(c)))
}

fn capacity_range(range: Option<&csi::CapacityRange>) -> Result<()> {
    let Some(range) = range else {
        return Ok(());
    };
    if range.required_bytes < 0 {
        return Err(ValidationError::Negative {
            field: "capacity_range.required_bytes",
        });
    }
    if range.limit_bytes < 0 {
        return Err(ValidationError::Negative {
            field: "capacity_range.limit_bytes",
        });
    }
    if range.required_bytes > 0 && range.limit_bytes > 0 && range.limit_bytes < range.required_bytes
    {
        return Err(ValidationError::InvalidCapacityRange {
            required: range.required_bytes,
            limit: range.limit_bytes,
        });
    }
    Ok(())
}

// Identity

pub(super) fn get_plugin_info_response(
    cfg: &ValidatorConfig,
    resp: &csi::GetPluginInfoResponse,
) -> Result<()> {
    if cfg.response_validation {
        present("name", &resp.name)?;
        present("vendor_version", &resp.vendor_version)?;
    }
    Ok(())
}

// Controller

pub(super) fn create_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::CreateVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "name", &req.name)?;
        capabilities(&req.volume_capabilities)?;
        capacity_range(req.capacity_range.as_ref())?;
        map_size(cfg, "parameters", &req.parameters)?;
        map_size(cfg, "secrets", &req.secrets)?;
    }
    secrets(cfg.requires_secrets.create_volume, &req.secrets)
}

pub(super) fn create_volume_response(
    cfg: &ValidatorConfig,
    resp: &csi::CreateVolumeResponse,
) -> Result<()> {
    let volume = resp.volume.as_ref();
    if cfg.response_validation {
        let volume = volume.ok_or(ValidationError::Missing("volume"))?;
        present("volume.volume_id", &volume.volume_id)?;
        if volume.capacity_bytes < 0 {
            return Err(ValidationError::Negative {
                field: "volume.capacity_bytes",
            });
        }
    }
    if cfg.requires_volume_context && volume.is_none_or(|v| v.volume_context.is_empty()) {
        return Err(ValidationError::Missing("volume.volume_context"));
    }
    Ok(())
}

pub(super) fn delete_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::DeleteVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
    }
    secrets(cfg.requires_secrets.delete_volume, &req.secrets)
}

pub(super) fn controller_publish_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::ControllerPublishVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
        capability(req.volume_capability.as_ref())?;
        map_size(cfg, "volume_context", &req.volume_context)?;
    }
    if cfg.request_validation || cfg.requires_node_id {
        required(cfg, "node_id", &req.node_id)?;
    }
    non_empty_map(cfg.requires_volume_context, "volume_context", &req.volume_context)?;
    secrets(cfg.requires_secrets.controller_publish_volume, &req.secrets)
}

pub(super) fn controller_publish_volume_response(
    cfg: &ValidatorConfig,
    resp: &csi::ControllerPublishVolumeResponse,
) -> Result<()> {
    non_empty_map(cfg.requires_publish_context, "publish_context", &resp.publish_context)
}

pub(super) fn controller_unpublish_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::ControllerUnpublishVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
    }
    if cfg.requires_node_id {
        required(cfg, "node_id", &req.node_id)?;
    }
    secrets(cfg.requires_secrets.controller_unpublish_volume, &req.secrets)
}

pub(super) fn validate_volume_capabilities_request(
    cfg: &ValidatorConfig,
    req: &csi::ValidateVolumeCapabilitiesRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
        capabilities(&req.volume_capabilities)?;
    }
    Ok(())
}

pub(super) fn validate_volume_capabilities_response(
    cfg: &ValidatorConfig,
    resp: &csi::ValidateVolumeCapabilitiesResponse,
) -> Result<()> {
    match &resp.confirmed {
        Some(confirmed) if cfg.response_validation => capabilities(&confirmed.volume_capabilities),
        _ => Ok(()),
    }
}

pub(super) fn list_volumes_request(
    cfg: &ValidatorConfig,
    req: &csi::ListVolumesRequest,
) -> Result<()> {
    if cfg.request_validation && req.max_entries < 0 {
        return Err(ValidationError::Negative {
            field: "max_entries",
        });
    }
    Ok(())
}

pub(super) fn list_volumes_response(
    cfg: &ValidatorConfig,
    resp: &csi::ListVolumesResponse,
) -> Result<()> {
    if !cfg.response_validation {
        return Ok(());
    }
    for entry in &resp.entries {
        let volume = entry
            .volume
            .as_ref()
            .ok_or(ValidationError::Missing("entries.volume"))?;
        present("entries.volume.volume_id", &volume.volume_id)?;
    }
    Ok(())
}

pub(super) fn get_capacity_request(
    cfg: &ValidatorConfig,
    req: &csi::GetCapacityRequest,
) -> Result<()> {
    if cfg.request_validation {
        req.volume_capabilities
            .iter()
            .try_for_each(|c| capability(Some(c)))?;
    }
    Ok(())
}

pub(super) fn get_capacity_response(
    cfg: &ValidatorConfig,
    resp: &csi::GetCapacityResponse,
) -> Result<()> {
    if cfg.response_validation && resp.available_capacity < 0 {
        return Err(ValidationError::Negative {
            field: "available_capacity",
        });
    }
    Ok(())
}

pub(super) fn controller_expand_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::ControllerExpandVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
        let range = req
            .capacity_range
            .as_ref()
            .ok_or(ValidationError::Missing("capacity_range"))?;
        capacity_range(Some(range))?;
    }
    Ok(())
}

// Node

pub(super) fn node_stage_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::NodeStageVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
        present("staging_target_path", &req.staging_target_path)?;
        capability(req.volume_capability.as_ref())?;
        map_size(cfg, "publish_context", &req.publish_context)?;
        map_size(cfg, "volume_context", &req.volume_context)?;
    }
    non_empty_map(cfg.requires_publish_context, "publish_context", &req.publish_context)?;
    non_empty_map(cfg.requires_volume_context, "volume_context", &req.volume_context)?;
    secrets(cfg.requires_secrets.node_stage_volume, &req.secrets)
}

pub(super) fn node_unstage_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::NodeUnstageVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
        present("staging_target_path", &req.staging_target_path)?;
    }
    Ok(())
}

pub(super) fn node_publish_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::NodePublishVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
        present("target_path", &req.target_path)?;
        capability(req.volume_capability.as_ref())?;
        map_size(cfg, "publish_context", &req.publish_context)?;
        map_size(cfg, "volume_context", &req.volume_context)?;
    }
    if cfg.requires_staging_target_path {
        present("staging_target_path", &req.staging_target_path)?;
    }
    non_empty_map(cfg.requires_publish_context, "publish_context", &req.publish_context)?;
    non_empty_map(cfg.requires_volume_context, "volume_context", &req.volume_context)?;
    secrets(cfg.requires_secrets.node_publish_volume, &req.secrets)
}

pub(super) fn node_unpublish_volume_request(
    cfg: &ValidatorConfig,
    req: &csi::NodeUnpublishVolumeRequest,
) -> Result<()> {
    if cfg.request_validation {
        required(cfg, "volume_id", &req.volume_id)?;
        present("target_path", &req.target_path)?;
    }
    Ok(())
}

pub(super) fn node_get_info_response(
    cfg: &ValidatorConfig,
    resp: &csi::NodeGetInfoResponse,
) -> Result<()> {
    if cfg.response_validation || cfg.requires_node_id {
        present("node_id", &resp.node_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::volume_capability::{AccessMode, AccessType, MountVolume};

    fn mount_capability(mode: Mode) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume::default())),
            access_mode: Some(AccessMode { mode: mode as i32 }),
        }
    }

    fn strict() -> ValidatorConfig {
        ValidatorConfig {
            request_validation: true,
            response_validation: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_capability_checks() {
        assert!(capability(Some(&mount_capability(Mode::SingleNodeWriter))).is_ok());
        assert_eq!(
            capability(Some(&mount_capability(Mode::Unknown))),
            Err(ValidationError::InvalidEnum {
                field: "volume_capability.access_mode.mode",
                value: 0
            })
        );

        let mut bogus = mount_capability(Mode::SingleNodeWriter);
        bogus.access_mode = Some(AccessMode { mode: 99 });
        assert!(matches!(
            capability(Some(&bogus)),
            Err(ValidationError::InvalidEnum { value: 99, .. })
        ));

        let mut no_type = mount_capability(Mode::SingleNodeWriter);
        no_type.access_type = None;
        assert_eq!(
            capability(Some(&no_type)),
            Err(ValidationError::Missing("volume_capability.access_type"))
        );
        assert_eq!(
            capability(None),
            Err(ValidationError::Missing("volume_capability"))
        );
    }

    #[test]
    fn test_create_volume_request() {
        let cfg = strict();
        let mut req = csi::CreateVolumeRequest {
            name: "data".into(),
            volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
            ..Default::default()
        };
        assert!(create_volume_request(&cfg, &req).is_ok());

        req.capacity_range = Some(csi::CapacityRange {
            required_bytes: 100,
            limit_bytes: 10,
        });
        assert!(matches!(
            create_volume_request(&cfg, &req),
            Err(ValidationError::InvalidCapacityRange { .. })
        ));

        req.capacity_range = None;
        req.name = "x".repeat(MAX_ID_LEN + 1);
        assert_eq!(
            create_volume_request(&cfg, &req),
            Err(ValidationError::TooLong {
                field: "name",
                max: MAX_ID_LEN
            })
        );

        let relaxed = ValidatorConfig {
            disable_field_len_check: true,
            ..strict()
        };
        assert!(create_volume_request(&relaxed, &req).is_ok());

        req.name.clear();
        assert_eq!(
            create_volume_request(&cfg, &req),
            Err(ValidationError::Missing("name"))
        );
    }

    #[test]
    fn test_parameters_map_limit() {
        let cfg = strict();
        let req = csi::CreateVolumeRequest {
            name: "data".into(),
            volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
            parameters: HashMap::from([("blob".to_string(), "x".repeat(MAX_MAP_LEN))]),
            ..Default::default()
        };
        assert_eq!(
            create_volume_request(&cfg, &req),
            Err(ValidationError::TooLong {
                field: "parameters",
                max: MAX_MAP_LEN
            })
        );
    }

    #[test]
    fn test_toggles_apply_without_generic_validation() {
        let cfg = ValidatorConfig {
            requires_node_id: true,
            ..Default::default()
        };
        let req = csi::ControllerUnpublishVolumeRequest {
            volume_id: String::new(),
            ..Default::default()
        };
        // volume_id is only checked by generic validation
        assert_eq!(
            controller_unpublish_volume_request(&cfg, &req),
            Err(ValidationError::Missing("node_id"))
        );

        let resp = csi::NodeGetInfoResponse::default();
        assert_eq!(
            node_get_info_response(&cfg, &resp),
            Err(ValidationError::Missing("node_id"))
        );
    }

    #[test]
    fn test_secret_requirements() {
        let mut cfg = ValidatorConfig::default();
        cfg.requires_secrets.node_stage_volume = true;

        let mut req = csi::NodeStageVolumeRequest::default();
        assert_eq!(
            node_stage_volume_request(&cfg, &req),
            Err(ValidationError::MissingSecrets)
        );

        req.secrets.insert("token".into(), "s3cr3t".into());
        assert!(node_stage_volume_request(&cfg, &req).is_ok());
        // Other RPCs are unaffected
        assert!(node_publish_volume_request(&cfg, &csi::NodePublishVolumeRequest::default()).is_ok());
    }

    #[test]
    fn test_node_publish_staging_path_toggle() {
        let cfg = ValidatorConfig {
            requires_staging_target_path: true,
            ..Default::default()
        };
        let req = csi::NodePublishVolumeRequest {
            volume_id: "vol-1".into(),
            target_path: "/mnt/target".into(),
            ..Default::default()
        };
        assert_eq!(
            node_publish_volume_request(&cfg, &req),
            Err(ValidationError::Missing("staging_target_path"))
        );
    }

    #[test]
    fn test_create_volume_response() {
        let cfg = strict();
        assert_eq!(
            create_volume_response(&cfg, &csi::CreateVolumeResponse::default()),
            Err(ValidationError::Missing("volume"))
        );

        let resp = csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                volume_id: "vol-1".into(),
                capacity_bytes: 1024,
                ..Default::default()
            }),
        };
        assert!(create_volume_response(&cfg, &resp).is_ok());

        let with_context = ValidatorConfig {
            requires_volume_context: true,
            ..cfg
        };
        assert_eq!(
            create_volume_response(&with_context, &resp),
            Err(ValidationError::Missing("volume.volume_context"))
        );
    }

    #[test]
    fn test_list_volumes_response() {
        let cfg = strict();
        let resp = csi::ListVolumesResponse {
            entries: vec![csi::list_volumes_response::Entry {
                volume: Some(csi::Volume::default()),
                status: None,
            }],
            next_token: String::new(),
        };
        assert_eq!(
            list_volumes_response(&cfg, &resp),
            Err(ValidationError::Missing("entries.volume.volume_id"))
        );
    }
}
