use thiserror::Error;

/// A request or response that violates the CSI message contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{field} exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },

    #[error("secrets are required")]
    MissingSecrets,

    #[error("{field} has invalid value {value}")]
    InvalidEnum { field: &'static str, value: i32 },

    #[error("limit_bytes {limit} is less than required_bytes {required}")]
    InvalidCapacityRange { required: i64, limit: i64 },

    #[error("{field} must not be negative")]
    Negative { field: &'static str },

    #[error("unsupported version {version}, supported: {supported}")]
    UnsupportedVersion { version: String, supported: String },
}

pub type Result<T> = std::result::Result<T, ValidationError>;
