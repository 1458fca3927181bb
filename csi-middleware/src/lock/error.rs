use thiserror::Error;
use tonic::Status;

/// Errors from the volume lock providers
#[derive(Error, Debug)]
pub enum LockError {
    #[error("failed to connect to etcd at {endpoints}: {source}")]
    Connect {
        endpoints: String,
        #[source]
        source: etcd_client::Error,
    },

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// The call was cancelled or its deadline passed while setting up the
    /// lock session.
    #[error("lock acquisition for {0} cancelled")]
    Cancelled(String),
}

impl LockError {
    /// Cancellation means "lock not obtained", not a backend failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LockError::Cancelled(_))
    }
}

impl From<LockError> for Status {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Cancelled(_) => Status::deadline_exceeded(err.to_string()),
            _ => Status::unavailable(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
