//! Volume lock providers.
//!
//! A provider hands out [`VolumeLock`] handles keyed by volume ID or volume
//! name. At most one handle per key holds the lock at any time, across the
//! whole process for [`MemoryLockProvider`] and across every process sharing
//! the etcd cluster and domain for [`EtcdLockProvider`].

mod error;
mod etcd;
mod memory;

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

pub use error::{LockError, Result};
pub use etcd::{EtcdConfig, EtcdLockProvider};
pub use memory::MemoryLockProvider;

use crate::context::CallContext;

/// Resource a volume lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Id(String),
    Name(String),
}

impl LockKey {
    pub fn id(id: impl Into<String>) -> Self {
        LockKey::Id(id.into())
    }

    pub fn name(name: impl Into<String>) -> Self {
        LockKey::Name(name.into())
    }

    /// The volume ID or name.
    pub fn value(&self) -> &str {
        match self {
            LockKey::Id(value) | LockKey::Name(value) => value,
        }
    }

    /// Empty keys are never locked.
    pub fn is_empty(&self) -> bool {
        self.value().is_empty()
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Id(id) => write!(f, "volumesByID:{id}"),
            LockKey::Name(name) => write!(f, "volumesByName:{name}"),
        }
    }
}

/// Source of volume lock handles.
#[tonic::async_trait]
pub trait LockProvider: Send + Sync {
    /// Obtain a handle for `key`. The handle does not hold the lock yet.
    async fn lock(&self, ctx: &CallContext, key: &LockKey) -> Result<Box<dyn VolumeLock>>;

    async fn lock_by_id(&self, ctx: &CallContext, id: &str) -> Result<Box<dyn VolumeLock>> {
        self.lock(ctx, &LockKey::id(id)).await
    }

    async fn lock_by_name(&self, ctx: &CallContext, name: &str) -> Result<Box<dyn VolumeLock>> {
        self.lock(ctx, &LockKey::name(name)).await
    }
}

/// Handle on a single volume lock.
///
/// Dropping a handle that holds its lock releases it.
#[tonic::async_trait]
pub trait VolumeLock: Send {
    /// Key this handle locks, as rendered for the backend.
    fn key(&self) -> &str;

    /// Try to take the lock, waiting at most `timeout` (bounded by the call
    /// deadline). A zero timeout returns at once if the lock is held.
    /// Returns `Ok(false)` when the lock was not obtained.
    ///
    /// # Panics
    ///
    /// Panics if this handle already holds the lock.
    async fn try_lock(&mut self, timeout: Duration) -> Result<bool>;

    /// Release the lock.
    ///
    /// # Panics
    ///
    /// Panics if this handle does not hold the lock.
    async fn unlock(&mut self) -> Result<()>;

    /// Tear down any backend session owned by the handle.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Effective wait for a positive `timeout` under an optional deadline.
pub(crate) fn bounded_wait(timeout: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
        None => timeout,
    }
}
