//! In-process lock provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::trace;

use super::{LockKey, LockProvider, Result, VolumeLock, bounded_wait};
use crate::context::CallContext;

/// Lock table shared by every call in the process.
///
/// Entries are created on first use and kept for the lifetime of the
/// provider, so every handle for a key contends on the same mutex.
#[derive(Debug, Default)]
pub struct MemoryLockProvider {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock();
        table.entry(key.to_string()).or_default().clone()
    }
}

#[tonic::async_trait]
impl LockProvider for MemoryLockProvider {
    async fn lock(&self, ctx: &CallContext, key: &LockKey) -> Result<Box<dyn VolumeLock>> {
        let key = key.to_string();
        let mutex = self.entry(&key);
        Ok(Box::new(MemoryLock {
            key,
            mutex,
            guard: None,
            deadline: ctx.deadline(),
        }))
    }
}

/// Handle on one entry of the in-process lock table.
pub struct MemoryLock {
    key: String,
    mutex: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    deadline: Option<Instant>,
}

#[tonic::async_trait]
impl VolumeLock for MemoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn try_lock(&mut self, timeout: Duration) -> Result<bool> {
        assert!(
            self.guard.is_none(),
            "volume lock {} is already held by this handle",
            self.key
        );

        if let Ok(guard) = self.mutex.clone().try_lock_owned() {
            self.guard = Some(guard);
            return Ok(true);
        }

        let wait = bounded_wait(timeout, self.deadline);
        if wait.is_zero() {
            trace!(key = %self.key, "Volume lock busy");
            return Ok(false);
        }

        match tokio::time::timeout(wait, self.mutex.clone().lock_owned()).await {
            Ok(guard) => {
                self.guard = Some(guard);
                Ok(true)
            }
            Err(_) => {
                trace!(key = %self.key, wait_ms = wait.as_millis() as u64, "Timed out waiting for volume lock");
                Ok(false)
            }
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        match self.guard.take() {
            Some(guard) => {
                drop(guard);
                Ok(())
            }
            None => panic!("unlock of volume lock {} which is not held", self.key),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
