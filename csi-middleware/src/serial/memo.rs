use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use super::is_operation_pending;
use crate::chain::CallResult;
use crate::lock::LockKey;

/// Methods whose last attempt under a lock key failed.
///
/// Only read and written while the caller holds the volume lock for the
/// key, so the mutex is never contended for the same key.
#[derive(Debug, Default)]
pub(super) struct ErrorMemo {
    failed: Mutex<HashMap<LockKey, HashSet<&'static str>>>,
}

impl ErrorMemo {
    pub(super) fn contains(&self, key: &LockKey, method: &str) -> bool {
        self.failed
            .lock()
            .get(key)
            .is_some_and(|methods| methods.contains(method))
    }

    /// Update the memo with the outcome of `method` under `key`.
    pub(super) fn record(&self, key: &LockKey, method: &'static str, result: &CallResult) {
        let mut failed = self.failed.lock();
        match result {
            Ok(_) => {
                if let Some(methods) = failed.get_mut(key) {
                    methods.remove(method);
                    if methods.is_empty() {
                        failed.remove(key);
                    }
                }
            }
            Err(status) if is_operation_pending(status) => {}
            Err(_) => {
                failed.entry(key.clone()).or_default().insert(method);
            }
        }
    }
}
