//! Distributed lock provider backed by etcd.
//!
//! Each handle owns an etcd lease (the lock "session") that is granted when
//! the handle is created and kept alive from a background task. Locks are
//! taken with etcd's lock service, attached to that lease, so a crashed
//! holder releases its locks when the lease expires.

use std::time::Duration;

use etcd_client::{Client, GetOptions, LockOptions};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{LockError, LockKey, LockProvider, Result, VolumeLock, bounded_wait};
use crate::context::CallContext;

/// Default lease TTL for lock sessions.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// Bound on the single acquisition attempt made with a zero timeout once
/// the lock was seen free.
pub const UNCONTENDED_ATTEMPT: Duration = Duration::from_secs(1);

/// Connection settings for [`EtcdLockProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Prefix scoping every lock key, so independent deployments sharing an
    /// etcd cluster do not contend.
    pub domain: String,
    pub session_ttl: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            domain: "csi".to_string(),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

/// Lock provider storing locks in etcd.
#[derive(Clone)]
pub struct EtcdLockProvider {
    client: Client,
    domain: String,
    session_ttl: Duration,
}

impl std::fmt::Debug for EtcdLockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdLockProvider")
            .field("domain", &self.domain)
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

impl EtcdLockProvider {
    /// Connect to the etcd cluster described by `config`.
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None)
            .await
            .map_err(|source| LockError::Connect {
                endpoints: config.endpoints.join(","),
                source,
            })?;
        debug!(endpoints = ?config.endpoints, domain = %config.domain, "Connected to etcd");
        Ok(Self::from_client(client, &config.domain, config.session_ttl))
    }

    pub fn from_client(client: Client, domain: &str, session_ttl: Duration) -> Self {
        Self {
            client,
            domain: domain.trim_end_matches('/').to_string(),
            session_ttl,
        }
    }

    /// Key as stored in etcd, scoped by the domain.
    pub fn scoped_key(&self, key: &LockKey) -> String {
        scoped_key(&self.domain, key)
    }

    fn ttl_secs(&self) -> i64 {
        self.session_ttl.as_secs().max(1) as i64
    }
}

fn scoped_key(domain: &str, key: &LockKey) -> String {
    if domain.is_empty() {
        key.to_string()
    } else {
        format!("{domain}/{key}")
    }
}

#[tonic::async_trait]
impl LockProvider for EtcdLockProvider {
    async fn lock(&self, ctx: &CallContext, key: &LockKey) -> Result<Box<dyn VolumeLock>> {
        let key = self.scoped_key(key);
        let mut client = self.client.clone();

        let grant = client.lease_grant(self.ttl_secs(), None);
        let lease = match ctx.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, grant)
                .await
                .map_err(|_| LockError::Cancelled(key.clone()))?,
            None => grant.await,
        }
        .map_err(|err| cancelled_or(err, &key))?;

        let lease_id = lease.id();
        trace!(key = %key, lease_id, ttl = lease.ttl(), "Granted lock session lease");

        let keepalive = spawn_keepalive(client.clone(), lease_id, self.session_ttl);
        Ok(Box::new(EtcdLock {
            client,
            key,
            lease_id,
            deadline: ctx.deadline(),
            owner_key: None,
            keepalive: Some(keepalive),
        }))
    }
}

/// Keep the session lease alive until the task is aborted.
fn spawn_keepalive(mut client: Client, lease_id: i64, ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(error) => {
                warn!(lease_id, error = %error, "Failed to start lease keep-alive");
                return;
            }
        };
        let period = (ttl / 3).max(Duration::from_millis(500));
        loop {
            tokio::time::sleep(period).await;
            if let Err(error) = keeper.keep_alive().await {
                warn!(lease_id, error = %error, "Lease keep-alive failed");
                return;
            }
            match stream.message().await {
                Ok(Some(response)) if response.ttl() > 0 => {
                    trace!(lease_id, ttl = response.ttl(), "Lease renewed");
                }
                Ok(_) => {
                    warn!(lease_id, "Lock session lease expired");
                    return;
                }
                Err(error) => {
                    warn!(lease_id, error = %error, "Lease keep-alive stream failed");
                    return;
                }
            }
        }
    })
}

/// Map an etcd error, treating call cancellation as "not obtained".
fn cancelled_or(err: etcd_client::Error, key: &str) -> LockError {
    if is_cancellation(&err) {
        LockError::Cancelled(key.to_string())
    } else {
        LockError::Etcd(err)
    }
}

fn is_cancellation(err: &etcd_client::Error) -> bool {
    match err {
        // Compare numeric codes, etcd-client may link its own tonic
        etcd_client::Error::GRpcStatus(status) => {
            let code = status.code() as i32;
            code == tonic::Code::Cancelled as i32 || code == tonic::Code::DeadlineExceeded as i32
        }
        _ => false,
    }
}

/// Handle on one etcd lock, owning its session lease.
pub struct EtcdLock {
    client: Client,
    key: String,
    lease_id: i64,
    deadline: Option<Instant>,
    /// Ownership key returned by etcd while the lock is held.
    owner_key: Option<Vec<u8>>,
    keepalive: Option<JoinHandle<()>>,
}

/// How one acquisition attempt may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// The call deadline has passed.
    Expired,
    /// Zero timeout: give up if the lock has an owner, otherwise try within
    /// the bound.
    Once(Duration),
    Wait(Duration),
}

impl Attempt {
    fn new(timeout: Duration, deadline: Option<Instant>) -> Self {
        let (wait, once) = if timeout.is_zero() {
            (bounded_wait(UNCONTENDED_ATTEMPT, deadline), true)
        } else {
            (bounded_wait(timeout, deadline), false)
        };
        match (wait.is_zero(), once) {
            (true, _) => Attempt::Expired,
            (false, true) => Attempt::Once(wait),
            (false, false) => Attempt::Wait(wait),
        }
    }
}

/// Prefix under which etcd's lock service stores owner and waiter keys.
fn owner_prefix(key: &str) -> String {
    format!("{key}/")
}

impl EtcdLock {
    /// Whether any session owns or is queued on this lock.
    async fn contended(&mut self, wait: Duration) -> Result<bool> {
        let options = GetOptions::new().with_prefix().with_keys_only().with_limit(1);
        let lookup = self.client.get(owner_prefix(&self.key), Some(options));
        match tokio::time::timeout(wait, lookup).await {
            Ok(Ok(response)) => Ok(!response.kvs().is_empty()),
            // Cancelled or out of time counts as busy
            Ok(Err(err)) if is_cancellation(&err) => Ok(true),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Ok(true),
        }
    }
}

#[tonic::async_trait]
impl VolumeLock for EtcdLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn try_lock(&mut self, timeout: Duration) -> Result<bool> {
        assert!(
            self.owner_key.is_none(),
            "volume lock {} is already held by this handle",
            self.key
        );

        let wait = match Attempt::new(timeout, self.deadline) {
            Attempt::Expired => return Ok(false),
            Attempt::Once(wait) => {
                if self.contended(wait).await? {
                    trace!(key = %self.key, "Etcd lock is held, not waiting");
                    return Ok(false);
                }
                wait
            }
            Attempt::Wait(wait) => wait,
        };

        let options = LockOptions::new().with_lease(self.lease_id);
        let attempt = self.client.lock(self.key.as_str(), Some(options));
        match tokio::time::timeout(wait, attempt).await {
            Ok(Ok(response)) => {
                self.owner_key = Some(response.key().to_vec());
                trace!(key = %self.key, lease_id = self.lease_id, "Acquired etcd lock");
                Ok(true)
            }
            Ok(Err(err)) if is_cancellation(&err) => Ok(false),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                trace!(key = %self.key, wait_ms = wait.as_millis() as u64, "Timed out waiting for etcd lock");
                Ok(false)
            }
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        let Some(owner_key) = self.owner_key.take() else {
            panic!("unlock of volume lock {} which is not held", self.key);
        };
        self.client.unlock(owner_key).await?;
        trace!(key = %self.key, "Released etcd lock");
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = self;
        if let Some(task) = this.keepalive.take() {
            task.abort();
        }
        // Revoking the lease drops the lock and any queued waiter key
        this.client.lease_revoke(this.lease_id).await?;
        this.owner_key = None;
        trace!(key = %this.key, lease_id = this.lease_id, "Closed lock session");
        Ok(())
    }
}

impl Drop for EtcdLock {
    fn drop(&mut self) {
        // Closed handles have already revoked their lease
        let Some(task) = self.keepalive.take() else {
            return;
        };
        task.abort();

        let mut client = self.client.clone();
        let lease_id = self.lease_id;
        let key = std::mem::take(&mut self.key);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(error) = client.lease_revoke(lease_id).await {
                    warn!(key = %key, lease_id, error = %error, "Failed to revoke abandoned lock session");
                }
            });
        }
    }
}
