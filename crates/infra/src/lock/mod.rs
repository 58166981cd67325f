//! Cluster-wide mutual exclusion keyed by job name.
//!
//! A [`LockManager`] is the raw key/value protocol (set-if-absent with TTL,
//! compare-and-delete, existence). [`BatchLock`] layers the job-name prefix and
//! the `enabled` switch on top and hands out [`LockLease`]s that carry the owner
//! token to wherever the job finishes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;

mod in_memory;
#[cfg(feature = "redis")]
mod redis_lock;

pub use in_memory::{Clock, InMemoryLockManager, ManualClock, SystemClock};
#[cfg(feature = "redis")]
pub use redis_lock::RedisLockManager;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Backend(String),

    #[error("lock state poisoned")]
    Poisoned,
}

/// Opaque value stored under a held lock key; only its holder may release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait LockManager: Send + Sync {
    /// Atomically set `key` to `owner` if absent. `Ok(false)` when already held.
    fn try_acquire(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` only if it still holds `owner`. Returns whether it was deleted.
    fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool, LockError>;

    fn is_held(&self, key: &str) -> Result<bool, LockError>;
}

impl<T: LockManager + ?Sized> LockManager for Arc<T> {
    fn try_acquire(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError> {
        (**self).try_acquire(key, owner, ttl)
    }

    fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool, LockError> {
        (**self).release(key, owner)
    }

    fn is_held(&self, key: &str) -> Result<bool, LockError> {
        (**self).is_held(key)
    }
}

/// Job-level lock service.
#[derive(Clone)]
pub struct BatchLock {
    manager: Arc<dyn LockManager>,
    config: LockConfig,
}

impl core::fmt::Debug for BatchLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchLock").field("config", &self.config).finish()
    }
}

impl BatchLock {
    pub fn new(manager: Arc<dyn LockManager>, config: LockConfig) -> Self {
        Self { manager, config }
    }

    pub fn key(&self, job_name: &str) -> String {
        format!("{}{}", self.config.prefix, job_name)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Try to take the lock for `job_name`. `Ok(None)` when another holder has it.
    pub fn try_lock(&self, job_name: &str) -> Result<Option<LockLease>, LockError> {
        let token = OwnerToken::generate();
        if !self.config.enabled {
            return Ok(Some(LockLease::new(self.clone(), job_name, token)));
        }

        let key = self.key(job_name);
        let ttl = Duration::from_millis(self.config.ttl_ms);
        if self.manager.try_acquire(&key, &token, ttl)? {
            info!(job_name, lock_key = %key, ttl_ms = self.config.ttl_ms, "job lock acquired");
            Ok(Some(LockLease::new(self.clone(), job_name, token)))
        } else {
            debug!(job_name, lock_key = %key, "job lock held elsewhere");
            Ok(None)
        }
    }

    pub fn unlock(&self, job_name: &str, token: &OwnerToken) -> Result<bool, LockError> {
        if !self.config.enabled {
            return Ok(false);
        }
        let key = self.key(job_name);
        let released = self.manager.release(&key, token)?;
        if released {
            info!(job_name, lock_key = %key, "job lock released");
        } else {
            warn!(job_name, lock_key = %key, "job lock was no longer ours (expired or taken over)");
        }
        Ok(released)
    }

    /// Whether any holder has the job's lock. Always false when locking is disabled.
    pub fn is_locked(&self, job_name: &str) -> Result<bool, LockError> {
        if !self.config.enabled {
            return Ok(false);
        }
        self.manager.is_held(&self.key(job_name))
    }
}

/// Proof of holding a job lock. Released explicitly at job completion; dropping
/// an unreleased lease releases it as a fallback.
#[derive(Debug)]
pub struct LockLease {
    lock: BatchLock,
    job_name: String,
    token: OwnerToken,
    released: bool,
}

impl LockLease {
    fn new(lock: BatchLock, job_name: &str, token: OwnerToken) -> Self {
        Self {
            lock,
            job_name: job_name.to_string(),
            token,
            released: false,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn token(&self) -> &OwnerToken {
        &self.token
    }

    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.lock.unlock(&self.job_name, &self.token)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.lock.unlock(&self.job_name, &self.token) {
            warn!(job_name = %self.job_name, error = %err, "failed to release job lock on drop");
        }
    }
}
