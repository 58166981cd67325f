//! Batch configuration: pool sizes, fault-tolerance defaults and lock settings.
//!
//! Values come from [`BatchConfig::default`], optionally overlaid with `BATCH_*`
//! environment variables via [`BatchConfig::from_env`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
}

/// Distributed lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// When false, acquisition always succeeds and release is a no-op.
    pub enabled: bool,
    pub ttl_ms: u64,
    pub prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 60_000,
            prefix: "batch:lock:".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub page_size: usize,
    pub skip_limit: u64,
    pub retry_limit: u32,
    pub throttle_limit: usize,
    pub grid_size: usize,
    /// Upper bound on concurrently running partition workers.
    pub partition_pool_size: usize,
    /// Process-wide bound on concurrently running chunk pipelines.
    pub chunk_pool_size: usize,
    pub lock: LockConfig,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            page_size: 1000,
            skip_limit: 10,
            retry_limit: 3,
            throttle_limit: 4,
            grid_size: 4,
            partition_pool_size: 16,
            chunk_pool_size: 8,
            lock: LockConfig::default(),
            redis_url: None,
            database_url: None,
        }
    }
}

impl BatchConfig {
    /// Defaults overlaid with `BATCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        overlay(&lookup, "BATCH_CHUNK_SIZE", &mut cfg.chunk_size)?;
        overlay(&lookup, "BATCH_PAGE_SIZE", &mut cfg.page_size)?;
        overlay(&lookup, "BATCH_SKIP_LIMIT", &mut cfg.skip_limit)?;
        overlay(&lookup, "BATCH_RETRY_LIMIT", &mut cfg.retry_limit)?;
        overlay(&lookup, "BATCH_THROTTLE_LIMIT", &mut cfg.throttle_limit)?;
        overlay(&lookup, "BATCH_GRID_SIZE", &mut cfg.grid_size)?;
        overlay(&lookup, "BATCH_PARTITION_POOL_SIZE", &mut cfg.partition_pool_size)?;
        overlay(&lookup, "BATCH_CHUNK_POOL_SIZE", &mut cfg.chunk_pool_size)?;
        overlay(&lookup, "BATCH_LOCK_ENABLED", &mut cfg.lock.enabled)?;
        overlay(&lookup, "BATCH_LOCK_TTL_MS", &mut cfg.lock.ttl_ms)?;
        if let Some(prefix) = lookup("BATCH_LOCK_PREFIX") {
            cfg.lock.prefix = prefix;
        }
        cfg.redis_url = lookup("BATCH_REDIS_URL").or(cfg.redis_url);
        cfg.database_url = lookup("BATCH_DATABASE_URL").or(cfg.database_url);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("chunk_size", self.chunk_size),
            ("page_size", self.page_size),
            ("throttle_limit", self.throttle_limit),
            ("grid_size", self.grid_size),
            ("partition_pool_size", self.partition_pool_size),
            ("chunk_pool_size", self.chunk_pool_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }
        if self.lock.ttl_ms == 0 {
            return Err(ConfigError::NotPositive("lock.ttl_ms"));
        }
        Ok(())
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_chunk_pool_size(mut self, size: usize) -> Self {
        self.chunk_pool_size = size;
        self
    }

    pub fn with_partition_pool_size(mut self, size: usize) -> Self {
        self.partition_pool_size = size;
        self
    }
}

fn overlay<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}
