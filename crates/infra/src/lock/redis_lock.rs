//! Redis-backed lock manager.
//!
//! - acquire: `SET key token NX PX ttl`
//! - release: Lua compare-and-delete, so an expired lock re-taken by another
//!   holder is never deleted by the previous one
//! - held: `EXISTS key`

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::{LockError, LockManager, OwnerToken};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLockManager {
    client: Arc<redis::Client>,
}

impl RedisLockManager {
    /// `redis_url` e.g. `redis://localhost:6379`.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

impl LockManager for RedisLockManager {
    #[instrument(skip(self, owner), err)]
    fn try_acquire(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query(&mut conn)
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self, owner), err)]
    fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool, LockError> {
        let mut conn = self.connection()?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(owner.as_str())
            .invoke(&mut conn)
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(deleted == 1)
    }

    fn is_held(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.connection()?;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(exists > 0)
    }
}
