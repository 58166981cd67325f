use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{LockError, LockManager, OwnerToken};

/// Time source for lock expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|p| p.into_inner());
        self.origin + offset
    }
}

#[derive(Debug, Clone)]
struct Entry {
    owner: OwnerToken,
    expires_at: Instant,
}

/// Single-process lock table with TTL expiry. Intended for tests/dev.
pub struct InMemoryLockManager {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for InMemoryLockManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryLockManager").finish_non_exhaustive()
    }
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, LockError> {
        self.entries.lock().map_err(|_| LockError::Poisoned)
    }
}

impl LockManager for InMemoryLockManager {
    fn try_acquire(&self, key: &str, owner: &OwnerToken, ttl: Duration) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                owner: owner.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some(entry) if entry.expires_at <= now => {
                entries.remove(key);
                Ok(false)
            }
            Some(entry) if &entry.owner == owner => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_held(&self, key: &str) -> Result<bool, LockError> {
        let now = self.clock.now();
        let entries = self.entries()?;
        Ok(entries.get(key).is_some_and(|e| e.expires_at > now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(60_000);

    #[test]
    fn expired_lock_can_be_reacquired() {
        let clock = Arc::new(ManualClock::new());
        let locks = InMemoryLockManager::with_clock(clock.clone());
        let (a, b) = (OwnerToken::generate(), OwnerToken::generate());

        assert!(locks.try_acquire("k", &a, TTL).unwrap());
        clock.advance(Duration::from_millis(59_999));
        assert!(!locks.try_acquire("k", &b, TTL).unwrap());

        clock.advance(Duration::from_millis(1));
        assert!(!locks.is_held("k").unwrap());
        assert!(locks.try_acquire("k", &b, TTL).unwrap());
    }

    #[test]
    fn release_only_deletes_own_entry() {
        let clock = Arc::new(ManualClock::new());
        let locks = InMemoryLockManager::with_clock(clock.clone());
        let (stale, fresh) = (OwnerToken::generate(), OwnerToken::generate());

        assert!(locks.try_acquire("k", &stale, TTL).unwrap());
        clock.advance(TTL);
        assert!(locks.try_acquire("k", &fresh, TTL).unwrap());

        assert!(!locks.release("k", &stale).unwrap());
        assert!(locks.is_held("k").unwrap());
        assert!(locks.release("k", &fresh).unwrap());
        assert!(!locks.is_held("k").unwrap());
    }

    #[test]
    fn releasing_an_expired_entry_reports_false() {
        let clock = Arc::new(ManualClock::new());
        let locks = InMemoryLockManager::with_clock(clock.clone());
        let owner = OwnerToken::generate();

        locks.try_acquire("k", &owner, TTL).unwrap();
        clock.advance(TTL * 2);
        assert!(!locks.release("k", &owner).unwrap());
    }
}
