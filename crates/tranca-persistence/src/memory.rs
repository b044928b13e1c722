// In-memory lock store
// Single-process arbiter with automatic expiry sweeping

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use tranca_common::{LockError, LockName};

use crate::model::LockRecord;
use crate::store::{LockStore, expiry_after, now_millis};

/// A stored lock entry
struct LockEntry {
    token: String,
    expires_at: i64,
}

impl LockEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// In-memory lock store using DashMap
///
/// Suitable for single-process deployments and tests. Every operation
/// already treats expired entries as absent; the optional sweeper only
/// bounds the map's footprint.
pub struct InMemoryLockStore {
    locks: Arc<DashMap<String, LockEntry>>,
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Start a background task that drops expired entries every `period`
    pub fn start_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let locks = self.locks.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = now_millis();
                let before = locks.len();
                locks.retain(|_, entry| !entry.is_expired(now));
                let removed = before.saturating_sub(locks.len());
                if removed > 0 {
                    debug!(count = removed, "Cleaned up expired lock entries");
                }
            }
        })
    }

    /// Number of stored entries, live or not (test observation)
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(&self, name: &LockName, token: &str, ttl: Duration) -> Result<(), LockError> {
        let now = now_millis();
        let entry = LockEntry {
            token: token.to_string(),
            expires_at: expiry_after(now, ttl),
        };

        match self.locks.entry(name.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.token != token && !existing.is_expired(now) {
                    return Err(LockError::Held { name: name.clone() });
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        debug!(name = %name, token = %token, "Lock acquired");
        Ok(())
    }

    async fn refresh(&self, name: &LockName, token: &str, ttl: Duration) -> Result<(), LockError> {
        let now = now_millis();

        match self.locks.entry(name.as_str().to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                if occupied.get().token != token {
                    return Err(LockError::HeldByOther { name: name.clone() });
                }
                occupied.get_mut().expires_at = expiry_after(now, ttl);
                debug!(name = %name, token = %token, "Lock refreshed");
                Ok(())
            }
            _ => Err(LockError::Missing { name: name.clone() }),
        }
    }

    async fn release(&self, name: &LockName, token: &str) -> Result<(), LockError> {
        let now = now_millis();

        match self.locks.entry(name.as_str().to_string()) {
            Entry::Occupied(occupied) if !occupied.get().is_expired(now) => {
                if occupied.get().token != token {
                    return Err(LockError::HeldByOther { name: name.clone() });
                }
                occupied.remove();
                debug!(name = %name, token = %token, "Lock released");
                Ok(())
            }
            _ => Err(LockError::Missing { name: name.clone() }),
        }
    }

    async fn find(&self, name: &LockName) -> Result<Option<LockRecord>, LockError> {
        let now = now_millis();
        let record = self
            .locks
            .get(name.as_str())
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| LockRecord {
                name: name.clone(),
                token: entry.token.clone(),
                expires_at: entry.expires_at,
            });
        Ok(record)
    }
}
