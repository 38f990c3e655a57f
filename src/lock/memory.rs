use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::lock::{LockStore, deadline_after};
use crate::store::Error;

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// An in-process lock store.
///
/// Entries expire on their own once their TTL passes; an expired entry is
/// treated exactly like a missing one. Only tasks sharing this store (or a
/// clone of it) are excluded from each other, so it suits single-instance
/// deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    entries: Arc<DashMap<String, LockEntry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        let entry = LockEntry {
            token: token.to_owned(),
            expires_at: deadline_after(now, ttl),
        };

        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(entry);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    /// Deletes a live entry holding `token`. An expired entry is evicted
    /// whatever its token, but only a live match counts as deleted.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, Error> {
        let now = Instant::now();
        let mut released = false;
        self.entries.remove_if(key, |_, entry| {
            if !entry.is_live(now) {
                return true;
            }
            released = entry.token == token;
            released
        });

        Ok(released)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.token == token && entry.is_live(now) => {
                entry.expires_at = deadline_after(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, Error> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.token.clone()))
    }
}
