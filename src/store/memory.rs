use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use crate::record::{Record, SessionData};
use crate::store::{Error, StorageBackend};

/// An in-process session store.
///
/// Records are kept as shared handles: [`get`](StorageBackend::get) returns
/// the very handle that was stored, so mutating it is immediately visible to
/// later reads without another `put`.
///
/// ### Note
///
/// Records live only in this process. Running several server instances
/// against a `LocalBackend` each gives them a private, incoherent view of the
/// games; use [`RemoteBackend`](crate::store::RemoteBackend) for that.
pub struct LocalBackend<R> {
    records: Arc<DashMap<String, Record<R>>>,
}

impl<R> LocalBackend<R> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
        }
    }
}

impl<R> Default for LocalBackend<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for LocalBackend<R> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<R> fmt::Debug for LocalBackend<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("records", &self.records.len())
            .finish()
    }
}

impl<R: SessionData> StorageBackend for LocalBackend<R> {
    type Record = R;

    async fn get(&self, id: &str) -> Option<Record<R>> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    async fn put(&self, id: &str, record: Record<R>) -> Result<(), Error> {
        self.records.insert(id.to_owned(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    async fn exists(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    async fn count(&self) -> usize {
        self.records.len()
    }

    async fn all_ids(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }
}
