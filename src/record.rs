use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use std::sync::Arc;

/// Bound satisfied by every type that can be stored as a session record.
///
/// The storage layer never looks inside a record; it only needs to move it
/// between tasks and, for remote backends, encode and decode it.
pub trait SessionData: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> SessionData for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A shared handle to one session's mutable state.
///
/// Cloning the handle is cheap and yields another reference to the *same*
/// state. Whether a handle returned by a backend aliases the stored state
/// depends on the backend:
///
/// - [`LocalBackend`](crate::store::LocalBackend) hands out the stored handle
///   itself, so writes through it are visible to every later `get`
///   (write-through-by-reference).
/// - [`RemoteBackend`](crate::store::RemoteBackend) decodes a fresh copy on
///   every `get`; writes are invisible until the handle is `put` back
///   (write-back).
///
/// Code that must work with either backend should always `put` after
/// mutating.
pub struct Record<R> {
    inner: Arc<RwLock<R>>,
}

impl<R> Record<R> {
    pub fn new(value: R) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Locks the record for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, R> {
        self.inner.read()
    }

    /// Locks the record for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, R> {
        self.inner.write()
    }

    /// Returns `true` if both handles point at the same state.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a detached copy of the current state.
    pub fn snapshot(&self) -> R
    where
        R: Clone,
    {
        self.inner.read().clone()
    }
}

impl<R> Clone for Record<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> From<R> for Record<R> {
    fn from(value: R) -> Self {
        Self::new(value)
    }
}

impl<R: fmt::Debug> fmt::Debug for Record<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Record").field(&*self.inner.read()).finish()
    }
}
