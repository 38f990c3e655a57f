use std::future::Future;

use crate::record::{Record, SessionData};

mod memory;
pub use memory::LocalBackend;

#[cfg(feature = "redis-store")]
pub mod redis;
#[cfg(feature = "redis-store")]
pub use redis::RemoteBackend;

/// Key prefix used for session records unless overridden.
pub const DEFAULT_RECORD_PREFIX: &str = "game:";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Encoding failed with: {0}")]
    Encode(String),

    #[error("Decoding failed with: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Backend(String),
}

#[cfg(feature = "redis-store")]
impl From<fred::error::Error> for Error {
    fn from(err: fred::error::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

/// The capability set every session storage implementation exposes.
///
/// Backends are plain storage: they give no guarantee about concurrent
/// read-modify-write cycles on the same id. Callers serialize those through a
/// [`DistributedLock`](crate::lock::DistributedLock) held around the cycle.
pub trait StorageBackend: Send + Sync + 'static {
    type Record: SessionData;

    /// Gets the record stored at `id`, or `None` if there is none.
    fn get(&self, id: &str) -> impl Future<Output = Option<Record<Self::Record>>> + Send;

    /// Stores `record` at `id`, replacing whatever was there.
    fn put(
        &self,
        id: &str,
        record: Record<Self::Record>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Removes the record stored at `id`.
    ///
    /// Returns `true` if a record existed.
    fn delete(&self, id: &str) -> impl Future<Output = bool> + Send;

    fn exists(&self, id: &str) -> impl Future<Output = bool> + Send;

    /// Number of stored records.
    fn count(&self) -> impl Future<Output = usize> + Send;

    /// Ids of every stored record, in no particular order.
    fn all_ids(&self) -> impl Future<Output = Vec<String>> + Send;
}
