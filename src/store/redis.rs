use crate::record::{Record, SessionData};
use crate::store::{DEFAULT_RECORD_PREFIX, Error, StorageBackend};
use fred::clients::Client;
use fred::interfaces::{ClientLike, KeysInterface};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: u32 = 500;

#[cfg(feature = "json")]
pub(crate) fn serialize_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
}

#[cfg(feature = "json")]
pub(crate) fn deserialize_value<T: DeserializeOwned>(value: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(value).map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(feature = "messagepack")]
pub(crate) fn serialize_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, Error> {
    rmp_serde::to_vec_named(value).map_err(|e| Error::Encode(e.to_string()))
}

#[cfg(feature = "messagepack")]
pub(crate) fn deserialize_value<T: DeserializeOwned>(value: &[u8]) -> Result<T, Error> {
    rmp_serde::from_slice(value).map_err(|e| Error::Decode(e.to_string()))
}

/// A redis session store implementation.
///
/// Each record is stored as one serialized blob under
/// `<prefix><session id>`.
///
/// Records are **write-back**: every `get` decodes a fresh copy, and changes
/// made through the returned [`Record`] reach the store only when it is `put`
/// again.
///
/// # Failure policy
///
/// The [`StorageBackend`] read operations never fail. A connection or decode
/// error is logged and reported as the empty outcome (`None`, `false`, `0`,
/// no ids), which makes "absent" and "unreachable" look the same. The
/// `try_*` methods return the underlying `Result` for callers that must tell
/// them apart. `put` always surfaces its error.
pub struct RemoteBackend<R, C = Client>
where
    C: ClientLike + KeysInterface + Send + Sync + 'static,
{
    client: Arc<C>,
    prefix: String,
    _record: PhantomData<fn() -> R>,
}

impl<R, C> RemoteBackend<R, C>
where
    C: ClientLike + KeysInterface + Send + Sync + 'static,
{
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            prefix: DEFAULT_RECORD_PREFIX.to_string(),
            _record: PhantomData,
        }
    }

    /// Sets the key prefix records are stored under.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The client this backend talks through.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    fn scan_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.prefix))
    }

    /// Checks that the server answers a `PING` within `timeout`.
    #[tracing::instrument(name = "checking remote store health", skip(self))]
    pub async fn health_check(&self, timeout: Duration) -> Result<(), Error> {
        match tokio::time::timeout(timeout, self.client.ping::<()>(None)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Backend(format!(
                "health check timed out after {timeout:?}"
            ))),
        }
    }

    pub async fn try_get(&self, id: &str) -> Result<Option<Record<R>>, Error>
    where
        R: DeserializeOwned,
    {
        let data: Option<Vec<u8>> = self.client.get(self.key(id)).await?;

        data.map(|data| deserialize_value::<R>(&data).map(Record::new))
            .transpose()
    }

    pub async fn try_delete(&self, id: &str) -> Result<bool, Error> {
        let removed: i64 = self.client.del(self.key(id)).await?;
        Ok(removed > 0)
    }

    pub async fn try_exists(&self, id: &str) -> Result<bool, Error> {
        let found: i64 = self.client.exists(self.key(id)).await?;
        Ok(found > 0)
    }

    pub async fn try_count(&self) -> Result<usize, Error> {
        Ok(self.scan_keys().await?.len())
    }

    pub async fn try_all_ids(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .scan_keys()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_owned))
            .collect())
    }

    /// Walks the keyspace with `SCAN`, one page per round trip, collecting
    /// the distinct keys under this backend's prefix.
    ///
    /// `SCAN` may return a key more than once while the keyspace is being
    /// rehashed, hence the set.
    async fn scan_keys(&self) -> Result<HashSet<String>, Error> {
        let pattern = self.scan_pattern();
        let mut cursor = String::from("0");
        let mut keys = HashSet::new();

        loop {
            let (next, page): (String, Vec<String>) = self
                .client
                .scan_page(cursor, pattern.as_str(), Some(SCAN_BATCH), None)
                .await?;
            keys.extend(page);

            if next == "0" {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

/// Maps a failed remote operation to the empty outcome, logging the error.
///
/// This is the only place the fail-safe-to-empty policy is applied.
fn fail_safe<T: Default>(operation: &'static str, id: Option<&str>, result: Result<T, Error>) -> T {
    result.unwrap_or_else(|err| {
        tracing::error!(operation, id, err = %err, "remote store operation failed; reporting empty result");
        T::default()
    })
}

/// Escapes the glob metacharacters understood by `SCAN ... MATCH`.
fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

impl<R, C> StorageBackend for RemoteBackend<R, C>
where
    R: SessionData,
    C: ClientLike + KeysInterface + Send + Sync + 'static,
{
    type Record = R;

    async fn get(&self, id: &str) -> Option<Record<R>> {
        fail_safe("get", Some(id), self.try_get(id).await)
    }

    #[tracing::instrument(name = "storing record in remote store", skip(self, record))]
    async fn put(&self, id: &str, record: Record<R>) -> Result<(), Error> {
        let data = serialize_value(&*record.read())?;

        let _: () = self
            .client
            .set(self.key(id), data.as_slice(), None, None, false)
            .await
            .map_err(|err| {
                tracing::error!(err = %err, "failed to store record");
                err
            })?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> bool {
        fail_safe("delete", Some(id), self.try_delete(id).await)
    }

    async fn exists(&self, id: &str) -> bool {
        fail_safe("exists", Some(id), self.try_exists(id).await)
    }

    async fn count(&self) -> usize {
        fail_safe("count", None, self.try_count().await)
    }

    async fn all_ids(&self) -> Vec<String> {
        fail_safe("all_ids", None, self.try_all_ids().await)
    }
}

impl<R, C> Clone for RemoteBackend<R, C>
where
    C: ClientLike + KeysInterface + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            prefix: self.prefix.clone(),
            _record: PhantomData,
        }
    }
}

impl<R, C> fmt::Debug for RemoteBackend<R, C>
where
    C: ClientLike + KeysInterface + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
