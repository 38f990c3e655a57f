//! Startup-time choice of storage and lock backends.

use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{BackendKind, StoreConfig};
use crate::lock::{LockManager, LockStore, MemoryLockStore};
use crate::record::{Record, SessionData};
use crate::store::{self, LocalBackend, StorageBackend};

#[cfg(feature = "redis-store")]
use crate::lock::RedisLockStore;
#[cfg(feature = "redis-store")]
use crate::store::RemoteBackend;
#[cfg(feature = "redis-store")]
use fred::clients::Client;
#[cfg(feature = "redis-store")]
use fred::prelude::{Builder, ClientLike, Config, ReconnectPolicy};
#[cfg(feature = "redis-store")]
use std::sync::Arc;

/// The storage backend chosen for this process.
pub enum Backend<R> {
    Local(LocalBackend<R>),
    #[cfg(feature = "redis-store")]
    Remote(RemoteBackend<R>),
}

impl<R> Backend<R> {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local(_) => BackendKind::Memory,
            #[cfg(feature = "redis-store")]
            Self::Remote(_) => BackendKind::Redis,
        }
    }
}

impl<R: SessionData> StorageBackend for Backend<R> {
    type Record = R;

    async fn get(&self, id: &str) -> Option<Record<R>> {
        match self {
            Self::Local(backend) => backend.get(id).await,
            #[cfg(feature = "redis-store")]
            Self::Remote(backend) => backend.get(id).await,
        }
    }

    async fn put(&self, id: &str, record: Record<R>) -> Result<(), store::Error> {
        match self {
            Self::Local(backend) => backend.put(id, record).await,
            #[cfg(feature = "redis-store")]
            Self::Remote(backend) => backend.put(id, record).await,
        }
    }

    async fn delete(&self, id: &str) -> bool {
        match self {
            Self::Local(backend) => backend.delete(id).await,
            #[cfg(feature = "redis-store")]
            Self::Remote(backend) => backend.delete(id).await,
        }
    }

    async fn exists(&self, id: &str) -> bool {
        match self {
            Self::Local(backend) => backend.exists(id).await,
            #[cfg(feature = "redis-store")]
            Self::Remote(backend) => backend.exists(id).await,
        }
    }

    async fn count(&self) -> usize {
        match self {
            Self::Local(backend) => backend.count().await,
            #[cfg(feature = "redis-store")]
            Self::Remote(backend) => backend.count().await,
        }
    }

    async fn all_ids(&self) -> Vec<String> {
        match self {
            Self::Local(backend) => backend.all_ids().await,
            #[cfg(feature = "redis-store")]
            Self::Remote(backend) => backend.all_ids().await,
        }
    }
}

impl<R> Clone for Backend<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Local(backend) => Self::Local(backend.clone()),
            #[cfg(feature = "redis-store")]
            Self::Remote(backend) => Self::Remote(backend.clone()),
        }
    }
}

impl<R> fmt::Debug for Backend<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(backend) => f.debug_tuple("Local").field(backend).finish(),
            #[cfg(feature = "redis-store")]
            Self::Remote(backend) => f.debug_tuple("Remote").field(backend).finish(),
        }
    }
}

/// The lock store matching the chosen [`Backend`].
#[derive(Debug, Clone)]
pub enum SelectedLockStore {
    Memory(MemoryLockStore),
    #[cfg(feature = "redis-store")]
    Redis(RedisLockStore),
}

impl LockStore for SelectedLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, store::Error> {
        match self {
            Self::Memory(locks) => locks.set_if_absent(key, token, ttl).await,
            #[cfg(feature = "redis-store")]
            Self::Redis(locks) => locks.set_if_absent(key, token, ttl).await,
        }
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, store::Error> {
        match self {
            Self::Memory(locks) => locks.compare_and_delete(key, token).await,
            #[cfg(feature = "redis-store")]
            Self::Redis(locks) => locks.compare_and_delete(key, token).await,
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, store::Error> {
        match self {
            Self::Memory(locks) => locks.compare_and_expire(key, token, ttl).await,
            #[cfg(feature = "redis-store")]
            Self::Redis(locks) => locks.compare_and_expire(key, token, ttl).await,
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, store::Error> {
        match self {
            Self::Memory(locks) => locks.holder(key).await,
            #[cfg(feature = "redis-store")]
            Self::Redis(locks) => locks.holder(key).await,
        }
    }
}

/// A storage backend together with the lock manager that guards it.
///
/// Both halves share one connection when remote. Clone it freely; clones
/// refer to the same records and the same locks.
#[derive(Debug)]
pub struct Storage<R> {
    pub backend: Backend<R>,
    pub locks: LockManager<SelectedLockStore>,
}

impl<R> Storage<R> {
    /// In-process storage and locks, configured from `config`.
    pub fn local(config: &StoreConfig) -> Self {
        Self {
            backend: Backend::Local(LocalBackend::new()),
            locks: LockManager::new(SelectedLockStore::Memory(MemoryLockStore::new()))
                .with_prefix(config.lock_prefix.clone())
                .with_defaults(config.lock_options()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

impl<R> Clone for Storage<R> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            locks: self.locks.clone(),
        }
    }
}

/// Picks the storage backend for this process from configuration.
///
/// Selection never fails: whenever the configured backend cannot be used the
/// reason is logged as a warning and in-process storage is returned instead.
pub struct BackendSelector;

impl BackendSelector {
    #[tracing::instrument(name = "selecting storage backend", skip(config), fields(backend = %config.backend))]
    pub async fn select<R: SessionData>(config: &StoreConfig) -> Storage<R> {
        match config.backend_kind() {
            Ok(BackendKind::Memory) => {}
            Ok(BackendKind::Redis) => {
                if let Some(storage) = Self::remote(config).await {
                    info!("using redis storage");
                    return storage;
                }
            }
            Err(err) => {
                warn!(err = %err, "unrecognized storage backend; using in-memory storage");
            }
        }

        info!("using in-memory storage");
        Storage::local(config)
    }

    #[cfg(feature = "redis-store")]
    async fn remote<R: SessionData>(config: &StoreConfig) -> Option<Storage<R>> {
        let Some(url) = config.redis_url() else {
            warn!("redis storage selected without a connection URL; using in-memory storage");
            return None;
        };

        let client = match connect(url, config.connect_timeout(), config.command_timeout()).await {
            Ok(client) => client,
            Err(err) => {
                warn!(err = %err, "could not connect to redis; using in-memory storage");
                return None;
            }
        };

        let backend =
            RemoteBackend::new(Arc::clone(&client)).with_prefix(config.record_prefix.clone());
        if let Err(err) = backend.health_check(config.connect_timeout()).await {
            warn!(err = %err, "redis health check failed; using in-memory storage");
            disconnect(&client).await;
            return None;
        }

        Some(Storage {
            backend: Backend::Remote(backend),
            locks: LockManager::new(SelectedLockStore::Redis(RedisLockStore::new(client)))
                .with_prefix(config.lock_prefix.clone())
                .with_defaults(config.lock_options()),
        })
    }

    #[cfg(not(feature = "redis-store"))]
    async fn remote<R: SessionData>(_config: &StoreConfig) -> Option<Storage<R>> {
        warn!("redis storage selected but the redis-store feature is disabled; using in-memory storage");
        None
    }
}

/// Builds a client for `url` and waits up to `timeout` for it to connect.
///
/// Every command on the returned client fails after `command_timeout`, also
/// while it is reconnecting, so an outage surfaces as errors rather than
/// stalled calls.
#[cfg(feature = "redis-store")]
async fn connect(
    url: &str,
    timeout: Duration,
    command_timeout: Duration,
) -> Result<Arc<Client>, store::Error> {
    let config = Config::from_url(url)?;
    let client = Builder::from_config(config)
        .with_connection_config(|connection| {
            connection.connection_timeout = timeout;
        })
        .with_performance_config(|performance| {
            performance.default_command_timeout = command_timeout;
        })
        .set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2))
        .build()?;

    match tokio::time::timeout(timeout, client.init()).await {
        Ok(Ok(_)) => Ok(Arc::new(client)),
        Ok(Err(err)) => {
            disconnect(&client).await;
            Err(err.into())
        }
        Err(_) => {
            disconnect(&client).await;
            Err(store::Error::Backend(format!(
                "connection timed out after {timeout:?}"
            )))
        }
    }
}

/// Stops a client that will not be used, including its reconnect loop.
#[cfg(feature = "redis-store")]
async fn disconnect(client: &Client) {
    const QUIT_TIMEOUT: Duration = Duration::from_millis(500);

    if let Ok(Err(err)) = tokio::time::timeout(QUIT_TIMEOUT, client.quit()).await {
        tracing::debug!(err = %err, "error while closing unused redis client");
    }
}
