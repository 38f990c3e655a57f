//! # game-store: game-state storage with per-session distributed locking
//!
//! `game-store` keeps the mutable state of running game sessions behind a
//! small storage trait and arbitrates concurrent access to each session with
//! a lock that works across server processes.
//!
//! The crate never looks inside a session record. It stores, loads and
//! deletes whole records, and guarantees that at most one caller at a time
//! holds the lock for a given session id.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use game_store::{BackendSelector, Record, StorageBackend, StoreConfig};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Game {
//!     round: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     // GAME_STORE_BACKEND=redis GAME_STORE_REDIS_URL=redis://127.0.0.1:6379
//!     let storage = BackendSelector::select::<Game>(&StoreConfig::from_env()).await;
//!
//!     storage.backend.put("g1", Record::new(Game { round: 0 })).await.unwrap();
//!
//!     let backend = &storage.backend;
//!     let result = storage
//!         .locks
//!         .with_lock("g1", move || async move {
//!             let game = backend.get("g1").await.expect("game exists");
//!             game.write().round += 1;
//!             // Always put back: a remote backend hands out copies.
//!             backend.put("g1", game).await
//!         })
//!         .await;
//!
//!     match result {
//!         Ok(stored) => stored.unwrap(),
//!         Err(timeout) => eprintln!("session busy: {timeout}"),
//!     }
//! }
//! ```
//!
//! # Backends
//!
//! ## LocalBackend
//! An in-process map. `get` returns the stored handle itself, so a mutation
//! through it is visible to every later `get` even without `put`. Records
//! are invisible to other processes; use it for single-instance deployments
//! and tests.
//!
//! ## RemoteBackend
//! **Note**: Requires the `redis-store` feature (enabled by default).
//!
//! Stores each record as one serialized blob under `<prefix><session id>` on
//! a redis server. Every `get` decodes a fresh copy, so changes reach the
//! store only through `put`. Read operations report connection failures as
//! the empty outcome (`None`, `false`, `0`, no ids) after logging them; the
//! `try_*` methods expose the underlying errors.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fred::clients::Client;
//! use fred::interfaces::ClientLike;
//! use game_store::store::RemoteBackend;
//! use game_store::lock::{LockManager, RedisLockStore};
//!
//! # #[derive(serde::Serialize, serde::Deserialize)] struct Game;
//! # async fn run() -> Result<(), fred::error::Error> {
//! let client = Arc::new(Client::default());
//! client.init().await?;
//!
//! let backend: RemoteBackend<Game> = RemoteBackend::new(Arc::clone(&client));
//! let locks = LockManager::new(RedisLockStore::new(client));
//! # Ok(())
//! # }
//! ```
//!
//! ## Serialization
//! Remote records are encoded with one of:
//!
//! - [`serde_json`](https://crates.io/crates/serde_json) (default, `json` feature)
//! - [`rmp-serde`](https://crates.io/crates/rmp-serde) (MessagePack, `messagepack` feature)
//!
//! ```toml
//! [dependencies]
//! game-store = { version = "0.1", default-features = false, features = ["redis-store", "messagepack"] }
//! ```
//!
//! # Locks
//!
//! A [`DistributedLock`] is a key `<prefix><session id>` holding a random
//! token with a TTL. `acquire` retries a set-if-absent every retry interval
//! until it wins or its acquire timeout passes; `release` deletes the key only
//! if it still holds this handle's token. A holder that crashes blocks the
//! session for at most one TTL.
//!
//! Defaults: TTL 30s, acquire timeout 10s, retry interval 50ms.
//!
//! # Configuration
//!
//! [`StoreConfig::from_env`] reads:
//!
//! - `GAME_STORE_BACKEND`: `memory` (default) or `redis`
//! - `GAME_STORE_REDIS_URL`: connection URL, required for `redis`
//! - `GAME_STORE_RECORD_PREFIX`, `GAME_STORE_LOCK_PREFIX`
//! - `GAME_STORE_LOCK_TTL_SECS`, `GAME_STORE_LOCK_TIMEOUT_SECS`, `GAME_STORE_LOCK_RETRY_MS`
//! - `GAME_STORE_CONNECT_TIMEOUT_MS`
//! - `GAME_STORE_COMMAND_TIMEOUT_MS`
//!
//! [`BackendSelector::select`] falls back to in-process storage, with a
//! warning, whenever redis is requested but cannot be used.

#[cfg(feature = "redis-store")]
pub use fred;

pub mod config;
pub use config::{BackendKind, StoreConfig};

pub mod lock;
pub use lock::{DistributedLock, LockManager, LockOptions, LockStore};

mod record;
pub use record::{Record, SessionData};

mod selector;
pub use selector::{Backend, BackendSelector, SelectedLockStore, Storage};

pub mod store;
pub use store::{LocalBackend, StorageBackend};
