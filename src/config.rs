//! Storage configuration, read once at startup.

use serde::Deserialize;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::lock::{DEFAULT_LOCK_PREFIX, LockOptions};
use crate::store::DEFAULT_RECORD_PREFIX;

const BACKEND_ENV: &str = "GAME_STORE_BACKEND";
const REDIS_URL_ENV: &str = "GAME_STORE_REDIS_URL";
const RECORD_PREFIX_ENV: &str = "GAME_STORE_RECORD_PREFIX";
const LOCK_PREFIX_ENV: &str = "GAME_STORE_LOCK_PREFIX";
const LOCK_TTL_ENV: &str = "GAME_STORE_LOCK_TTL_SECS";
const LOCK_TIMEOUT_ENV: &str = "GAME_STORE_LOCK_TIMEOUT_SECS";
const LOCK_RETRY_ENV: &str = "GAME_STORE_LOCK_RETRY_MS";
const CONNECT_TIMEOUT_ENV: &str = "GAME_STORE_CONNECT_TIMEOUT_MS";
const COMMAND_TIMEOUT_ENV: &str = "GAME_STORE_COMMAND_TIMEOUT_MS";

/// The storage implementations a deployment can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Process-local map.
    Memory,
    /// Shared redis server.
    Redis,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "local" | "in-memory" => Ok(Self::Memory),
            "redis" | "remote" => Ok(Self::Redis),
            other => Err(format!("unknown storage backend `{other}`")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

/// Everything the storage layer reads from its environment.
///
/// `backend` is kept as the raw configured string so that an unknown value
/// can be reported and replaced by the in-memory backend rather than
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: String,
    pub redis_url: Option<String>,
    pub record_prefix: String,
    pub lock_prefix: String,
    pub lock_ttl_secs: u64,
    pub lock_acquire_timeout_secs: u64,
    pub lock_retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound on a single redis command, reconnect waits included.
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let lock = LockOptions::default();
        Self {
            backend: BackendKind::Memory.to_string(),
            redis_url: None,
            record_prefix: DEFAULT_RECORD_PREFIX.to_string(),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            lock_ttl_secs: lock.ttl.as_secs(),
            lock_acquire_timeout_secs: lock.acquire_timeout.as_secs(),
            lock_retry_interval_ms: lock.retry_interval.as_millis() as u64,
            connect_timeout_ms: 2_000,
            command_timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    /// Builds the configuration from `GAME_STORE_*` environment variables,
    /// keeping the default for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(backend) = env_string(BACKEND_ENV) {
            config.backend = backend;
        }
        config.redis_url = env_string(REDIS_URL_ENV);
        if let Some(prefix) = env_string(RECORD_PREFIX_ENV) {
            config.record_prefix = prefix;
        }
        if let Some(prefix) = env_string(LOCK_PREFIX_ENV) {
            config.lock_prefix = prefix;
        }
        if let Some(secs) = env_number(LOCK_TTL_ENV) {
            config.lock_ttl_secs = secs;
        }
        if let Some(secs) = env_number(LOCK_TIMEOUT_ENV) {
            config.lock_acquire_timeout_secs = secs;
        }
        if let Some(millis) = env_number(LOCK_RETRY_ENV) {
            config.lock_retry_interval_ms = millis;
        }
        if let Some(millis) = env_number(CONNECT_TIMEOUT_ENV) {
            config.connect_timeout_ms = millis;
        }
        if let Some(millis) = env_number(COMMAND_TIMEOUT_ENV) {
            config.command_timeout_ms = millis;
        }

        config
    }

    /// The requested backend, or the unrecognized value.
    pub fn backend_kind(&self) -> Result<BackendKind, String> {
        self.backend.parse()
    }

    /// The redis URL, ignoring blank values.
    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The per-command timeout. Zero is raised to one millisecond, since
    /// fred reads zero as "wait forever".
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }

    /// Default timings for locks built from this configuration.
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(self.lock_ttl_secs),
            acquire_timeout: Duration::from_secs(self.lock_acquire_timeout_secs),
            retry_interval: Duration::from_millis(self.lock_retry_interval_ms),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_number(name: &str) -> Option<u64> {
    let value = env_string(name)?;
    match value.trim().parse::<u64>() {
        Ok(number) => Some(number),
        Err(err) => {
            warn!(var = name, value = %value, error = %err, "ignoring unparseable setting");
            None
        }
    }
}
