//! Per-session mutual exclusion across tasks and processes.
//!
//! A [`LockManager`] hands out one [`DistributedLock`] per acquisition
//! attempt. The lock lives in a [`LockStore`] as a key holding a random token
//! with a TTL, so a holder that dies without releasing blocks the session
//! for at most one TTL.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, warn};

use crate::store;

mod memory;
mod token;
pub use memory::MemoryLockStore;
pub use token::Token;

#[cfg(feature = "redis-store")]
mod lua;
#[cfg(feature = "redis-store")]
mod redis;
#[cfg(feature = "redis-store")]
pub use redis::RedisLockStore;

/// Key prefix used for lock entries unless overridden.
pub const DEFAULT_LOCK_PREFIX: &str = "game_lock:";

/// Stand-in for "never" when a duration does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + duration`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("timed out after {timeout:?} waiting for lock {key}")]
    Timeout { key: String, timeout: Duration },
}

/// The atomic primitives a [`DistributedLock`] needs from a shared store.
///
/// Every operation must be atomic with respect to every other operation on
/// the same key, across all processes sharing the store.
pub trait LockStore: Clone + Send + Sync + 'static {
    /// Sets `key` to `token` with the given TTL, only if `key` holds no live
    /// entry.
    ///
    /// Returns `true` if the entry was created.
    fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, store::Error>> + Send;

    /// Deletes `key` only if it currently holds `token`.
    ///
    /// Returns `true` if the entry was deleted.
    fn compare_and_delete(
        &self,
        key: &str,
        token: &str,
    ) -> impl Future<Output = Result<bool, store::Error>> + Send;

    /// Resets the TTL of `key` only if it currently holds `token`.
    fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, store::Error>> + Send;

    /// The token currently held at `key`, if the entry is live.
    fn holder(&self, key: &str) -> impl Future<Output = Result<Option<String>, store::Error>> + Send;
}

/// Timing parameters of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long the entry survives without being released.
    pub ttl: Duration,
    /// How long `acquire` keeps retrying before giving up.
    pub acquire_timeout: Duration,
    /// Pause between two acquisition attempts.
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
        }
    }
}

impl LockOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Exclusive access to one session for one caller.
///
/// A handle is good for a single acquisition: `acquire`, do the work,
/// `release`. Competing acquirers race on every retry tick; there is no
/// queueing or fairness.
///
/// A handle dropped while it still holds the lock (a panic inside the
/// protected section, or the surrounding future being cancelled) releases it
/// from a background task on the current tokio runtime. Outside a runtime the
/// entry is left to expire.
#[derive(Debug)]
pub struct DistributedLock<S: LockStore> {
    store: S,
    key: String,
    options: LockOptions,
    token: Option<Token>,
}

impl<S: LockStore> DistributedLock<S> {
    pub fn new(store: S, key: impl Into<String>, options: LockOptions) -> Self {
        Self {
            store,
            key: key.into(),
            options,
            token: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// The token of the current acquisition, if this handle holds the lock.
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    /// Whether this handle believes it holds the lock.
    ///
    /// This is a local view: the entry may have expired in the store.
    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    /// Tries to take the lock until it succeeds or the acquire timeout
    /// passes.
    ///
    /// Returns `true` once the lock is held. Store errors count as a lost
    /// race and are retried. Each attempt is cut off at the deadline (or
    /// after one retry interval, whichever is later), so a store that stops
    /// answering cannot hold `acquire` past its timeout.
    #[tracing::instrument(name = "acquiring lock", skip(self), fields(key = %self.key))]
    pub async fn acquire(&mut self) -> bool {
        if self.token.is_some() {
            debug!("lock already held by this handle");
            return true;
        }

        let token = Token::generate();
        let deadline = deadline_after(Instant::now(), self.options.acquire_timeout);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .max(self.options.retry_interval);
            let attempt = self
                .store
                .set_if_absent(&self.key, token.as_str(), self.options.ttl);

            match timeout(budget, attempt).await {
                Ok(Ok(true)) => {
                    debug!(attempts, "lock acquired");
                    self.token = Some(token);
                    return true;
                }
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    warn!(err = %err, attempts, "lock store failed during acquire");
                }
                Err(_) => {
                    // A write that lands after this point expires with its TTL.
                    warn!(attempts, "lock store did not answer before the deadline");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(attempts, "gave up acquiring lock");
                return false;
            }
            sleep(self.options.retry_interval.min(deadline - now)).await;
        }
    }

    /// Releases the lock if this handle holds it.
    ///
    /// The entry is removed only if it still carries this handle's token, so
    /// a lock that expired and was taken by someone else is left alone.
    /// Failures are logged; the TTL bounds how long a stuck entry survives.
    #[tracing::instrument(name = "releasing lock", skip(self), fields(key = %self.key))]
    pub async fn release(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        match self.store.compare_and_delete(&self.key, token.as_str()).await {
            Ok(true) => debug!("lock released"),
            Ok(false) => warn!("lock expired or changed hands before release"),
            Err(err) => error!(err = %err, "failed to release lock"),
        }
    }

    /// Pushes the expiry of a held lock to `ttl` from now.
    ///
    /// Returns `false`, and forgets the token, if the lock is no longer ours.
    #[tracing::instrument(name = "extending lock", skip(self), fields(key = %self.key))]
    pub async fn extend(&mut self, ttl: Duration) -> bool {
        let Some(token) = self.token.clone() else {
            return false;
        };

        match self
            .store
            .compare_and_expire(&self.key, token.as_str(), ttl)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!("lock lost before it could be extended");
                self.token = None;
                false
            }
            Err(err) => {
                error!(err = %err, "failed to extend lock");
                false
            }
        }
    }

    /// Runs `f` while holding the lock.
    ///
    /// If the lock cannot be taken within the acquire timeout, `f` is not
    /// run and [`Error::Timeout`] is returned. The lock is released once `f`
    /// completes, whatever it returns.
    pub async fn run<F, Fut, T>(mut self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire().await {
            return Err(Error::Timeout {
                key: self.key.clone(),
                timeout: self.options.acquire_timeout,
            });
        }

        let output = f().await;
        self.release().await;

        Ok(output)
    }
}

impl<S: LockStore> Drop for DistributedLock<S> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "lock dropped outside a runtime; leaving it to expire");
            return;
        };

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            if let Err(err) = store.compare_and_delete(&key, token.as_str()).await {
                error!(key = %key, err = %err, "failed to release dropped lock");
            }
        });
    }
}

/// Hands out [`DistributedLock`]s keyed by session id.
///
/// Lock keys are `<prefix><session id>`. The manager holds nothing but the
/// store, the prefix and default timings, so it is cheap to clone and share.
#[derive(Debug, Clone)]
pub struct LockManager<S: LockStore> {
    store: S,
    prefix: String,
    defaults: LockOptions,
}

impl<S: LockStore> LockManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            prefix: DEFAULT_LOCK_PREFIX.to_string(),
            defaults: LockOptions::default(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_defaults(mut self, defaults: LockOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn defaults(&self) -> &LockOptions {
        &self.defaults
    }

    pub fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.prefix, session_id)
    }

    /// A lock on `session_id` with the manager's default timings.
    pub fn lock(&self, session_id: &str) -> DistributedLock<S> {
        self.lock_with(session_id, self.defaults)
    }

    /// A lock on `session_id` with explicit timings.
    pub fn lock_with(&self, session_id: &str, options: LockOptions) -> DistributedLock<S> {
        DistributedLock::new(self.store.clone(), self.key(session_id), options)
    }

    /// Runs `f` while holding the lock on `session_id`.
    pub async fn with_lock<F, Fut, T>(&self, session_id: &str, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock(session_id).run(f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn manager() -> LockManager<MemoryLockStore> {
        LockManager::new(MemoryLockStore::new())
    }

    fn quick(ttl: Duration, timeout: Duration) -> LockOptions {
        LockOptions::default()
            .ttl(ttl)
            .acquire_timeout(timeout)
            .retry_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_keys_are_namespaced() {
        let locks = manager().with_prefix("arena:");
        assert_eq!(locks.key("g1"), "arena:g1");
        assert_eq!(locks.lock("g1").key(), "arena:g1");
        assert_eq!(manager().key("g1"), "game_lock:g1");
    }

    #[test]
    fn test_default_options() {
        let options = LockOptions::default();
        assert_eq!(options.ttl, Duration::from_secs(30));
        assert_eq!(options.acquire_timeout, Duration::from_secs(10));
        assert_eq!(options.retry_interval, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locks = manager();
        let mut a = locks.lock_with("g1", quick(Duration::from_secs(30), Duration::from_secs(1)));
        let mut b = locks.lock_with("g1", quick(Duration::from_secs(30), Duration::from_secs(1)));

        assert!(a.acquire().await);
        assert!(!b.acquire().await);
        assert!(!b.is_held());

        a.release().await;
        assert!(!a.is_held());

        let started = Instant::now();
        assert!(b.acquire().await);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let locks = manager();
        let mut a = locks.lock_with("g1", quick(Duration::from_millis(200), Duration::from_secs(1)));
        let mut b = locks.lock_with("g1", quick(Duration::from_secs(30), Duration::from_secs(1)));

        assert!(a.acquire().await);
        sleep(Duration::from_millis(250)).await;

        assert!(b.acquire().await);
        // A still thinks it holds; releasing must not remove B's entry.
        a.release().await;
        let holder = locks.store().holder(b.key()).await.unwrap();
        assert_eq!(holder.as_deref(), b.token().map(Token::as_str));
    }

    #[tokio::test]
    async fn test_release_keeps_foreign_token() {
        let locks = manager();
        let mut a = locks.lock("g1");
        assert!(a.acquire().await);

        // Swap in a foreign token as if another holder took over.
        let key = locks.key("g1");
        let store = locks.store();
        let ours = a.token().unwrap().as_str().to_owned();
        assert!(store.compare_and_delete(&key, &ours).await.unwrap());
        assert!(store.set_if_absent(&key, "foreign", Duration::from_secs(30)).await.unwrap());

        a.release().await;
        assert_eq!(store.holder(&key).await.unwrap().as_deref(), Some("foreign"));
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_noop() {
        let locks = manager();
        let mut held = locks.lock("g1");
        assert!(held.acquire().await);

        let mut idle = locks.lock("g1");
        idle.release().await;

        assert!(locks.store().holder("game_lock:g1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_twice_keeps_token() {
        let locks = manager();
        let mut a = locks.lock("g1");
        assert!(a.acquire().await);
        let first = a.token().cloned();

        assert!(a.acquire().await);
        assert_eq!(a.token().cloned(), first);
    }

    #[tokio::test]
    async fn test_run_times_out_without_running() {
        let locks = manager();
        let mut holder = locks.lock("g1");
        assert!(holder.acquire().await);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result = locks
            .lock_with("g1", quick(Duration::from_secs(30), Duration::from_millis(100)))
            .run(move || async move { flag.store(true, Ordering::SeqCst) })
            .await;

        assert!(matches!(result, Err(Error::Timeout { ref key, .. }) if key == "game_lock:g1"));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_releases_after_error() {
        let locks = manager();

        let result = locks
            .with_lock("g1", || async { Err::<(), &str>("rule violation") })
            .await;
        assert_eq!(result.unwrap(), Err("rule violation"));

        assert!(locks.store().holder("game_lock:g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_lock_is_released() {
        let locks = manager();
        {
            let mut lock = locks.lock("g1");
            assert!(lock.acquire().await);
        }

        // The release runs on a spawned task.
        let mut next = locks.lock_with("g1", quick(Duration::from_secs(30), Duration::from_secs(1)));
        assert!(next.acquire().await);
    }

    #[tokio::test]
    async fn test_extend() {
        let locks = manager();
        let mut a = locks.lock_with("g1", quick(Duration::from_millis(150), Duration::from_secs(1)));
        assert!(a.acquire().await);
        assert!(a.extend(Duration::from_secs(30)).await);

        sleep(Duration::from_millis(200)).await;
        let mut b = locks.lock_with("g1", quick(Duration::from_secs(30), Duration::from_millis(50)));
        assert!(!b.acquire().await);

        a.release().await;
        assert!(!a.extend(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_extend_lost_lock_forgets_token() {
        let locks = manager();
        let mut a = locks.lock_with("g1", quick(Duration::from_millis(50), Duration::from_secs(1)));
        assert!(a.acquire().await);

        sleep(Duration::from_millis(100)).await;
        assert!(!a.extend(Duration::from_secs(30)).await);
        assert!(!a.is_held());
    }

    #[test]
    fn test_deadline_after_clamps_instead_of_overflowing() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(deadline_after(now, Duration::MAX) >= now + Duration::from_secs(86_400 * 365));
    }

    #[tokio::test]
    async fn test_unbounded_options_do_not_overflow() {
        let locks = manager();
        let options = LockOptions::default()
            .ttl(Duration::MAX)
            .acquire_timeout(Duration::MAX);

        let mut a = locks.lock_with("g1", options);
        assert!(a.acquire().await);
        assert!(a.extend(Duration::MAX).await);

        a.release().await;
        assert!(locks.store().holder("game_lock:g1").await.unwrap().is_none());
    }

    /// A store whose writes never complete, like a client stuck reconnecting.
    #[derive(Debug, Clone)]
    struct StalledStore;

    impl LockStore for StalledStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, store::Error> {
            std::future::pending().await
        }

        async fn compare_and_delete(&self, _: &str, _: &str) -> Result<bool, store::Error> {
            Ok(false)
        }

        async fn compare_and_expire(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> Result<bool, store::Error> {
            Ok(false)
        }

        async fn holder(&self, _: &str) -> Result<Option<String>, store::Error> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_acquire_gives_up_on_stalled_store() {
        let mut lock = DistributedLock::new(
            StalledStore,
            "game_lock:g1",
            quick(Duration::from_secs(30), Duration::from_millis(100)),
        );

        let started = Instant::now();
        assert!(!lock.acquire().await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!lock.is_held());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sections_never_overlap() {
        let locks = manager();
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            tasks.push(tokio::spawn(async move {
                let options = quick(Duration::from_secs(30), Duration::from_secs(10));
                locks
                    .lock_with("g1", options)
                    .run(move || async move {
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
