mod common;

#[cfg(test)]
mod tests {
    use super::*;

    use common::*;
    use game_store::lock::{Error as LockError, MemoryLockStore};
    use game_store::{
        BackendKind, BackendSelector, LocalBackend, LockManager, LockOptions, LockStore, Record,
        StorageBackend, StoreConfig,
    };
    use std::collections::HashSet;
    use std::time::Duration;

    fn fast_options() -> LockOptions {
        LockOptions::default()
            .acquire_timeout(Duration::from_secs(10))
            .retry_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_local_backend_lifecycle() {
        init_tracing();
        let store: LocalBackend<TestGame> = LocalBackend::new();
        let game = Record::new(create_test_game());

        // Initial state
        assert!(store.get("g1").await.is_none());
        assert_eq!(store.count().await, 0);

        store.put("g1", game.clone()).await.unwrap();
        let retrieved = store.get("g1").await.unwrap();
        assert!(retrieved.ptr_eq(&game));
        assert_eq!(retrieved.snapshot(), create_test_game());

        // Write-through by reference
        retrieved.write().phase = "playing".to_string();
        assert_eq!(store.get("g1").await.unwrap().read().phase, "playing");

        store.put("g2", Record::new(create_test_game())).await.unwrap();
        assert_eq!(store.count().await, 2);
        let ids: HashSet<String> = store.all_ids().await.into_iter().collect();
        assert_eq!(ids, HashSet::from(["g1".to_string(), "g2".to_string()]));

        assert!(store.delete("g1").await);
        assert!(!store.delete("g1").await);
        assert!(store.get("g1").await.is_none());
        assert_eq!(store.count().await, 1);
        assert_eq!(store.all_ids().await, vec!["g2".to_string()]);
    }

    #[tokio::test]
    async fn test_selected_storage_round_trip() {
        init_tracing();
        let storage = BackendSelector::select::<TestGame>(&StoreConfig::default()).await;
        assert_eq!(storage.kind(), BackendKind::Memory);

        storage
            .backend
            .put("g1", Record::new(create_test_game()))
            .await
            .unwrap();
        assert!(storage.backend.exists("g1").await);
        assert_eq!(
            storage.backend.get("g1").await.unwrap().snapshot(),
            create_test_game()
        );
    }

    #[tokio::test]
    async fn test_redis_without_target_falls_back() {
        init_tracing();
        let config = StoreConfig {
            backend: "redis".to_string(),
            redis_url: None,
            ..StoreConfig::default()
        };

        let storage = BackendSelector::select::<TestGame>(&config).await;
        assert_eq!(storage.kind(), BackendKind::Memory);
        assert_eq!(storage.backend.count().await, 0);
    }

    #[cfg(feature = "redis-store")]
    #[tokio::test]
    async fn test_unreachable_redis_falls_back() {
        init_tracing();
        let config = StoreConfig {
            backend: "redis".to_string(),
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            connect_timeout_ms: 500,
            ..StoreConfig::default()
        };

        let storage = BackendSelector::select::<TestGame>(&config).await;
        assert_eq!(storage.kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn test_unbounded_lock_settings_do_not_overflow() {
        init_tracing();
        let config = StoreConfig {
            lock_ttl_secs: u64::MAX,
            lock_acquire_timeout_secs: u64::MAX,
            ..StoreConfig::default()
        };

        let storage = BackendSelector::select::<TestGame>(&config).await;
        let result = storage.locks.with_lock("g1", || async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_lock_mutual_exclusion_and_handover() {
        init_tracing();
        let locks = LockManager::new(MemoryLockStore::new());
        let options = LockOptions::default().acquire_timeout(Duration::from_secs(1));

        let mut a = locks.lock("g1");
        let mut b = locks.lock_with("g1", options);

        assert!(a.acquire().await);
        assert!(!b.acquire().await);

        a.release().await;
        assert!(b.acquire().await);
        b.release().await;
    }

    #[tokio::test]
    async fn test_lock_recovers_after_ttl() {
        init_tracing();
        let locks = LockManager::new(MemoryLockStore::new());

        let mut crashed = locks.lock_with("g1", LockOptions::default().ttl(Duration::from_secs(1)));
        assert!(crashed.acquire().await);
        // Simulate a crash: the holder never releases and its handle is leaked.
        std::mem::forget(crashed);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let mut next = locks.lock_with("g1", LockOptions::default().acquire_timeout(Duration::ZERO));
        assert!(next.acquire().await);
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_token() {
        init_tracing();
        let store = MemoryLockStore::new();
        let locks = LockManager::new(store.clone());

        let mut lock = locks.lock_with("g1", LockOptions::default().ttl(Duration::from_millis(100)));
        assert!(lock.acquire().await);

        // The entry expires and another process takes the session.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let key = locks.key("g1");
        assert!(
            store
                .set_if_absent(&key, "foreign", Duration::from_secs(30))
                .await
                .unwrap()
        );

        lock.release().await;
        assert_eq!(store.holder(&key).await.unwrap().as_deref(), Some("foreign"));
    }

    #[tokio::test]
    async fn test_scoped_section_reports_timeout() {
        init_tracing();
        let locks = LockManager::new(MemoryLockStore::new());
        let mut holder = locks.lock("g1");
        assert!(holder.acquire().await);

        let result = locks
            .lock_with("g1", LockOptions::default().acquire_timeout(Duration::from_millis(100)))
            .run(|| async { "ran" })
            .await;

        match result {
            Err(LockError::Timeout { key, timeout }) => {
                assert_eq!(key, "game_lock:g1");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            Ok(_) => panic!("protected section ran without the lock"),
        }
    }

    #[tokio::test]
    async fn test_panicking_section_releases_lock() {
        init_tracing();
        let locks = LockManager::new(MemoryLockStore::new());

        let task_locks = locks.clone();
        let outcome = tokio::spawn(async move {
            task_locks
                .with_lock("g1", || async {
                    panic!("rule engine bug");
                })
                .await
        })
        .await;
        assert!(outcome.unwrap_err().is_panic());

        let mut next = locks.lock_with("g1", fast_options().acquire_timeout(Duration::from_secs(1)));
        assert!(next.acquire().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_locked_updates_are_not_lost() {
        init_tracing();
        let storage = BackendSelector::select::<TestGame>(&StoreConfig::default()).await;
        storage
            .backend
            .put("g1", Record::new(create_test_game()))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let storage = storage.clone();
            tasks.push(tokio::spawn(async move {
                let backend = storage.backend.clone();
                storage
                    .locks
                    .lock_with("g1", fast_options())
                    .run(move || async move {
                        let game = backend.get("g1").await.unwrap();
                        let round = game.read().round;
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        // Copy-then-put, as a caller agnostic of the backend must.
                        let mut next = game.snapshot();
                        next.round = round + 1;
                        backend.put("g1", Record::new(next)).await.unwrap();
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(storage.backend.get("g1").await.unwrap().read().round, 16);
    }
}
