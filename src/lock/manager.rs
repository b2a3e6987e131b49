//! Registry of lock instances keyed by resource name.
//!
//! Instances are handed out and reused per key, and forgotten once their lease
//! plus a grace period has passed. Forgetting a handle never touches the remote
//! lock; that still depends on its TTL or an explicit release.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::distributed::{lock_key, DistributedLock, LockOptions};
use crate::config::LockSettings;
use crate::context::OpContext;
use crate::error::{LatchkeyError, ReleaseFailure, Result};
use crate::store::KeyValueStore;

struct TrackedLock {
    lock: Arc<DistributedLock>,
    evict_at: Instant,
}

/// Hands out shared lock instances and evicts them after their lease.
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    settings: LockSettings,
    locks: DashMap<String, TrackedLock>,
    /// Min-heap of (eviction instant, key)
    evictions: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_settings(store, &LockSettings::default())
    }

    pub fn with_settings(store: Arc<dyn KeyValueStore>, settings: &LockSettings) -> Self {
        Self {
            store,
            settings: settings.clone(),
            locks: DashMap::new(),
            evictions: Mutex::new(BinaryHeap::new()),
        }
    }

    /// The tracked instance for `name`, or a new one with `ttl` and `options`.
    ///
    /// When an instance is already tracked, `ttl` and `options` are ignored.
    pub fn get_lock(&self, name: &str, ttl: Duration, options: LockOptions) -> Arc<DistributedLock> {
        let now = Instant::now();
        self.evict_expired_at(now);

        let key = lock_key(name);
        // The shard guard from `entry` must be gone before the heap is locked.
        let (lock, scheduled) = match self.locks.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().lock.clone(), None),
            Entry::Vacant(entry) => {
                let lock = Arc::new(DistributedLock::new(self.store.clone(), name, ttl, options));
                let evict_at = now + ttl + self.settings.registry_grace();
                entry.insert(TrackedLock {
                    lock: lock.clone(),
                    evict_at,
                });
                (lock, Some(evict_at))
            }
        };

        if let Some(evict_at) = scheduled {
            self.evictions.lock().push(Reverse((evict_at, key.clone())));
            trace!(key = %key, "Tracking new lock instance");
        }
        lock
    }

    /// Lock options built from this manager's settings.
    pub fn default_options(&self) -> LockOptions {
        LockOptions::from_settings(&self.settings)
    }

    /// Forget handles whose eviction time has passed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    /// Forget handles whose eviction time is at or before `now`.
    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let due = {
            let mut heap = self.evictions.lock();
            let mut due = Vec::new();
            while heap.peek().is_some_and(|Reverse((at, _))| *at <= now) {
                if let Some(Reverse(entry)) = heap.pop() {
                    due.push(entry);
                }
            }
            due
        };

        let mut evicted = 0;
        for (at, key) in due {
            // A key may have been released and tracked again since it was scheduled.
            if self.locks.remove_if(&key, |_, tracked| tracked.evict_at == at).is_some() {
                trace!(key = %key, "Evicted lock handle");
                evicted += 1;
            }
        }
        evicted
    }

    /// Run eviction periodically until the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!("Lock manager dropped, stopping sweeper");
                    return;
                };
                let evicted = manager.evict_expired();
                if evicted > 0 {
                    debug!(evicted, remaining = manager.len(), "Swept lock registry");
                }
            }
        })
    }

    /// Release every tracked lock.
    ///
    /// All releases are attempted; failures are collected into one
    /// `ReleaseAll` error. Released handles are dropped from the registry.
    pub async fn release_all(&self, ctx: &OpContext) -> Result<()> {
        let tracked: Vec<(String, Arc<DistributedLock>)> = self
            .locks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock.clone()))
            .collect();

        info!(count = tracked.len(), "Releasing all tracked locks");

        let results = join_all(tracked.iter().map(|(_, lock)| lock.release(ctx))).await;

        let mut failures = Vec::new();
        for ((key, _), result) in tracked.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    self.locks.remove(&key);
                }
                Err(error) => failures.push(ReleaseFailure { key, error }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LatchkeyError::ReleaseAll(failures))
        }
    }

    /// Run `f` under the lock for `name`, with a fresh instance.
    pub async fn mutex<F, Fut, T, E>(
        &self,
        ctx: &OpContext,
        name: &str,
        ttl: Duration,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LatchkeyError>,
    {
        DistributedLock::new(self.store.clone(), name, ttl, self.default_options())
            .run_exclusive(ctx, f)
            .await
    }

    /// Whether an instance for `name` is tracked.
    pub fn contains(&self, name: &str) -> bool {
        self.locks.contains_key(&lock_key(name))
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> (Arc<MemoryStore>, LockManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = LockManager::new(store.clone());
        (store, manager)
    }

    #[tokio::test]
    async fn test_get_lock_reuses_instance() {
        let (_, manager) = manager();
        let a = manager.get_lock("post:1", Duration::from_secs(5), LockOptions::default());
        let b = manager.get_lock("post:1", Duration::from_secs(1), LockOptions::default());
        let c = manager.get_lock("post:2", Duration::from_secs(5), LockOptions::default());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.key(), "lock:post:1");
        assert_eq!(manager.len(), 2);
        assert!(manager.contains("post:2"));
    }

    #[tokio::test]
    async fn test_eviction_forgets_handle_but_keeps_remote_lock() {
        let (store, manager) = manager();
        let ctx = OpContext::background();
        let lock = manager.get_lock("job", Duration::from_secs(1), LockOptions::default());
        assert!(lock.acquire(&ctx).await.unwrap());

        assert_eq!(manager.evict_expired_at(Instant::now() + Duration::from_secs(5)), 0);
        assert_eq!(manager.evict_expired_at(Instant::now() + Duration::from_secs(12)), 1);
        assert!(manager.is_empty());
        assert_eq!(
            store.get("lock:job").await.unwrap().as_deref(),
            Some(lock.token())
        );

        let fresh = manager.get_lock("job", Duration::from_secs(1), LockOptions::default());
        assert!(!Arc::ptr_eq(&lock, &fresh));
    }

    #[tokio::test]
    async fn test_stale_heap_entry_does_not_evict_new_handle() {
        let (_, manager) = manager();
        let ctx = OpContext::background();
        let first = manager.get_lock("k", Duration::from_millis(10), LockOptions::default());
        assert!(first.acquire(&ctx).await.unwrap());
        manager.release_all(&ctx).await.unwrap();
        assert!(manager.is_empty());

        let second = manager.get_lock("k", Duration::from_secs(60), LockOptions::default());
        assert_eq!(manager.evict_expired_at(Instant::now() + Duration::from_secs(11)), 0);
        assert!(manager.contains("k"));
        assert!(second.acquire(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_all_aggregates_failures() {
        let (store, manager) = manager();
        let ctx = OpContext::background();

        let fine = manager.get_lock("fine", Duration::from_secs(5), LockOptions::default());
        let stolen = manager.get_lock("stolen", Duration::from_millis(30), LockOptions::default());
        assert!(fine.acquire(&ctx).await.unwrap());
        assert!(stolen.acquire(&ctx).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let thief = DistributedLock::new(
            store.clone(),
            "stolen",
            Duration::from_secs(5),
            LockOptions::default(),
        );
        assert!(thief.acquire(&ctx).await.unwrap());

        match manager.release_all(&ctx).await {
            Err(LatchkeyError::ReleaseAll(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].key, "lock:stolen");
                assert!(matches!(failures[0].error, LatchkeyError::NotOwned));
            }
            other => panic!("expected aggregated failure, got {:?}", other),
        }

        assert!(store.get("lock:fine").await.unwrap().is_none());
        assert_eq!(
            store.get("lock:stolen").await.unwrap().as_deref(),
            Some(thief.token())
        );
        assert!(!manager.contains("fine"));
        assert!(manager.contains("stolen"));
    }

    #[tokio::test]
    async fn test_manager_mutex() {
        let (store, manager) = manager();
        let ctx = OpContext::background();

        let value = manager
            .mutex(&ctx, "like:post:9", Duration::from_secs(5), || async {
                Ok::<_, LatchkeyError>("done")
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert!(store.get("lock:like:post:9").await.unwrap().is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_concurrent_get_lock_and_eviction_make_progress() {
        let settings = LockSettings {
            registry_grace_ms: 0,
            ..LockSettings::default()
        };
        let manager = Arc::new(LockManager::with_settings(
            Arc::new(MemoryStore::new()),
            &settings,
        ));
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let handles: Vec<_> = (0..2)
            .map(|worker| {
                let manager = manager.clone();
                let done_tx = done_tx.clone();
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        if worker == 0 {
                            manager.get_lock(
                                &format!("k{}", i % 8),
                                Duration::from_millis(1),
                                LockOptions::default(),
                            );
                        } else {
                            manager.evict_expired_at(Instant::now() + Duration::from_secs(3600));
                        }
                    }
                    let _ = done_tx.send(worker);
                })
            })
            .collect();

        for _ in 0..2 {
            done_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("registry operations stalled");
        }
        for handle in handles {
            handle.join().unwrap();
        }

        manager.evict_expired_at(Instant::now() + Duration::from_secs(3600));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_stops_with_manager() {
        let (_, manager) = manager();
        let manager = Arc::new(manager);
        let handle = manager.spawn_sweeper(Duration::from_millis(10));

        drop(manager);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
