//! Distributed lock over a shared key-value store.
//!
//! A lock instance owns a token generated once at construction. Holding the
//! lock means the store maps `lock:<name>` to that token; the store's TTL
//! bounds how long a crashed holder can block others.
//!
//! The instance also keeps a local belief (`held` plus a lease deadline). It
//! is only a cache of remote state: [`DistributedLock::is_locked`] reconciles it
//! with the store when a false positive would be costly.
//!
//! There is no fairness between competing acquirers. A retrying acquirer can
//! be starved under sustained contention.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::renewal::{self, RenewalStatus};
use super::token::generate_token;
use crate::config::LockSettings;
use crate::context::OpContext;
use crate::error::{LatchkeyError, Result};
use crate::store::{CompareOutcome, KeyTtl, KeyValueStore};

/// Prefix of every lock key in the store.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Timeout of the release attempted after a run-under-lock section.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Store key guarding the logical resource `name`.
pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, name)
}

/// Bounded linear retry, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Per-instance lock options.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Renew the lease in the background at this interval (zero: a third of the TTL)
    pub auto_renew: Option<Duration>,
    /// Use this token instead of a generated one
    pub token: Option<String>,
    /// Retry policy of the run-under-lock helper
    pub retry: RetryPolicy,
    /// Per-call timeout of background renewals
    pub renew_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            auto_renew: None,
            token: None,
            retry: RetryPolicy::default(),
            renew_timeout: Duration::from_secs(5),
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options derived from the lock settings of the configuration.
    pub fn from_settings(settings: &LockSettings) -> Self {
        Self {
            retry: RetryPolicy {
                attempts: settings.mutex_retries,
                delay: settings.mutex_retry_delay(),
            },
            renew_timeout: settings.renew_timeout(),
            ..Self::default()
        }
    }

    pub fn with_auto_renew(mut self, interval: Duration) -> Self {
        self.auto_renew = Some(interval);
        self
    }

    /// Use a caller-chosen token. An empty token is ignored.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        if !token.is_empty() {
            self.token = Some(token);
        }
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy { attempts, delay };
        self
    }

    pub fn with_renew_timeout(mut self, timeout: Duration) -> Self {
        self.renew_timeout = timeout;
        self
    }
}

/// Local view of the remote lock.
struct LockState {
    held: bool,
    ttl: Duration,
    lease_deadline: Option<Instant>,
}

impl LockState {
    fn lease_valid(&self, now: Instant) -> bool {
        self.held && self.lease_deadline.is_some_and(|deadline| now < deadline)
    }

    fn mark_held(&mut self, since: Instant) {
        self.held = true;
        self.lease_deadline = Some(since + self.ttl);
    }

    fn clear(&mut self) {
        self.held = false;
        self.lease_deadline = None;
    }
}

/// State shared between a lock instance and its renewal task.
pub(super) struct LockShared {
    pub(super) store: Arc<dyn KeyValueStore>,
    pub(super) name: String,
    pub(super) key: String,
    pub(super) token: String,
    pub(super) base_ttl: Duration,
    pub(super) auto_renew: Option<Duration>,
    pub(super) retry: RetryPolicy,
    pub(super) renew_timeout: Duration,
    state: Mutex<LockState>,
    renewal: parking_lot::Mutex<Option<JoinHandle<()>>>,
    pub(super) status: watch::Sender<RenewalStatus>,
}

impl LockShared {
    /// Extend the lease if this instance still owns the key.
    ///
    /// A zero `new_ttl` keeps the current lease length.
    pub(super) async fn renew(&self, ctx: &OpContext, new_ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.held {
            return Err(LatchkeyError::NotAcquired);
        }

        let ttl = if new_ttl.is_zero() { state.ttl } else { new_ttl };
        let started = Instant::now();
        let outcome = ctx
            .call(
                "renew",
                &self.key,
                self.store.compare_and_expire(&self.key, &self.token, ttl),
            )
            .await?;

        match outcome {
            CompareOutcome::Applied => {
                state.ttl = ttl;
                state.mark_held(started);
                Ok(())
            }
            CompareOutcome::Missing => Err(LatchkeyError::Expired),
            CompareOutcome::Mismatch => Err(LatchkeyError::NotOwned),
        }
    }

    fn stop_renewal(&self) {
        if let Some(handle) = self.renewal.lock().take() {
            let finished = handle.is_finished();
            handle.abort();
            if !finished {
                self.status.send_replace(RenewalStatus::Stopped);
            }
        }
    }
}

/// A lock on one logical resource, identified by its ownership token.
///
/// Operations on one instance are serialized; share it behind an `Arc` to use
/// it from several tasks.
pub struct DistributedLock {
    shared: Arc<LockShared>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.shared.key)
            .field("token", &self.shared.token)
            .field("ttl", &self.shared.base_ttl)
            .field("auto_renew", &self.shared.auto_renew)
            .finish()
    }
}

impl DistributedLock {
    /// Create a lock instance for `name` with a lease of `ttl`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        name: &str,
        ttl: Duration,
        options: LockOptions,
    ) -> Self {
        let token = options.token.unwrap_or_else(generate_token);
        let (status, _) = watch::channel(RenewalStatus::Idle);

        Self {
            shared: Arc::new(LockShared {
                store,
                name: name.to_string(),
                key: lock_key(name),
                token,
                base_ttl: ttl,
                auto_renew: options.auto_renew,
                retry: options.retry,
                renew_timeout: options.renew_timeout,
                state: Mutex::new(LockState {
                    held: false,
                    ttl,
                    lease_deadline: None,
                }),
                renewal: parking_lot::Mutex::new(None),
                status,
            }),
        }
    }

    /// Logical resource name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Store key, `lock:<name>`.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn token(&self) -> &str {
        &self.shared.token
    }

    /// Try once to take the lock.
    ///
    /// Returns `Ok(false)` when someone else holds it. Calling this again on an
    /// instance whose local lease is still running returns `true` without a
    /// store round trip; that shortcut says nothing about other instances.
    pub async fn acquire(&self, ctx: &OpContext) -> Result<bool> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;

        let started = Instant::now();
        if state.lease_valid(started) {
            trace!(key = %shared.key, "Lock already held by this instance");
            return Ok(true);
        }

        let ttl = state.ttl;
        let mut acquired = self.set_if_absent(ctx, ttl).await?;

        if !acquired {
            let remaining = ctx
                .call("acquire", &shared.key, shared.store.ttl(&shared.key))
                .await?;
            match remaining {
                // No lease: an orphaned key, or it expired between the two calls.
                KeyTtl::Missing | KeyTtl::Persistent => {
                    debug!(key = %shared.key, ?remaining, "Lock key has no lease, retrying");
                    acquired = self.set_if_absent(ctx, ttl).await?;
                }
                // The local lease runs out slightly before the store's does.
                KeyTtl::Remaining(left) if state.held => {
                    let current = ctx
                        .call("acquire", &shared.key, shared.store.get(&shared.key))
                        .await?;
                    if current.as_deref() == Some(shared.token.as_str()) {
                        state.lease_deadline = Some(Instant::now() + left);
                        trace!(key = %shared.key, "Lock still held by this instance");
                        return Ok(true);
                    }
                }
                KeyTtl::Remaining(_) => {}
            }
        }

        if acquired {
            state.mark_held(started);
            debug!(key = %shared.key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
            self.start_renewal(ttl);
        } else {
            if state.held {
                debug!(key = %shared.key, "Local lease lapsed and the lock is held elsewhere");
                shared.stop_renewal();
            }
            state.clear();
            trace!(key = %shared.key, "Lock held elsewhere");
        }

        Ok(acquired)
    }

    async fn set_if_absent(&self, ctx: &OpContext, ttl: Duration) -> Result<bool> {
        let shared = &self.shared;
        ctx.call(
            "acquire",
            &shared.key,
            shared.store.set_nx(&shared.key, &shared.token, ttl),
        )
        .await
    }

    /// Acquire with up to `max_retries` attempts, `delay` apart.
    ///
    /// Fails with `NotAcquired` once attempts run out, or with
    /// `Cancelled`/`DeadlineExceeded` as soon as the context ends.
    pub async fn acquire_with_retry(
        &self,
        ctx: &OpContext,
        max_retries: u32,
        delay: Duration,
    ) -> Result<()> {
        for attempt in 1..=max_retries {
            if self.acquire(ctx).await? {
                return Ok(());
            }
            if attempt < max_retries {
                trace!(key = %self.shared.key, attempt, "Lock busy, retrying");
                ctx.sleep(delay).await?;
            }
        }

        debug!(key = %self.shared.key, attempts = max_retries, "Gave up acquiring lock");
        Err(LatchkeyError::NotAcquired)
    }

    /// Release the lock if this instance owns it.
    ///
    /// A key that is already gone counts as released. A key holding another
    /// token is left alone and `NotOwned` is returned.
    pub async fn release(&self, ctx: &OpContext) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if !state.held {
            return Ok(());
        }

        let outcome = ctx
            .call(
                "release",
                &shared.key,
                shared.store.compare_and_delete(&shared.key, &shared.token),
            )
            .await?;

        match outcome {
            CompareOutcome::Applied => {
                shared.stop_renewal();
                state.clear();
                debug!(key = %shared.key, "Lock released");
                Ok(())
            }
            CompareOutcome::Missing => {
                shared.stop_renewal();
                state.clear();
                debug!(key = %shared.key, "Lock already expired on release");
                Ok(())
            }
            CompareOutcome::Mismatch => {
                warn!(key = %shared.key, "Release refused, lock is owned by another instance");
                Err(LatchkeyError::NotOwned)
            }
        }
    }

    /// Extend the lease to `new_ttl` (zero keeps the current length).
    pub async fn renew(&self, ctx: &OpContext, new_ttl: Duration) -> Result<()> {
        self.shared.renew(ctx, new_ttl).await
    }

    /// Check with the store whether this instance still holds the lock.
    ///
    /// Clears the local belief when the key is gone or owned by someone else.
    pub async fn is_locked(&self, ctx: &OpContext) -> Result<bool> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if !state.held {
            return Ok(false);
        }

        let current = ctx
            .call("is_locked", &shared.key, shared.store.get(&shared.key))
            .await?;
        if current.as_deref() == Some(shared.token.as_str()) {
            return Ok(true);
        }

        debug!(key = %shared.key, "Lock no longer held, clearing local state");
        shared.stop_renewal();
        state.clear();
        Ok(false)
    }

    /// Remaining lease as reported by the store.
    pub async fn ttl(&self, ctx: &OpContext) -> Result<KeyTtl> {
        let shared = &self.shared;
        if !shared.state.lock().await.held {
            return Err(LatchkeyError::NotAcquired);
        }
        ctx.call("ttl", &shared.key, shared.store.ttl(&shared.key))
            .await
    }

    /// Current state of the auto-renew task.
    pub fn renewal_status(&self) -> RenewalStatus {
        self.shared.status.borrow().clone()
    }

    /// Watch auto-renew state changes, e.g. to abort work when renewal fails.
    pub fn subscribe_renewal(&self) -> watch::Receiver<RenewalStatus> {
        self.shared.status.subscribe()
    }

    /// Run `f` while holding this lock's resource.
    ///
    /// A fresh instance (same name, same lease) is used so this instance's
    /// state is never touched. The release is always attempted; its failure is
    /// logged and the result of `f` is returned.
    pub async fn mutex<F, Fut, T, E>(
        &self,
        ctx: &OpContext,
        options: LockOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LatchkeyError>,
    {
        let lock = DistributedLock::new(
            self.shared.store.clone(),
            &self.shared.name,
            self.shared.base_ttl,
            options,
        );
        lock.run_exclusive(ctx, f).await
    }

    /// Acquire with the instance's retry policy, run `f`, release.
    pub(crate) async fn run_exclusive<F, Fut, T, E>(
        self,
        ctx: &OpContext,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LatchkeyError>,
    {
        let retry = self.shared.retry;
        self.acquire_with_retry(ctx, retry.attempts, retry.delay)
            .await?;

        let guard = ReleaseGuard { lock: Some(self) };
        let result = f().await;
        guard.release().await;
        result
    }

    fn start_renewal(&self, ttl: Duration) {
        let Some(configured) = self.shared.auto_renew else {
            return;
        };
        let interval = renewal::effective_interval(configured, ttl);
        let handle = renewal::spawn(self.shared.clone(), interval);
        if let Some(previous) = self.shared.renewal.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.renewal.lock().take() {
            handle.abort();
        }
    }
}

/// Releases the lock when a run-under-lock section ends, including when the
/// section panics or its future is dropped.
struct ReleaseGuard {
    lock: Option<DistributedLock>,
}

impl ReleaseGuard {
    async fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            release_quietly(lock).await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_quietly(lock));
            }
            Err(_) => {
                warn!(key = %lock.key(), "No runtime to release lock, leaving it to expire");
            }
        }
    }
}

async fn release_quietly(lock: DistributedLock) {
    let ctx = OpContext::with_timeout(RELEASE_TIMEOUT);
    if let Err(e) = lock.release(&ctx).await {
        debug!(key = %lock.key(), error = %e, "Ignoring release failure after critical section");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn memory_store() -> (Arc<MemoryStore>, Arc<dyn KeyValueStore>) {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn KeyValueStore> = store.clone();
        (store, dyn_store)
    }

    fn new_lock(store: &Arc<dyn KeyValueStore>, name: &str, ttl: Duration) -> DistributedLock {
        DistributedLock::new(store.clone(), name, ttl, LockOptions::default())
    }

    #[test]
    fn test_lock_key_prefix() {
        assert_eq!(lock_key("register:alice"), "lock:register:alice");
    }

    #[test]
    fn test_options_ignore_empty_token() {
        assert!(LockOptions::new().with_token("").token.is_none());
        assert_eq!(
            LockOptions::new().with_token("abc").token.as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let lock = new_lock(&store, "resource", Duration::from_secs(5));

        assert!(lock.acquire(&ctx).await.unwrap());
        assert_eq!(
            raw.get("lock:resource").await.unwrap().as_deref(),
            Some(lock.token())
        );

        assert_ok!(lock.release(&ctx).await);
        assert!(raw.get("lock:resource").await.unwrap().is_none());
        assert!(!lock.is_locked(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_custom_token_is_stored() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let lock = DistributedLock::new(
            store,
            "custom",
            Duration::from_secs(5),
            LockOptions::new().with_token("worker-7"),
        );

        assert!(lock.acquire(&ctx).await.unwrap());
        assert_eq!(raw.get("lock:custom").await.unwrap().as_deref(), Some("worker-7"));
    }

    #[tokio::test]
    async fn test_second_instance_cannot_acquire() {
        let (_, store) = memory_store();
        let ctx = OpContext::background();
        let a = new_lock(&store, "shared", Duration::from_secs(5));
        let b = new_lock(&store, "shared", Duration::from_secs(5));

        assert!(a.acquire(&ctx).await.unwrap());
        assert!(!b.acquire(&ctx).await.unwrap());
        assert!(matches!(
            b.acquire_with_retry(&ctx, 2, Duration::from_millis(5)).await,
            Err(LatchkeyError::NotAcquired)
        ));
    }

    #[tokio::test]
    async fn test_reacquire_is_local_and_idempotent() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let lock = new_lock(&store, "idem", Duration::from_secs(5));

        assert!(lock.acquire(&ctx).await.unwrap());
        assert!(lock.acquire(&ctx).await.unwrap());
        assert_eq!(raw.calls("set_nx"), 1);
    }

    #[tokio::test]
    async fn test_ttl_self_cleanup() {
        let (_, store) = memory_store();
        let ctx = OpContext::background();
        let crashed = new_lock(&store, "lease", Duration::from_millis(100));
        let other = new_lock(&store, "lease", Duration::from_secs(5));

        assert!(crashed.acquire(&ctx).await.unwrap());
        assert!(!other.acquire(&ctx).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(other.acquire(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_lapsed_local_lease_goes_back_to_store() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let a = new_lock(&store, "lapse", Duration::from_millis(50));
        let b = new_lock(&store, "lapse", Duration::from_secs(5));

        assert!(a.acquire(&ctx).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(b.acquire(&ctx).await.unwrap());

        assert!(!a.acquire(&ctx).await.unwrap());
        assert_eq!(raw.get("lock:lapse").await.unwrap().as_deref(), Some(b.token()));
    }

    #[tokio::test]
    async fn test_lapsed_local_lease_with_own_key_stays_held() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let lock = new_lock(&store, "gap", Duration::from_secs(5));
        assert!(lock.acquire(&ctx).await.unwrap());

        // Local lease ends before the store's, as it does after a slow SET.
        lock.shared.state.lock().await.lease_deadline = Some(Instant::now());

        assert!(lock.acquire(&ctx).await.unwrap());
        assert_eq!(raw.calls("set_nx"), 2);
        assert_eq!(raw.calls("get"), 1);

        // Still held locally, so release really deletes the key.
        lock.release(&ctx).await.unwrap();
        assert!(raw.get("lock:gap").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_without_lease_gets_one_more_attempt() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let lock = new_lock(&store, "orphan", Duration::from_secs(5));

        // A previous holder left the key behind without an expiry.
        raw.set_nx("lock:orphan", "ghost", Duration::from_secs(60)).await.unwrap();
        assert!(raw.persist("lock:orphan"));

        assert!(!lock.acquire(&ctx).await.unwrap());
        assert_eq!(raw.calls("set_nx"), 3);
        assert_eq!(raw.calls("ttl"), 1);
    }

    #[tokio::test]
    async fn test_foreign_instance_cannot_release_or_renew() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let b = new_lock(&store, "owned", Duration::from_millis(50));
        let a = new_lock(&store, "owned", Duration::from_secs(5));

        // B's lease runs out and A takes over.
        assert!(b.acquire(&ctx).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(a.acquire(&ctx).await.unwrap());

        let err = assert_err!(b.renew(&ctx, Duration::from_secs(30)).await);
        assert!(matches!(err, LatchkeyError::NotOwned));
        let err = assert_err!(b.release(&ctx).await);
        assert!(matches!(err, LatchkeyError::NotOwned));

        assert_eq!(raw.get("lock:owned").await.unwrap().as_deref(), Some(a.token()));
        match raw.ttl("lock:owned").await.unwrap() {
            KeyTtl::Remaining(left) => assert!(left <= Duration::from_secs(5)),
            other => panic!("unexpected ttl {:?}", other),
        }

        assert!(!b.is_locked(&ctx).await.unwrap());
        assert!(a.is_locked(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_after_expiry_reports_expired() {
        let (_, store) = memory_store();
        let ctx = OpContext::background();
        let lock = new_lock(&store, "gone", Duration::from_millis(30));

        assert!(matches!(
            lock.renew(&ctx, Duration::from_secs(1)).await,
            Err(LatchkeyError::NotAcquired)
        ));

        assert!(lock.acquire(&ctx).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(
            lock.renew(&ctx, Duration::from_secs(1)).await,
            Err(LatchkeyError::Expired)
        ));
        // release of an expired lock is not an error
        assert_ok!(lock.release(&ctx).await);
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let (_, store) = memory_store();
        let ctx = OpContext::background();
        let lock = new_lock(&store, "extend", Duration::from_millis(80));
        let other = new_lock(&store, "extend", Duration::from_secs(5));

        assert!(lock.acquire(&ctx).await.unwrap());
        assert_ok!(lock.renew(&ctx, Duration::from_secs(5)).await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!other.acquire(&ctx).await.unwrap());
        assert!(matches!(lock.ttl(&ctx).await.unwrap(), KeyTtl::Remaining(_)));
    }

    #[tokio::test]
    async fn test_ttl_requires_holding() {
        let (_, store) = memory_store();
        let lock = new_lock(&store, "ttl", Duration::from_secs(1));
        assert!(matches!(
            lock.ttl(&OpContext::background()).await,
            Err(LatchkeyError::NotAcquired)
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_a_refusal() {
        let (raw, store) = memory_store();
        let lock = new_lock(&store, "down", Duration::from_secs(1));
        raw.set_available(false);

        match lock.acquire(&OpContext::background()).await {
            Err(LatchkeyError::Store { op, key, .. }) => {
                assert_eq!(op, "acquire");
                assert_eq!(key, "lock:down");
            }
            other => panic!("expected store error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_honours_cancellation_and_deadline() {
        let (_, store) = memory_store();
        let holder = new_lock(&store, "busy", Duration::from_secs(5));
        let waiter = new_lock(&store, "busy", Duration::from_secs(5));
        assert!(holder.acquire(&OpContext::background()).await.unwrap());

        let ctx = OpContext::with_timeout(Duration::from_millis(50));
        let err = waiter
            .acquire_with_retry(&ctx, 100, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LatchkeyError::DeadlineExceeded));

        let ctx = OpContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let err = waiter
            .acquire_with_retry(&ctx, 100, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LatchkeyError::Cancelled));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_across_instances() {
        let (_, store) = memory_store();
        let inside = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicU64::new(0));
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let lock = new_lock(&store, "critical", Duration::from_secs(5));
            let inside = inside.clone();
            let completed = completed.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = OpContext::background();
                lock.acquire_with_retry(&ctx, 1_000, Duration::from_millis(2))
                    .await
                    .unwrap();

                let overlapping = inside.fetch_add(1, Ordering::SeqCst);
                assert_eq!(overlapping, 0, "two holders inside the critical section");
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);

                lock.release(&ctx).await.unwrap();
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_auto_renew_keeps_lease_alive() {
        let (_, store) = memory_store();
        let ctx = OpContext::background();
        let lock = DistributedLock::new(
            store.clone(),
            "renewed",
            Duration::from_millis(150),
            LockOptions::new().with_auto_renew(Duration::from_millis(40)),
        );
        let other = new_lock(&store, "renewed", Duration::from_secs(5));

        assert_eq!(lock.renewal_status(), RenewalStatus::Idle);
        assert!(lock.acquire(&ctx).await.unwrap());

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(lock.is_locked(&ctx).await.unwrap());
        assert!(!other.acquire(&ctx).await.unwrap());
        assert!(matches!(
            lock.renewal_status(),
            RenewalStatus::Running { renewals } if renewals >= 3
        ));

        lock.release(&ctx).await.unwrap();
        assert_eq!(lock.renewal_status(), RenewalStatus::Stopped);
    }

    #[tokio::test]
    async fn test_auto_renew_failure_is_observable() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let lock = DistributedLock::new(
            store,
            "fragile",
            Duration::from_secs(5),
            LockOptions::new().with_auto_renew(Duration::from_millis(20)),
        );
        let mut status = lock.subscribe_renewal();

        assert!(lock.acquire(&ctx).await.unwrap());
        // Someone wipes the key behind our back.
        raw.del("lock:fragile").await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| matches!(s, RenewalStatus::Failed(_))),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            lock.renewal_status(),
            RenewalStatus::Failed(LatchkeyError::Expired.to_string())
        );
    }

    #[tokio::test]
    async fn test_mutex_releases_on_success_and_error() {
        let (raw, store) = memory_store();
        let ctx = OpContext::background();
        let template = new_lock(&store, "job", Duration::from_secs(5));

        let value = template
            .mutex(&ctx, LockOptions::default(), || async {
                Ok::<_, LatchkeyError>(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(raw.get("lock:job").await.unwrap().is_none());

        let err = template
            .mutex(&ctx, LockOptions::default(), || async {
                Err::<(), _>(LatchkeyError::Config("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LatchkeyError::Config(_)));
        assert!(raw.get("lock:job").await.unwrap().is_none());

        // A different caller gets in right away.
        let other = new_lock(&store, "job", Duration::from_secs(5));
        assert_ok!(
            other
                .mutex(&ctx, LockOptions::default(), || async { Ok::<_, LatchkeyError>(()) })
                .await
        );

        // The template instance itself was never touched.
        assert!(!template.is_locked(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_mutex_reports_contention() {
        let (_, store) = memory_store();
        let ctx = OpContext::background();
        let holder = new_lock(&store, "taken", Duration::from_secs(5));
        assert!(holder.acquire(&ctx).await.unwrap());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let err = holder
            .mutex(
                &ctx,
                LockOptions::new().with_retry(3, Duration::from_millis(5)),
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, LatchkeyError>(())
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LatchkeyError::NotAcquired));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mutex_releases_when_dropped_mid_section() {
        let (raw, store) = memory_store();
        let template = new_lock(&store, "dropped", Duration::from_secs(30));

        let ctx = OpContext::background();
        let section = template.mutex(&ctx, LockOptions::default(), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, LatchkeyError>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(50), section).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(raw.get("lock:dropped").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_scenario_runs_both_sections_in_turn() {
        let (_, store) = memory_store();
        let counter = Arc::new(AtomicU64::new(0));
        let windows = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();

        for _ in 0..2 {
            let template = new_lock(&store, "register:alice", Duration::from_secs(5));
            let counter = counter.clone();
            let windows = windows.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = OpContext::background();
                let result = template
                    .mutex(&ctx, LockOptions::default(), move || async move {
                        let start = Instant::now();
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        windows.lock().push((start, Instant::now()));
                        Ok::<_, LatchkeyError>(())
                    })
                    .await;
                result
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let mut windows = windows.lock().clone();
        windows.sort();
        assert!(windows[0].1 <= windows[1].0, "critical sections overlapped");
    }
}
