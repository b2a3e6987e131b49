//! Key-value store abstraction used by the lock and the rate limiter.
//!
//! The trait exposes exactly the primitives the core relies on: atomic
//! set-if-absent with expiry, plain reads and deletes, expiry inspection,
//! compare-and-mutate scripts for ownership checks, and one atomic pipeline for
//! the sliding window.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors raised while talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected reply from store: {0}")]
    UnexpectedReply(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Remaining lifetime of a key.
///
/// Mirrors the three distinct answers of `TTL`/`PTTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// No such key.
    Missing,
    /// Key exists without an expiry.
    Persistent,
    /// Key exists and expires after the given duration.
    Remaining(Duration),
}

impl KeyTtl {
    /// Decode a `PTTL` reply.
    pub fn from_pttl(reply: i64) -> Self {
        match reply {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Remaining(Duration::from_millis(ms.max(0) as u64)),
        }
    }
}

/// Result of an atomic compare-and-mutate on a lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOutcome {
    /// The token matched and the mutation was applied.
    Applied,
    /// The key does not exist.
    Missing,
    /// The key holds a different token; nothing was changed.
    Mismatch,
}

impl CompareOutcome {
    /// Decode the integer reply of the compare scripts.
    pub fn from_reply(reply: i64) -> StoreResult<Self> {
        match reply {
            1 => Ok(CompareOutcome::Applied),
            0 => Ok(CompareOutcome::Mismatch),
            -1 => Ok(CompareOutcome::Missing),
            other => Err(StoreError::UnexpectedReply(format!(
                "compare script returned {}",
                other
            ))),
        }
    }
}

/// The store operations needed by locks and rate limiters.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key` to `value` with `ttl` only if the key is absent.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete `key`, returning whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Set the expiry of an existing key, returning whether it existed.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Delete `key` only if it currently holds `token`, atomically.
    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<CompareOutcome>;

    /// Extend `key` to `ttl` only if it currently holds `token`, atomically.
    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> StoreResult<CompareOutcome>;

    /// Record a request marker in a sorted-set window, atomically.
    ///
    /// Adds `member` with `score_ms`, drops members scored at or below
    /// `cutoff_ms`, refreshes the key expiry to `expire` and returns the
    /// resulting member count.
    async fn record_request(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        cutoff_ms: i64,
        expire: Duration,
    ) -> StoreResult<u64>;

    /// Remove a single sorted-set member, returning whether it was present.
    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Number of members in a sorted set (zero when absent).
    async fn member_count(&self, key: &str) -> StoreResult<u64>;
}

/// Build the store described by the configuration.
pub async fn connect(config: &StoreConfig) -> StoreResult<Arc<dyn KeyValueStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-process memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            info!(host = %config.host, port = config.port, db = config.db, "Connecting to Redis");
            let store = RedisStore::connect(&config.url()).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Milliseconds for PX/PEXPIRE arguments, never zero and never past `i64::MAX`.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, i64::MAX as u64)
}
