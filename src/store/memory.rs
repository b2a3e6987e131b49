//! In-process store implementation.
//!
//! Mirrors the Redis semantics the core depends on (NX, lazy TTL expiry,
//! sorted sets) inside a single mutex. Every call is atomic with respect to the
//! others, which matches the per-key atomicity of the real store.
//!
//! ## Limitations
//! - Not distributed (single process only)
//! - Expired keys are reclaimed lazily, when touched

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{CompareOutcome, KeyTtl, KeyValueStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// member -> score
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    calls: HashMap<&'static str, usize>,
}

impl Inner {
    /// Count a command and purge `key` if it has expired.
    fn touch(&mut self, command: &'static str, key: &str) -> Option<&mut Entry> {
        *self.calls.entry(command).or_insert(0) += 1;
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            trace!(key = %key, "Purging expired key");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

/// Single-process key-value store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    failing: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// How many times a command has been issued (`"set_nx"`, `"get"`, ...).
    pub fn calls(&self, command: &str) -> usize {
        self.inner.lock().calls.get(command).copied().unwrap_or(0)
    }

    /// Drop the expiry of `key`, like `PERSIST`. Returns whether the key exists.
    pub fn persist(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.touch("persist", key) {
            Some(entry) => {
                entry.expires_at = None;
                true
            }
            None => false,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every call of `command` fail, leaving other commands working.
    pub fn fail_command(&self, command: &'static str) {
        self.failing.lock().insert(command);
    }

    fn check_available(&self, command: &'static str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        if self.failing.lock().contains(command) {
            return Err(StoreError::Unavailable(format!("{} is failing", command)));
        }
        Ok(())
    }
}

/// Expiry instant for `ttl`; a TTL beyond the clock's range never expires.
fn expiry(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::UnexpectedReply(format!("WRONGTYPE operation against key {}", key))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available("set_nx")?;
        let mut inner = self.inner.lock();
        if inner.touch("set_nx", key).is_some() {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available("get")?;
        let mut inner = self.inner.lock();
        match inner.touch("get", key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check_available("del")?;
        let mut inner = self.inner.lock();
        inner.touch("del", key);
        Ok(inner.entries.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available("expire")?;
        let mut inner = self.inner.lock();
        match inner.touch("expire", key) {
            Some(entry) => {
                entry.expires_at = expiry(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        self.check_available("ttl")?;
        let mut inner = self.inner.lock();
        Ok(match inner.touch("ttl", key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Remaining(at.saturating_duration_since(Instant::now())),
        })
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<CompareOutcome> {
        self.check_available("compare_and_delete")?;
        let mut inner = self.inner.lock();
        let outcome = match inner.touch("compare_and_delete", key) {
            None => CompareOutcome::Missing,
            Some(Entry {
                value: Value::Str(current),
                ..
            }) if current == token => CompareOutcome::Applied,
            Some(_) => CompareOutcome::Mismatch,
        };
        if outcome == CompareOutcome::Applied {
            inner.entries.remove(key);
        }
        Ok(outcome)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> StoreResult<CompareOutcome> {
        self.check_available("compare_and_expire")?;
        let mut inner = self.inner.lock();
        Ok(match inner.touch("compare_and_expire", key) {
            None => CompareOutcome::Missing,
            Some(entry) => match &entry.value {
                Value::Str(current) if current == token => {
                    entry.expires_at = expiry(ttl);
                    CompareOutcome::Applied
                }
                _ => CompareOutcome::Mismatch,
            },
        })
    }

    async fn record_request(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        cutoff_ms: i64,
        expire: Duration,
    ) -> StoreResult<u64> {
        self.check_available("record_request")?;
        let mut inner = self.inner.lock();
        if inner.touch("record_request", key).is_none() {
            inner.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::ZSet(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        let entry = inner
            .entries
            .get_mut(key)
            .ok_or_else(|| StoreError::UnexpectedReply(format!("window {} vanished", key)))?;
        let Value::ZSet(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        members.insert(member.to_string(), score_ms as f64);
        members.retain(|_, score| *score > cutoff_ms as f64);
        let count = members.len() as u64;
        entry.expires_at = expiry(expire);
        Ok(count)
    }

    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available("remove_member")?;
        let mut inner = self.inner.lock();
        match inner.touch("remove_member", key) {
            None => Ok(false),
            Some(Entry {
                value: Value::ZSet(members),
                ..
            }) => Ok(members.remove(member).is_some()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn member_count(&self, key: &str) -> StoreResult<u64> {
        self.check_available("member_count")?;
        let mut inner = self.inner.lock();
        match inner.touch("member_count", key) {
            None => Ok(0),
            Some(Entry {
                value: Value::ZSet(members),
                ..
            }) => Ok(members.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
