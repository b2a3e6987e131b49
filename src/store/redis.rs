//! Redis-backed store.
//!
//! Uses a `ConnectionManager` (multiplexed, reconnecting) that is cheap to
//! clone per call. Ownership checks run as Lua scripts so the compare and the
//! mutation happen in one server-side step.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use super::{ttl_millis, CompareOutcome, KeyTtl, KeyValueStore, StoreResult};

/// Returns 1 when deleted, 0 on token mismatch, -1 when the key is absent.
const COMPARE_AND_DELETE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
if current ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Returns 1 when extended, 0 on token mismatch, -1 when the key is absent.
const COMPARE_AND_EXPIRE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
if current ~= ARGV[1] then
    return 0
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

/// Redis store.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    release_script: Script,
    extend_script: Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// Example URLs:
    /// - `redis://127.0.0.1:6379/0`
    /// - `redis://:password@host:6379/2`
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        debug!("Redis connection manager ready");
        Ok(Self::from_manager(manager))
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            release_script: Script::new(COMPARE_AND_DELETE),
            extend_script: Script::new(COMPARE_AND_EXPIRE),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut conn = self.conn();
        let reply: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(KeyTtl::from_pttl(reply))
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<CompareOutcome> {
        let mut conn = self.conn();
        let reply: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        CompareOutcome::from_reply(reply)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> StoreResult<CompareOutcome> {
        let mut conn = self.conn();
        let reply: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        CompareOutcome::from_reply(reply)
    }

    async fn record_request(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        cutoff_ms: i64,
        expire: Duration,
    ) -> StoreResult<u64> {
        let mut conn = self.conn();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(score_ms)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(expire))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn member_count(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }
}
