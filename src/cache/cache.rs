//! Typed get/set over the Redis pool.
//!
//! Every write carries a TTL. A zero TTL is refused before reaching Redis so
//! no entry can outlive its owner's expectations.

use super::error::{CacheError, CacheResult};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

#[cfg(feature = "cache")]
use super::RedisPool;
#[cfg(feature = "cache")]
use redis::AsyncCommands;
#[cfg(feature = "cache")]
use tracing::debug;

#[async_trait]
pub trait Cache<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> CacheResult<Option<T>>;

    async fn set(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<bool>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;
}

/// Rejects writes that would never expire.
pub fn ensure_ttl(key: &str, ttl: Duration) -> CacheResult<u64> {
    let millis = ttl.as_millis();
    if millis == 0 {
        return Err(CacheError::TtlError(format!(
            "refusing to write {} without a positive TTL",
            key
        )));
    }
    Ok(u64::try_from(millis).unwrap_or(u64::MAX))
}

#[cfg(feature = "cache")]
#[derive(Clone)]
pub struct RedisCache {
    pool: RedisPool,
}

#[cfg(feature = "cache")]
impl RedisCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    pub async fn get_connection(
        &self,
    ) -> CacheResult<bb8::PooledConnection<'_, bb8_redis::RedisConnectionManager>> {
        Ok(self.pool.get().await?)
    }

    /// `SET key value NX PX ttl`. Returns `true` when this call created the key.
    pub async fn set_if_absent<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<bool> {
        let millis = ensure_ttl(key, ttl)?;
        let payload = serde_json::to_string(value)?;
        let mut conn = self.get_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Atomic GET + DEL.
    pub async fn take<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let mut conn = self.get_connection().await?;
        let (raw, _deleted): (Option<String>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .del(key)
            .query_async(&mut *conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete every key matching a glob, walking the keyspace with SCAN.
    pub async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        if pattern.trim().is_empty() || pattern == "*" {
            return Err(CacheError::KeyError(format!(
                "pattern '{}' is too broad",
                pattern
            )));
        }

        let mut conn = self.get_connection().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            if !keys.is_empty() {
                let count: u64 = conn.del(&keys).await?;
                removed += count;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed, "cache pattern invalidated");
        Ok(removed)
    }

    /// Atomic `INCR` + `EXPIRE`. Window keys are per-minute, so pushing the
    /// expiry forward on each hit never outlives the window by more than `ttl`.
    pub async fn increment_window(&self, key: &str, ttl: Duration) -> CacheResult<u64> {
        let secs = ensure_ttl(key, ttl)?.div_ceil(1000);
        let mut conn = self.get_connection().await?;
        let (count, _): (u64, bool) = redis::pipe()
            .atomic()
            .incr(key, 1_u64)
            .expire(key, secs as i64)
            .query_async(&mut *conn)
            .await?;
        Ok(count)
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl<T> Cache<T> for RedisCache
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> CacheResult<Option<T>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        let millis = ensure_ttl(key, ttl)?;
        let payload = serde_json::to_string(value)?;
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("PX")
            .arg(millis)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        Ok(conn.exists(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_is_rejected() {
        let err = ensure_ttl("v1:payment:x", Duration::ZERO).unwrap_err();
        assert!(matches!(err, CacheError::TtlError(_)));
    }

    #[test]
    fn sub_second_ttl_is_kept_in_millis() {
        assert_eq!(ensure_ttl("k", Duration::from_millis(250)).unwrap(), 250);
        assert_eq!(ensure_ttl("k", Duration::from_secs(5)).unwrap(), 5000);
    }
}
