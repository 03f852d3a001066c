//! Shared K/V Adapter.
//!
//! The operation set consumed by the rest of the server (metadata cache,
//! permanent-I/O snapshot, daily command counters), backed by Redis the way
//! the original server's `store` package wraps `github.com/redis/go-redis`.
//! Only the operations actually used are exposed — this is an adapter, not
//! a general Redis client wrapper.

use std::collections::HashMap;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::Result;

/// 48 hours, the TTL applied to a daily command counter on its first
/// increment of the day.
const DAILY_COUNTER_TTL_SECS: i64 = 48 * 60 * 60;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Reads a string key. Returns `""` when absent, matching the
    /// original's `GetStringSafe` "safe" (never-erroring-to-caller) shape.
    async fn get_string(&self, key: &str) -> String;

    /// Writes a string key. `ttl_secs = 0` means no expiry.
    async fn set_string(&self, key: &str, value: &str, ttl_secs: i64) -> Result<()>;

    /// Sets one field of a hash to an unsigned integer.
    async fn hash_set(&self, key: &str, field: &str, value: u64) -> Result<()>;

    /// Reads every field of a hash.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>>;

    /// Reads several string keys at once; absent keys are omitted from the
    /// result rather than represented as an error or a null entry.
    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, i64>>;

    /// Atomically increments today's counter for `(imei, command)`, setting
    /// a 48-hour TTL on the key's first increment of the day. Returns
    /// `(allowed, value)` where `allowed = value <= max`.
    async fn incr_daily_counter(&self, imei: &str, command: &str, max: u64) -> Result<(bool, u64)>;
}

/// Builds the daily counter key for `(imei, command)`, namespaced by the
/// current UTC calendar day.
fn daily_counter_key(imei: &str, command: &str) -> String {
    let day = Utc::now().format("%Y%m%d");
    format!("dev:{imei}:cmd:{command}:{day}")
}

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{addr}"))?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisStore { conn })
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn get_string(&self, key: &str) -> String {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    async fn set_string(&self, key: &str, value: &str, ttl_secs: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        if ttl_secs > 0 {
            let _: () = conn.set_ex(key, value, ttl_secs as u64).await?;
        } else {
            let _: () = conn.set(key, value).await?;
        }
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, u64> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<i64>> = conn.mget(keys).await?;
        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (k.clone(), v)))
            .collect())
    }

    async fn incr_daily_counter(&self, imei: &str, command: &str, max: u64) -> Result<(bool, u64)> {
        let key = daily_counter_key(imei, command);
        let mut conn = self.conn.clone();
        let value: u64 = conn.incr(&key, 1u64).await?;
        if value == 1 {
            // Best-effort: a failed TTL set doesn't fail the increment.
            let _: std::result::Result<(), redis::RedisError> =
                conn.expire(&key, DAILY_COUNTER_TTL_SECS).await;
        }
        Ok((value <= max, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_counter_key_is_namespaced_by_imei_and_day() {
        let key = daily_counter_key("356307042441013", "getver");
        assert!(key.starts_with("dev:356307042441013:cmd:getver:"));
        assert_eq!(key.len(), "dev:356307042441013:cmd:getver:".len() + 8);
    }
}
