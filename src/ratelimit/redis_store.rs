//! Redis-backed record store for multi-instance deployments.
//!
//! Records are stored as JSON strings with a TTL covering both the window and
//! any block, so Redis reclaims stale keys on its own. Compare-and-swap runs as
//! a Lua script, which Redis executes atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;

use super::key::LimitKey;
use super::record::RateLimitRecord;
use super::store::RateLimitStore;
use crate::error::{BouncerError, Result};

const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local expected = ARGV[1]

if expected == '' then
  if current then
    return 0
  end
elseif current ~= expected then
  return 0
end

redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
return 1
"#;

/// Redis implementation of the record store.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisStore {
    /// Creates a store with a configured Redis client and key prefix.
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    /// Creates a store from a connection URL such as `redis://127.0.0.1/`.
    pub fn open(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BouncerError::Config(format!("invalid redis url: {e}")))?;
        Ok(Self::new(client, key_prefix))
    }

    fn key_for(&self, key: &LimitKey) -> String {
        format!("{}:{}", self.key_prefix, key.to_string_key())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BouncerError::StorageUnavailable(format!("failed to connect to redis: {e}")))
    }
}

/// Seconds Redis should keep a record, never less than one.
fn ttl_secs(record: &RateLimitRecord, now: DateTime<Utc>) -> u64 {
    let millis = (record.expires_at() - now).num_milliseconds();
    if millis <= 0 {
        return 1;
    }
    (millis as u64).div_ceil(1000).max(1)
}

fn encode(record: &RateLimitRecord) -> Result<String> {
    serde_json::to_string(record)
        .map_err(|e| BouncerError::StorageUnavailable(format!("failed to encode record: {e}")))
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn get(&self, key: &LimitKey) -> Result<Option<RateLimitRecord>> {
        let mut connection = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key_for(key))
            .query_async(&mut connection)
            .await
            .map_err(|e| BouncerError::StorageUnavailable(format!("failed to read record: {e}")))?;

        // An unreadable record is a storage failure, not an absent one.
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| {
                BouncerError::StorageUnavailable(format!("corrupt record for {key}: {e}"))
            })
        })
        .transpose()
    }

    async fn compare_and_swap(
        &self,
        key: &LimitKey,
        expected: Option<&RateLimitRecord>,
        new: &RateLimitRecord,
    ) -> Result<bool> {
        let expected = expected.map(encode).transpose()?.unwrap_or_default();
        let new_raw = encode(new)?;
        let ttl = ttl_secs(new, Utc::now());

        let mut connection = self.connection().await?;
        let swapped: i64 = Script::new(COMPARE_AND_SWAP_SCRIPT)
            .key(self.key_for(key))
            .arg(expected)
            .arg(new_raw)
            .arg(ttl)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| BouncerError::StorageUnavailable(format!("failed to update record: {e}")))?;

        Ok(swapped == 1)
    }

    async fn delete(&self, key: &LimitKey) -> Result<()> {
        let mut connection = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.key_for(key))
            .query_async(&mut connection)
            .await
            .map_err(|e| BouncerError::StorageUnavailable(format!("failed to delete record: {e}")))?;
        Ok(())
    }

    async fn sweep(&self, _now: DateTime<Utc>) -> Result<usize> {
        // Keys expire through their TTL.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_key_prefixing() {
        let store = RedisStore::open("redis://127.0.0.1/", "bouncer:ratelimit").unwrap();
        let key = LimitKey::new("login", "a@b.com");
        assert_eq!(store.key_for(&key), "bouncer:ratelimit:login:a@b.com");
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = RedisStore::open("not a url", "prefix");
        assert!(matches!(result, Err(BouncerError::Config(_))));
    }

    #[test]
    fn test_ttl_covers_window() {
        let record = RateLimitRecord::new(t0(), 3600);
        assert_eq!(ttl_secs(&record, t0()), 3600);
        assert_eq!(ttl_secs(&record, t0() + Duration::milliseconds(1500)), 3599);
    }

    #[test]
    fn test_ttl_covers_extended_block() {
        let mut record = RateLimitRecord::new(t0(), 60);
        record.extend_block(t0() + Duration::seconds(50));
        assert_eq!(ttl_secs(&record, t0() + Duration::seconds(50)), 60);
    }

    #[test]
    fn test_ttl_never_zero() {
        let record = RateLimitRecord::new(t0(), 60);
        assert_eq!(ttl_secs(&record, t0() + Duration::seconds(600)), 1);
    }

    /// Needs a live server: `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_compare_and_swap_against_redis() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let prefix = format!("bouncer-test:{}", uuid::Uuid::new_v4());
        let store = RedisStore::open(&url, prefix).unwrap();
        let key = LimitKey::new("login", "10.0.0.1");
        let now = Utc::now();

        assert_eq!(store.get(&key).await.unwrap(), None);

        // Insert only succeeds while the key is absent
        let first = RateLimitRecord::new(now, 60);
        assert!(store.compare_and_swap(&key, None, &first).await.unwrap());
        assert!(!store.compare_and_swap(&key, None, &first).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(first.clone()));

        let mut second = first.clone();
        second.attempt_count += 1;
        assert!(store
            .compare_and_swap(&key, Some(&first), &second)
            .await
            .unwrap());

        // A stale expectation loses and leaves the stored record alone
        let mut stale = first.clone();
        stale.attempt_count += 5;
        assert!(!store
            .compare_and_swap(&key, Some(&first), &stale)
            .await
            .unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(second));

        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
        store.delete(&key).await.unwrap();
    }
}
