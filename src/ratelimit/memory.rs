//! In-process record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::key::LimitKey;
use super::record::RateLimitRecord;
use super::store::RateLimitStore;
use crate::error::Result;

/// Record store backed by a sharded concurrent map.
///
/// Each compare-and-swap holds the shard lock for its key only, which is
/// enough for single-instance deployments. Multiple instances need a shared
/// store such as `RedisStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<LimitKey, RateLimitRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &LimitKey) -> Result<Option<RateLimitRecord>> {
        Ok(self.records.get(key).map(|record| record.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &LimitKey,
        expected: Option<&RateLimitRecord>,
        new: &RateLimitRecord,
    ) -> Result<bool> {
        match (self.records.entry(key.clone()), expected) {
            (Entry::Occupied(mut entry), Some(expected)) if entry.get() == expected => {
                entry.insert(new.clone());
                Ok(true)
            }
            (Entry::Vacant(entry), None) => {
                entry.insert(new.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &LimitKey) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = !record.is_expired_at(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}
