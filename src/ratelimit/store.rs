//! Storage port for rate limit records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::key::LimitKey;
use super::record::RateLimitRecord;
use crate::error::Result;

/// Trait for rate limit record stores.
///
/// This trait abstracts over the in-process `MemoryStore` and the shared
/// `RedisStore` so the limiter works the same against either. The limiter
/// relies on [`compare_and_swap`](RateLimitStore::compare_and_swap) being
/// atomic per key; operations on different keys must not block each other.
///
/// Storage failures are reported as `BouncerError::StorageUnavailable`.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Load the record for a key, if one exists.
    async fn get(&self, key: &LimitKey) -> Result<Option<RateLimitRecord>>;

    /// Replace the record for `key` with `new` only if the stored value
    /// currently equals `expected` (`None` meaning "absent").
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &LimitKey,
        expected: Option<&RateLimitRecord>,
        new: &RateLimitRecord,
    ) -> Result<bool>;

    /// Forget the record for a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &LimitKey) -> Result<()>;

    /// Drop every record that has expired at `now`, returning how many were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;
}
