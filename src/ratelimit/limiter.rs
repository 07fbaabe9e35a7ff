//! Core rate limiter implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::key::LimitKey;
use super::memory::MemoryStore;
use super::record::{RateLimitRecord, RecordState, MAX_WINDOW_SECS};
use super::store::RateLimitStore;
use crate::error::{BouncerError, Result};

/// Optimistic update attempts before giving up on a contended key.
const MAX_CAS_RETRIES: usize = 32;

/// What the limiter does when its store cannot be read or written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Reject the attempt with `StorageUnavailable`
    #[default]
    Closed,
    /// Permit the attempt and log a warning
    Open,
}

/// Whether attempts made while blocked push the block further out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockoutPolicy {
    /// The block lifts when the window that triggered it closes
    #[default]
    Fixed,
    /// Every attempt or failure while blocked restarts a full window of lockout
    Extending,
}

/// A permitted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allowance {
    /// Attempts left in the current window before the threshold is reached
    pub remaining: u32,
}

/// Outcome of one optimistic pass over a key.
enum Step {
    Allowed(u32),
    Denied(u64),
    Contended,
}

/// The rate limiter that tracks attempts per (identifier, action).
///
/// This struct is thread-safe and can be shared across multiple tasks. All
/// state lives in the injected [`RateLimitStore`]; the limiter itself only
/// holds policy.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
    lockout_policy: LockoutPolicy,
}

impl RateLimiter {
    /// Create a rate limiter over the given store with default policy.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            failure_mode: FailureMode::default(),
            lockout_policy: LockoutPolicy::default(),
        }
    }

    /// Create a rate limiter over a fresh in-process store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the storage failure policy.
    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    /// Set the lockout extension policy.
    pub fn with_lockout_policy(mut self, lockout_policy: LockoutPolicy) -> Self {
        self.lockout_policy = lockout_policy;
        self
    }

    /// The configured storage failure policy.
    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// The configured lockout extension policy.
    pub fn lockout_policy(&self) -> LockoutPolicy {
        self.lockout_policy
    }

    /// Count an attempt for `(identifier, action)` and decide whether it may proceed.
    ///
    /// The first attempt, or the first after the window has elapsed, opens a
    /// new window. An attempt that pushes the count past `max_attempts` blocks
    /// the key until the window closes and fails with `RateLimitExceeded`;
    /// attempts made while blocked are rejected without being counted.
    pub async fn check_and_increment(
        &self,
        identifier: &str,
        action: &str,
        max_attempts: u32,
        window_secs: u64,
    ) -> Result<Allowance> {
        validate_key(identifier, action)?;
        validate_limit(max_attempts, window_secs)?;

        let key = LimitKey::new(action, identifier);

        trace!(
            key = %key,
            max_attempts = max_attempts,
            window_secs = window_secs,
            "Checking rate limit"
        );

        let step = match self.try_increment(&key, max_attempts, window_secs).await {
            Ok(step) => step,
            Err(BouncerError::StorageUnavailable(reason))
                if self.failure_mode == FailureMode::Open =>
            {
                warn!(
                    key = %key,
                    reason = %reason,
                    "Rate limit store unavailable, permitting attempt"
                );
                return Ok(Allowance {
                    remaining: max_attempts.saturating_sub(1),
                });
            }
            Err(e) => return Err(e),
        };

        match step {
            Step::Allowed(remaining) => Ok(Allowance { remaining }),
            Step::Denied(retry_after_secs) => {
                debug!(
                    key = %key,
                    retry_after_secs = retry_after_secs,
                    "Rate limit exceeded"
                );
                Err(BouncerError::RateLimitExceeded { retry_after_secs })
            }
            // Contention is never a reason to let an attempt through.
            Step::Contended => Err(BouncerError::StorageUnavailable(format!(
                "gave up on {key} after {MAX_CAS_RETRIES} concurrent updates"
            ))),
        }
    }

    /// Forget everything recorded for `(identifier, action)`.
    ///
    /// Called after a verified-good attempt so a legitimate user is not
    /// penalized for earlier mistakes. Idempotent.
    pub async fn record_success(&self, identifier: &str, action: &str) -> Result<()> {
        validate_key(identifier, action)?;
        let key = LimitKey::new(action, identifier);

        match self.store.delete(&key).await {
            Ok(()) => {
                debug!(key = %key, "Cleared rate limit record");
                Ok(())
            }
            Err(e) => self.absorb_storage_error(&key, e),
        }
    }

    /// Note a rejected attempt for `(identifier, action)`.
    ///
    /// The attempt was already counted by [`check_and_increment`](Self::check_and_increment),
    /// so the count is left alone. Under [`LockoutPolicy::Extending`] a key
    /// that is already blocked has its block pushed a full window out.
    pub async fn record_failure(&self, identifier: &str, action: &str) -> Result<()> {
        validate_key(identifier, action)?;
        let key = LimitKey::new(action, identifier);

        debug!(key = %key, "Failed attempt recorded");

        if self.lockout_policy != LockoutPolicy::Extending {
            return Ok(());
        }

        match self.try_extend_block(&key).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BouncerError::StorageUnavailable(format!(
                "gave up extending block on {key} after {MAX_CAS_RETRIES} concurrent updates"
            ))),
            Err(e) => self.absorb_storage_error(&key, e),
        }
    }

    /// Current state of `(identifier, action)` without counting an attempt.
    pub async fn state(&self, identifier: &str, action: &str) -> Result<RecordState> {
        validate_key(identifier, action)?;
        let key = LimitKey::new(action, identifier);
        let now = self.clock.now();

        Ok(self
            .store
            .get(&key)
            .await?
            .map_or(RecordState::Unseen, |record| record.state_at(now)))
    }

    /// Attempts counted in the live window, or 0 if the key is unseen.
    pub async fn attempt_count(&self, identifier: &str, action: &str) -> Result<u32> {
        validate_key(identifier, action)?;
        let key = LimitKey::new(action, identifier);
        let now = self.clock.now();

        Ok(self
            .store
            .get(&key)
            .await?
            .filter(|record| !record.is_expired_at(now))
            .map_or(0, |record| record.attempt_count))
    }

    /// Remove expired records from the store.
    pub async fn sweep(&self) -> Result<usize> {
        self.store.sweep(self.clock.now()).await
    }

    async fn try_increment(
        &self,
        key: &LimitKey,
        max_attempts: u32,
        window_secs: u64,
    ) -> Result<Step> {
        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();
            let current = self.store.get(key).await?;

            let (next, step) = advance(
                current.as_ref(),
                now,
                max_attempts,
                window_secs,
                self.lockout_policy,
            );

            let Some(next) = next else {
                return Ok(step);
            };

            if next.attempt_count == 1 {
                debug!(key = %key, window_secs = window_secs, "Opening rate limit window");
            }

            if self
                .store
                .compare_and_swap(key, current.as_ref(), &next)
                .await?
            {
                return Ok(step);
            }

            trace!(key = %key, "Concurrent update, retrying");
        }

        Ok(Step::Contended)
    }

    /// Returns `false` only when every retry lost a race.
    async fn try_extend_block(&self, key: &LimitKey) -> Result<bool> {
        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();
            let Some(current) = self.store.get(key).await? else {
                return Ok(true);
            };
            if !current.is_blocked_at(now) {
                return Ok(true);
            }

            let mut next = current.clone();
            next.extend_block(now);
            if next == current {
                return Ok(true);
            }

            if self
                .store
                .compare_and_swap(key, Some(&current), &next)
                .await?
            {
                debug!(key = %key, blocked_until = %next.expires_at(), "Extended lockout");
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn absorb_storage_error(&self, key: &LimitKey, error: BouncerError) -> Result<()> {
        match error {
            BouncerError::StorageUnavailable(reason) if self.failure_mode == FailureMode::Open => {
                warn!(key = %key, reason = %reason, "Rate limit store unavailable, skipping update");
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Compute the next record and verdict for one attempt.
///
/// A `None` record means nothing needs to be written.
fn advance(
    current: Option<&RateLimitRecord>,
    now: DateTime<Utc>,
    max_attempts: u32,
    window_secs: u64,
    policy: LockoutPolicy,
) -> (Option<RateLimitRecord>, Step) {
    match current {
        Some(record) if record.is_blocked_at(now) => match policy {
            LockoutPolicy::Fixed => (None, Step::Denied(record.retry_after_secs(now))),
            LockoutPolicy::Extending => {
                let mut next = record.clone();
                next.extend_block(now);
                let retry_after = next.retry_after_secs(now);
                (Some(next), Step::Denied(retry_after))
            }
        },
        Some(record) if !record.is_expired_at(now) => {
            let mut next = record.clone();
            next.attempt_count = next.attempt_count.saturating_add(1);

            if next.attempt_count > max_attempts {
                next.attempt_count = max_attempts.saturating_add(1);
                next.block_until_window_end();
                let retry_after = next.retry_after_secs(now);
                (Some(next), Step::Denied(retry_after))
            } else {
                let remaining = max_attempts - next.attempt_count;
                (Some(next), Step::Allowed(remaining))
            }
        }
        _ => (
            Some(RateLimitRecord::new(now, window_secs)),
            Step::Allowed(max_attempts - 1),
        ),
    }
}

fn validate_key(identifier: &str, action: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(BouncerError::InvalidArgument(
            "identifier must not be empty".to_string(),
        ));
    }
    if action.trim().is_empty() {
        return Err(BouncerError::InvalidArgument(
            "action must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_limit(max_attempts: u32, window_secs: u64) -> Result<()> {
    if max_attempts == 0 {
        return Err(BouncerError::InvalidArgument(
            "max_attempts must be greater than zero".to_string(),
        ));
    }
    if window_secs == 0 || window_secs > MAX_WINDOW_SECS {
        return Err(BouncerError::InvalidArgument(format!(
            "window_secs must be between 1 and {MAX_WINDOW_SECS}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::time::Duration;

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn test_limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::in_memory().with_clock(clock)
    }

    fn retry_after(result: Result<Allowance>) -> u64 {
        match result {
            Err(BouncerError::RateLimitExceeded { retry_after_secs }) => retry_after_secs,
            other => panic!("expected RateLimitExceeded, got {:?}", other),
        }
    }

    /// A store whose every operation fails.
    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn get(&self, _key: &LimitKey) -> Result<Option<RateLimitRecord>> {
            Err(BouncerError::StorageUnavailable("disk on fire".to_string()))
        }

        async fn compare_and_swap(
            &self,
            _key: &LimitKey,
            _expected: Option<&RateLimitRecord>,
            _new: &RateLimitRecord,
        ) -> Result<bool> {
            Err(BouncerError::StorageUnavailable("disk on fire".to_string()))
        }

        async fn delete(&self, _key: &LimitKey) -> Result<()> {
            Err(BouncerError::StorageUnavailable("disk on fire".to_string()))
        }

        async fn sweep(&self, _now: DateTime<Utc>) -> Result<usize> {
            Err(BouncerError::StorageUnavailable("disk on fire".to_string()))
        }
    }

    /// A store that never wins a compare-and-swap.
    struct AlwaysContendedStore;

    #[async_trait]
    impl RateLimitStore for AlwaysContendedStore {
        async fn get(&self, _key: &LimitKey) -> Result<Option<RateLimitRecord>> {
            Ok(None)
        }

        async fn compare_and_swap(
            &self,
            _key: &LimitKey,
            _expected: Option<&RateLimitRecord>,
            _new: &RateLimitRecord,
        ) -> Result<bool> {
            Ok(false)
        }

        async fn delete(&self, _key: &LimitKey) -> Result<()> {
            Ok(())
        }

        async fn sweep(&self, _now: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_remaining_counts_down_then_denies() {
        let clock = test_clock();
        let limiter = test_limiter(clock);

        for expected in [4, 3, 2, 1, 0] {
            let allowance = limiter
                .check_and_increment("1.2.3.4", "login", 5, 3600)
                .await
                .unwrap();
            assert_eq!(allowance.remaining, expected);
        }

        let result = limiter.check_and_increment("1.2.3.4", "login", 5, 3600).await;
        assert_eq!(retry_after(result), 3600);
    }

    #[tokio::test]
    async fn test_threshold_enforced_for_every_call_past_limit() {
        let limiter = test_limiter(test_clock());

        for i in 1..=10 {
            let result = limiter.check_and_increment("id", "login", 3, 60).await;
            if i <= 3 {
                assert!(result.is_ok(), "attempt {} should be allowed", i);
            } else {
                assert!(
                    matches!(result, Err(BouncerError::RateLimitExceeded { .. })),
                    "attempt {} should be denied",
                    i
                );
            }
        }
    }

    #[tokio::test]
    async fn test_blocked_attempts_are_not_counted() {
        let limiter = test_limiter(test_clock());

        for _ in 0..8 {
            let _ = limiter.check_and_increment("id", "login", 2, 60).await;
        }

        // Count stops at the first value over the threshold
        assert_eq!(limiter.attempt_count("id", "login").await.unwrap(), 3);
        assert_eq!(
            limiter.state("id", "login").await.unwrap(),
            RecordState::Blocked
        );
    }

    #[tokio::test]
    async fn test_window_reset_after_denial() {
        let clock = test_clock();
        let limiter = test_limiter(clock.clone());

        for _ in 0..3 {
            let _ = limiter.check_and_increment("id", "login", 2, 60).await;
        }
        clock.advance(Duration::from_secs(30));
        assert_eq!(
            retry_after(limiter.check_and_increment("id", "login", 2, 60).await),
            30
        );

        clock.advance(Duration::from_secs(30));
        let allowance = limiter
            .check_and_increment("id", "login", 2, 60)
            .await
            .unwrap();
        assert_eq!(allowance.remaining, 1);
        assert_eq!(limiter.attempt_count("id", "login").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_reset_without_block() {
        let clock = test_clock();
        let limiter = test_limiter(clock.clone());

        limiter.check_and_increment("id", "login", 5, 60).await.unwrap();
        limiter.check_and_increment("id", "login", 5, 60).await.unwrap();
        clock.advance(Duration::from_secs(60));

        assert_eq!(limiter.state("id", "login").await.unwrap(), RecordState::Unseen);
        limiter.check_and_increment("id", "login", 5, 60).await.unwrap();
        assert_eq!(limiter.attempt_count("id", "login").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let limiter = test_limiter(test_clock());

        for _ in 0..3 {
            let _ = limiter.check_and_increment("a", "login", 2, 60).await;
        }

        assert!(limiter.check_and_increment("b", "login", 2, 60).await.is_ok());
        assert_eq!(limiter.attempt_count("b", "login").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_actions_are_independent() {
        let limiter = test_limiter(test_clock());

        for _ in 0..3 {
            let _ = limiter.check_and_increment("a", "login", 2, 60).await;
        }

        assert!(limiter.check_and_increment("a", "register", 2, 60).await.is_ok());
        assert_eq!(limiter.attempt_count("a", "register").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_success_clears_state() {
        let limiter = test_limiter(test_clock());

        for _ in 0..4 {
            limiter.check_and_increment("a@b.com", "login", 5, 3600).await.unwrap();
        }
        limiter.record_success("a@b.com", "login").await.unwrap();

        assert_eq!(
            limiter.state("a@b.com", "login").await.unwrap(),
            RecordState::Unseen
        );
        let allowance = limiter
            .check_and_increment("a@b.com", "login", 5, 3600)
            .await
            .unwrap();
        assert_eq!(allowance.remaining, 4);
        assert_eq!(limiter.attempt_count("a@b.com", "login").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_success_on_unseen_key_is_noop() {
        let limiter = test_limiter(test_clock());
        limiter.record_success("nobody", "login").await.unwrap();
        limiter.record_success("nobody", "login").await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_does_not_change_count() {
        let limiter = test_limiter(test_clock());

        limiter.check_and_increment("id", "login", 5, 60).await.unwrap();
        limiter.record_failure("id", "login").await.unwrap();
        limiter.record_failure("id", "login").await.unwrap();

        assert_eq!(limiter.attempt_count("id", "login").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fixed_policy_does_not_extend_block() {
        let clock = test_clock();
        let limiter = test_limiter(clock.clone());

        for _ in 0..3 {
            let _ = limiter.check_and_increment("id", "login", 2, 60).await;
        }
        clock.advance(Duration::from_secs(50));
        let _ = limiter.check_and_increment("id", "login", 2, 60).await;
        limiter.record_failure("id", "login").await.unwrap();

        clock.advance(Duration::from_secs(10));
        assert!(limiter.check_and_increment("id", "login", 2, 60).await.is_ok());
    }

    #[tokio::test]
    async fn test_extending_policy_pushes_block_out() {
        let clock = test_clock();
        let limiter = test_limiter(clock.clone()).with_lockout_policy(LockoutPolicy::Extending);

        for _ in 0..3 {
            let _ = limiter.check_and_increment("id", "login", 2, 60).await;
        }

        clock.advance(Duration::from_secs(50));
        // Attempt while blocked restarts a full window of lockout
        assert_eq!(
            retry_after(limiter.check_and_increment("id", "login", 2, 60).await),
            60
        );

        clock.advance(Duration::from_secs(20));
        assert_eq!(limiter.state("id", "login").await.unwrap(), RecordState::Blocked);

        clock.advance(Duration::from_secs(40));
        assert!(limiter.check_and_increment("id", "login", 2, 60).await.is_ok());
    }

    #[tokio::test]
    async fn test_extending_policy_failure_extends_block() {
        let clock = test_clock();
        let limiter = test_limiter(clock.clone()).with_lockout_policy(LockoutPolicy::Extending);

        for _ in 0..3 {
            let _ = limiter.check_and_increment("id", "login", 2, 60).await;
        }
        clock.advance(Duration::from_secs(30));
        limiter.record_failure("id", "login").await.unwrap();

        clock.advance(Duration::from_secs(45));
        assert_eq!(limiter.state("id", "login").await.unwrap(), RecordState::Blocked);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let limiter = test_limiter(test_clock());

        for result in [
            limiter.check_and_increment("", "login", 5, 60).await,
            limiter.check_and_increment("id", "  ", 5, 60).await,
            limiter.check_and_increment("id", "login", 0, 60).await,
            limiter.check_and_increment("id", "login", 5, 0).await,
        ] {
            assert!(matches!(result, Err(BouncerError::InvalidArgument(_))));
        }
        assert!(matches!(
            limiter.record_success("", "login").await,
            Err(BouncerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_failure_fails_closed_by_default() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore));

        let result = limiter.check_and_increment("id", "login", 5, 60).await;
        assert!(matches!(result, Err(BouncerError::StorageUnavailable(_))));
        assert!(limiter.record_success("id", "login").await.is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_fails_open_when_configured() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore)).with_failure_mode(FailureMode::Open);

        let allowance = limiter.check_and_increment("id", "login", 5, 60).await.unwrap();
        assert_eq!(allowance.remaining, 4);
        assert!(limiter.record_success("id", "login").await.is_ok());
    }

    #[tokio::test]
    async fn test_contention_fails_closed_even_when_open() {
        let limiter =
            RateLimiter::new(Arc::new(AlwaysContendedStore)).with_failure_mode(FailureMode::Open);

        let result = limiter.check_and_increment("id", "login", 5, 60).await;
        assert!(matches!(result, Err(BouncerError::StorageUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attempts_are_counted_exactly() {
        let limiter = Arc::new(RateLimiter::in_memory());
        let max_attempts = 7;
        let total = 50;

        let handles: Vec<_> = (0..total)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check_and_increment("10.0.0.1", "login", max_attempts, 3600)
                        .await
                })
            })
            .collect();

        let mut allowed = 0;
        let mut denied = 0;
        for result in futures::future::join_all(handles).await {
            match result.unwrap() {
                Ok(_) => allowed += 1,
                Err(BouncerError::RateLimitExceeded { .. }) => denied += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(allowed, max_attempts as usize);
        assert_eq!(denied, total - max_attempts as usize);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_keys() {
        let clock = test_clock();
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone()).with_clock(clock.clone());

        limiter.check_and_increment("a", "login", 5, 60).await.unwrap();
        limiter.check_and_increment("b", "login", 5, 600).await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.sweep().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
