//! Per-key attempt record and its window arithmetic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Longest window a caller may request (one leap year).
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Observable state of a (identifier, action) pair at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// No record, or the previous window has fully elapsed
    Unseen,
    /// Within the window and under the threshold
    Counting,
    /// Threshold exceeded; attempts are rejected until the block lifts
    Blocked,
}

/// Attempt counter for a single (identifier, action) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Attempts recorded in the current window
    pub attempt_count: u32,
    /// When the current window began
    pub window_start: DateTime<Utc>,
    /// Window length in seconds, as supplied by the caller that opened it
    pub window_secs: u64,
    /// Attempts are rejected until this instant passes
    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitRecord {
    /// Open a fresh window at `now` with the first attempt already counted.
    pub fn new(now: DateTime<Utc>, window_secs: u64) -> Self {
        Self {
            attempt_count: 1,
            window_start: now,
            window_secs,
            blocked_until: None,
        }
    }

    /// Length of this record's window.
    pub fn window(&self) -> Duration {
        window_duration(self.window_secs)
    }

    /// The instant the current window closes.
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + self.window()
    }

    /// Whether attempts are rejected at `now`.
    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    /// Whether the record no longer carries any information at `now`.
    ///
    /// A record whose block outlives its window stays live until the block lifts.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end() && !self.is_blocked_at(now)
    }

    /// Classify the record at `now`.
    pub fn state_at(&self, now: DateTime<Utc>) -> RecordState {
        if self.is_blocked_at(now) {
            RecordState::Blocked
        } else if self.is_expired_at(now) {
            RecordState::Unseen
        } else {
            RecordState::Counting
        }
    }

    /// Mark the record blocked until its window closes.
    pub fn block_until_window_end(&mut self) {
        let end = self.window_end();
        self.blocked_until = Some(self.blocked_until.map_or(end, |until| until.max(end)));
    }

    /// Push the block out to a full window from `now`. Never shortens it.
    pub fn extend_block(&mut self, now: DateTime<Utc>) {
        let extended = now + self.window();
        self.blocked_until = Some(self.blocked_until.map_or(extended, |until| until.max(extended)));
    }

    /// The latest instant at which this record still matters.
    pub fn expires_at(&self) -> DateTime<Utc> {
        match self.blocked_until {
            Some(until) => until.max(self.window_end()),
            None => self.window_end(),
        }
    }

    /// Whole seconds until the block lifts, rounded up and never zero.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let until = self.blocked_until.unwrap_or_else(|| self.window_end());
        ceil_secs(until - now).max(1)
    }
}

/// Convert a window length to a chrono duration, clamped to [`MAX_WINDOW_SECS`].
pub(crate) fn window_duration(secs: u64) -> Duration {
    // Clamped value always fits in i64.
    Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    ((millis + 999) / 1000) as u64
}
