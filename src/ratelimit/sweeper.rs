//! Background reclamation of expired records.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::limiter::RateLimiter;

/// Spawn a task that sweeps expired records every `interval`.
///
/// Sweeping only removes records that are already expired, and the store's
/// per-key atomicity covers removals, so in-flight checks are unaffected.
/// Abort the returned handle to stop the task.
pub fn spawn_sweeper(limiter: Arc<RateLimiter>, interval: Duration) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Starting rate limit sweeper");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match limiter.sweep().await {
                Ok(0) => trace!("Rate limit sweep found nothing to remove"),
                Ok(removed) => debug!(removed = removed, "Swept expired rate limit records"),
                Err(e) => warn!(error = %e, "Rate limit sweep failed"),
            }
        }
    })
}
