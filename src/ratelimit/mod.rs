//! Rate limiting logic and state management.

mod clock;
mod key;
mod limiter;
mod memory;
mod record;
mod redis_store;
mod rules;
mod store;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::LimitKey;
pub use limiter::{Allowance, FailureMode, LockoutPolicy, RateLimiter};
pub use memory::MemoryStore;
pub use record::{RateLimitRecord, RecordState, MAX_WINDOW_SECS};
pub use redis_store::RedisStore;
pub use rules::{LimitRule, RateLimitRules};
pub use store::RateLimitStore;
pub use sweeper::spawn_sweeper;
