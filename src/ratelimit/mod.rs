//! Rate limiting policy and record types.

mod clock;
mod limiter;
mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{decide, Decision, RateLimitPolicy, DEFAULT_LIMIT, DEFAULT_WINDOW_MS};
pub use record::{KeyScope, RateLimitKey, RateLimitRecord};
