//! Fixed-window rate limit policy.
//!
//! The limiter holds no state of its own: every call maps the current
//! record and the current time to a decision and the record to write back.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::record::RateLimitRecord;

/// Default number of requests allowed per window.
pub const DEFAULT_LIMIT: u64 = 21;
/// Default window length in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Limit and window applied to every limited model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum requests allowed in one window
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

impl RateLimitPolicy {
    /// Create a policy allowing `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis() as u64,
        }
    }

    /// The window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Window length as signed milliseconds, for arithmetic against epoch timestamps.
    pub fn window_millis(&self) -> i64 {
        i64::try_from(self.window_ms).unwrap_or(i64::MAX)
    }

    /// Whole seconds until the window of `record` closes, rounded up.
    ///
    /// Clamped to zero when clock skew puts `now` past the window end.
    pub fn retry_after_secs(&self, record: &RateLimitRecord, now: i64) -> u64 {
        let reset_at = record.window_start.saturating_add(self.window_millis());
        let remaining_ms = reset_at.saturating_sub(now).max(0) as u64;
        remaining_ms.div_ceil(1000)
    }
}

/// Outcome of evaluating one request against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Record the store should hold after this request
    pub next: RateLimitRecord,
    /// Seconds until the window resets, set only on denial
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    /// A denial leaving `record` untouched.
    pub fn denied(record: RateLimitRecord, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            next: record,
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// An admission that leaves `next` in the store.
    pub fn allowed(next: RateLimitRecord) -> Self {
        Self {
            allowed: true,
            next,
            retry_after_secs: None,
        }
    }
}

/// Decide whether a request arriving at `now` is allowed.
///
/// An absent or expired record opens a new window; a record at the limit
/// is denied without being incremented.
pub fn decide(record: Option<&RateLimitRecord>, now: i64, policy: &RateLimitPolicy) -> Decision {
    let window_ms = policy.window_millis();

    match record {
        Some(record) if record.is_within_window(now, window_ms) => {
            if record.count >= policy.limit {
                Decision::denied(*record, policy.retry_after_secs(record, now))
            } else {
                Decision::allowed(RateLimitRecord {
                    count: record.count.saturating_add(1),
                    window_start: record.window_start,
                })
            }
        }
        _ => Decision::allowed(RateLimitRecord::fresh(now)),
    }
}
