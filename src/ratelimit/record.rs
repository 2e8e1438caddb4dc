//! Per-client rate limit records and their storage keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The state of one client's fixed window.
///
/// `count` is only ever incremented while the window is open; an expired
/// window is replaced by a fresh record, never bumped in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Requests observed in the current window
    pub count: u64,
    /// Window start, milliseconds since the Unix epoch
    pub window_start: i64,
}

impl RateLimitRecord {
    /// A record opening a new window at `now` with one request counted.
    pub fn fresh(now: i64) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    /// Whether the window that started at `window_start` is still open at `now`.
    pub fn is_within_window(&self, now: i64, window_ms: i64) -> bool {
        now.saturating_sub(self.window_start) < window_ms
    }
}

/// How records are keyed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// One record per client IP, shared by every limited model
    #[default]
    Ip,
    /// One record per (client IP, model) pair
    IpAndModel,
}

/// The key a record is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Client IP as reported by the forwarded-for header
    pub ip: String,
    /// Model alias, present only for [`KeyScope::IpAndModel`]
    pub model: Option<String>,
}

impl RateLimitKey {
    /// Build a key for `ip` and `model` under the given scope.
    pub fn new(scope: KeyScope, ip: &str, model: &str) -> Self {
        let model = match scope {
            KeyScope::Ip => None,
            KeyScope::IpAndModel => Some(model.to_string()),
        };
        Self {
            ip: ip.to_string(),
            model,
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{}|{}", self.ip, model),
            None => f.write_str(&self.ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_boundary_is_exclusive() {
        let record = RateLimitRecord {
            count: 3,
            window_start: 1_000,
        };
        assert!(record.is_within_window(60_999, 60_000));
        assert!(!record.is_within_window(61_000, 60_000));
    }

    #[test]
    fn test_ip_scope_ignores_model() {
        let a = RateLimitKey::new(KeyScope::Ip, "1.2.3.4", "NPT 1.5");
        let b = RateLimitKey::new(KeyScope::Ip, "1.2.3.4", "Other Model");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "1.2.3.4");
    }

    #[test]
    fn test_ip_and_model_scope_separates_models() {
        let key = RateLimitKey::new(KeyScope::IpAndModel, "1.2.3.4", "NPT 1.5");
        assert_eq!(key.to_string(), "1.2.3.4|NPT 1.5");
    }
}
