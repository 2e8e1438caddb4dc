//! In-process rate limit store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{RateLimitStore, StoreError};
use crate::ratelimit::{decide, Decision, RateLimitPolicy, RateLimitRecord};

/// Records held in a concurrent map for the lifetime of the process.
///
/// `hit` runs under the map's entry lock for the key, so concurrent
/// requests from one client never lose an increment.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, RateLimitRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
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
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| *r))
    }

    async fn put(&self, key: &str, record: RateLimitRecord) -> Result<(), StoreError> {
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn hit(
        &self,
        key: &str,
        now: i64,
        policy: &RateLimitPolicy,
    ) -> Result<Decision, StoreError> {
        let decision = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let decision = decide(Some(entry.get()), now, policy);
                if decision.allowed {
                    entry.insert(decision.next);
                }
                decision
            }
            Entry::Vacant(entry) => {
                let decision = decide(None, now, policy);
                entry.insert(decision.next);
                decision
            }
        };

        trace!(
            key = %key,
            count = decision.next.count,
            allowed = decision.allowed,
            "Memory store hit"
        );
        Ok(decision)
    }

    async fn purge_expired(&self, now: i64, window: Duration) -> Result<u64, StoreError> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let before = self.records.len();
        self.records
            .retain(|_, record| record.is_within_window(now, window_ms));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
