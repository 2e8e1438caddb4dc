//! Persistence for per-client rate limit records.
//!
//! Two backends implement [`RateLimitStore`]: an in-process map used when
//! no durable store is configured, and a libSQL backend reached over its
//! HTTP pipeline API. The gate only ever talks to the trait.

mod libsql;
mod memory;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::ratelimit::{decide, Clock, Decision, RateLimitPolicy, RateLimitRecord};

pub use libsql::LibsqlStore;
pub use memory::MemoryStore;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The HTTP request to the store failed
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The store answered with a non-success status
    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The store rejected the statement
    #[error("statement failed: {0}")]
    Backend(String),

    /// The store's response did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Storage for rate limit records, keyed by the rendered [`crate::ratelimit::RateLimitKey`].
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Short backend name for logs and the health endpoint.
    fn backend(&self) -> &'static str;

    /// Most recently written record for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError>;

    /// Replace whatever record `key` holds.
    async fn put(&self, key: &str, record: RateLimitRecord) -> Result<(), StoreError>;

    /// Count one request against `key` and return the decision.
    ///
    /// The default composes `get`, [`decide`] and `put`. A failed read is
    /// treated as "no record" and a failed write is accepted as best effort,
    /// so it only errors if a backend overrides it. Backends that can do the
    /// compare-window-and-increment atomically should override this.
    async fn hit(
        &self,
        key: &str,
        now: i64,
        policy: &RateLimitPolicy,
    ) -> Result<Decision, StoreError> {
        let current = match self.get(key).await {
            Ok(record) => record,
            Err(e) => {
                error!(
                    key = %key,
                    backend = self.backend(),
                    error = %e,
                    "Error fetching rate limit record"
                );
                None
            }
        };

        let decision = decide(current.as_ref(), now, policy);

        if decision.allowed {
            if let Err(e) = self.put(key, decision.next).await {
                error!(
                    key = %key,
                    backend = self.backend(),
                    error = %e,
                    "Error updating rate limit record"
                );
            }
        }

        Ok(decision)
    }

    /// Delete every record whose window closed before `now`.
    ///
    /// Returns the number of records removed.
    async fn purge_expired(&self, now: i64, window: Duration) -> Result<u64, StoreError>;
}

/// Build the store selected by configuration.
///
/// The durable backend is used only when both a URL and an auth token are
/// present; anything less falls back to the in-process map.
pub async fn build_store(config: &StoreConfig) -> Arc<dyn RateLimitStore> {
    let url = config.url.as_deref().filter(|s| !s.is_empty());
    let token = config.auth_token.as_deref().filter(|s| !s.is_empty());

    match (url, token) {
        (Some(url), Some(token)) => {
            let store = match LibsqlStore::new(url, token, &config.table, config.timeout()) {
                Ok(store) => store,
                Err(e) => {
                    error!(error = %e, "Failed to build libSQL client, using in-memory store");
                    return Arc::new(MemoryStore::new());
                }
            };
            if let Err(e) = store.ensure_schema().await {
                error!(error = %e, table = %config.table, "Failed to create rate limit table");
            }
            info!(backend = store.backend(), table = %config.table, "Rate limit store initialized");
            Arc::new(store)
        }
        (None, None) => {
            info!(
                backend = "memory",
                "No durable store configured, using in-memory rate limit store"
            );
            Arc::new(MemoryStore::new())
        }
        _ => {
            warn!(
                "Durable store needs both a URL and an auth token, using in-memory rate limit store"
            );
            Arc::new(MemoryStore::new())
        }
    }
}

/// Periodically purge expired records.
pub fn spawn_sweeper(
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // the first tick completes immediately
        interval.tick().await;

        info!(
            interval_secs = every.as_secs(),
            backend = store.backend(),
            "Rate limit sweeper started"
        );

        loop {
            interval.tick().await;
            match store.purge_expired(clock.now_millis(), window).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "Purged expired rate limit records"),
                Err(e) => error!(
                    error = %e,
                    backend = store.backend(),
                    "Failed to purge expired rate limit records"
                ),
            }
        }
    })
}
