//! Store doubles for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MemoryStore, RateLimitStore, StoreError};
use crate::ratelimit::{Decision, RateLimitPolicy, RateLimitRecord};

/// A memory store that counts every call made to it.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    gets: AtomicUsize,
    puts: AtomicUsize,
    hits: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Total calls of any kind.
    pub fn calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst) + self.puts.load(Ordering::SeqCst) + self.hits()
    }
}

#[async_trait]
impl RateLimitStore for RecordingStore {
    fn backend(&self) -> &'static str {
        "recording"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, record: RateLimitRecord) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, record).await
    }

    async fn hit(
        &self,
        key: &str,
        now: i64,
        policy: &RateLimitPolicy,
    ) -> Result<Decision, StoreError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.inner.hit(key, now, policy).await
    }

    async fn purge_expired(&self, now: i64, window: Duration) -> Result<u64, StoreError> {
        self.inner.purge_expired(now, window).await
    }
}

/// A store relying on the default `hit`, with injectable read and write failures.
pub struct FailingStore {
    fail_reads: bool,
    fail_writes: bool,
    records: Mutex<HashMap<String, RateLimitRecord>>,
    puts: AtomicUsize,
}

impl FailingStore {
    pub fn new(fail_reads: bool, fail_writes: bool) -> Self {
        Self {
            fail_reads,
            fail_writes,
            records: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
        }
    }

    /// Attempted writes, failed or not.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateLimitStore for FailingStore {
    fn backend(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        if self.fail_reads {
            return Err(StoreError::Backend("injected read failure".to_string()));
        }
        Ok(self.records.lock().get(key).copied())
    }

    async fn put(&self, key: &str, record: RateLimitRecord) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        self.records.lock().insert(key.to_string(), record);
        Ok(())
    }

    async fn purge_expired(&self, _now: i64, _window: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Backend("injected purge failure".to_string()))
    }
}

/// A store whose atomic `hit` always errors.
pub struct BrokenStore;

#[async_trait]
impl RateLimitStore for BrokenStore {
    fn backend(&self) -> &'static str {
        "broken"
    }

    async fn get(&self, _key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        Err(StoreError::Backend("store down".to_string()))
    }

    async fn put(&self, _key: &str, _record: RateLimitRecord) -> Result<(), StoreError> {
        Err(StoreError::Backend("store down".to_string()))
    }

    async fn hit(
        &self,
        _key: &str,
        _now: i64,
        _policy: &RateLimitPolicy,
    ) -> Result<Decision, StoreError> {
        Err(StoreError::Backend("store down".to_string()))
    }

    async fn purge_expired(&self, _now: i64, _window: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Backend("store down".to_string()))
    }
}
