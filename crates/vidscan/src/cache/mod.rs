//! Short-lived cache for progress snapshots and finished results.
//!
//! The cache is never authoritative: every miss falls back to the database.

use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;
use serde_json::Value;

use crate::config::CacheConfig;

pub fn progress_key(analysis_id: &str) -> String {
    format!("analysis:{}:progress", analysis_id)
}

pub fn result_key(analysis_id: &str) -> String {
    format!("analysis:{}:result", analysis_id)
}

/// Prefix covering every key of one analysis.
pub fn analysis_prefix(analysis_id: &str) -> String {
    format!("analysis:{}:", analysis_id)
}

pub trait ResultCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, ttl: Duration);

    fn delete(&self, key: &str);

    /// Removes every key starting with `prefix`, returning how many were removed.
    fn delete_prefix(&self, prefix: &str) -> usize;
}

#[derive(Clone)]
struct CachedValue {
    value: Value,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache with a TTL per entry.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Cache<String, CachedValue>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { inner }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_capacity)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).map(|cached| cached.value)
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.inner.insert(key.to_string(), CachedValue { value, ttl });
    }

    fn delete(&self, key: &str) {
        self.inner.invalidate(key);
    }

    fn delete_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .inner
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        for key in &keys {
            self.inner.invalidate(key);
        }
        keys.len()
    }
}
