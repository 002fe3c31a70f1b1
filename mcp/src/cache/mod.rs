//! Test result cache.
//!
//! Two tiers keyed by (component, test type):
//! - A memory tier checked first on every read
//! - A durable [`CacheStore`] tier that outlives the process
//!
//! Expiry is re-validated on every hit. Valid durable hits are promoted into
//! memory; expired durable records are deleted by the read that finds them.

pub mod store;
pub mod types;

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

pub use store::{CacheStore, FileCacheStore, MemoryCacheStore};
pub use types::{CacheKey, CachedTestResult, TestType};

use crate::{
    core::config::{ceil_secs, CacheConfig},
    error::McpResult,
};

pub struct TestResultCache {
    memory: DashMap<CacheKey, CachedTestResult>,
    durable: Arc<dyn CacheStore>,
    ttl_overrides: HashMap<TestType, u64>,
}

impl TestResultCache {
    pub fn new(durable: Arc<dyn CacheStore>) -> Self {
        Self {
            memory: DashMap::new(),
            durable,
            ttl_overrides: HashMap::new(),
        }
    }

    /// Cache whose durable tier is also in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    pub fn from_config(config: &CacheConfig) -> McpResult<Self> {
        let cache = match &config.directory {
            Some(dir) => Self::new(Arc::new(FileCacheStore::new(dir)?)),
            None => Self::in_memory(),
        };
        Ok(cache.with_default_ttls(config.ttl_overrides.clone()))
    }

    #[must_use]
    pub fn with_default_ttls(mut self, overrides: HashMap<TestType, u64>) -> Self {
        self.ttl_overrides.extend(overrides);
        self
    }

    /// TTL applied by `save` when the caller gives none.
    pub fn default_ttl(&self, test_type: TestType) -> Duration {
        self.ttl_overrides
            .get(&test_type)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| test_type.default_ttl())
    }

    /// Cached payload, if a valid record exists.
    pub fn get(
        &self,
        component_id: &str,
        test_type: TestType,
        ttl_override: Option<Duration>,
    ) -> McpResult<Option<serde_json::Value>> {
        Ok(self
            .get_record(component_id, test_type, ttl_override)?
            .map(|r| r.payload))
    }

    /// Full cached record, if valid. `ttl_override` replaces the stored TTL
    /// for this validity check.
    pub fn get_record(
        &self,
        component_id: &str,
        test_type: TestType,
        ttl_override: Option<Duration>,
    ) -> McpResult<Option<CachedTestResult>> {
        let key = CacheKey::new(component_id, test_type);
        let now = Utc::now();
        let expired = |record: &CachedTestResult| is_expired(record, ttl_override, now);

        if let Some(record) = self.memory.get(&key).map(|r| r.clone()) {
            if !expired(&record) {
                debug!(key = %key, "Cache hit (memory)");
                return Ok(Some(record));
            }
            self.memory.remove(&key);
        }

        match self.durable.load(&key)? {
            Some(record) if !expired(&record) => {
                debug!(key = %key, "Cache hit (durable), promoting");
                self.memory.insert(key, record.clone());
                Ok(Some(record))
            }
            Some(_) => {
                debug!(key = %key, "Cache entry expired, deleting");
                self.durable.delete(&key)?;
                Ok(None)
            }
            None => {
                debug!(key = %key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Store a verification outcome in both tiers, replacing any prior record.
    pub fn save(
        &self,
        component_id: &str,
        test_type: TestType,
        payload: serde_json::Value,
        ttl_override: Option<Duration>,
    ) -> McpResult<CachedTestResult> {
        let ttl = ttl_override.unwrap_or_else(|| self.default_ttl(test_type));
        let record = CachedTestResult::new(
            component_id,
            test_type,
            payload,
            ceil_secs(ttl),
            Utc::now(),
        );

        self.durable.store(&record)?;
        self.memory.insert(record.key(), record.clone());
        debug!(key = %record.key(), ttl_seconds = record.ttl_seconds, "Cached test result");
        Ok(record)
    }

    /// Remove one entry from both tiers. Returns true if either tier held it.
    pub fn invalidate(&self, component_id: &str, test_type: TestType) -> McpResult<bool> {
        let key = CacheKey::new(component_id, test_type);
        let in_memory = self.memory.remove(&key).is_some();
        let durable = self.durable.delete(&key)?;
        Ok(in_memory || durable)
    }

    /// Remove every expired entry from both tiers, along with durable records
    /// that can no longer be decoded. Returns the number of distinct entries
    /// removed.
    pub fn sweep_expired(&self) -> McpResult<usize> {
        let now = Utc::now();
        let mut removed = BTreeSet::new();

        self.memory.retain(|key, record| {
            if record.is_expired_at(now) {
                removed.insert(key.clone());
                false
            } else {
                true
            }
        });

        for record in self.durable.records()? {
            if record.is_expired_at(now) {
                let key = record.key();
                self.durable.delete(&key)?;
                removed.insert(key);
            }
        }
        let unreadable = self.durable.purge_unreadable()?;

        let count = removed.len() + unreadable;
        if count > 0 {
            debug!(expired = removed.len(), unreadable, "Swept cache entries");
        }
        Ok(count)
    }

    /// Entries currently held in the memory tier.
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }
}

fn is_expired(
    record: &CachedTestResult,
    ttl_override: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    match ttl_override {
        Some(ttl) => record.is_expired_with(ceil_secs(ttl), now),
        None => record.is_expired_at(now),
    }
}
