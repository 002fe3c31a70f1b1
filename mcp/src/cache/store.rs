//! Durable storage tiers for cached verification results.

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::types::{CacheKey, CachedTestResult};
use crate::error::{McpError, McpResult};

/// Durable tier behind the in-memory cache.
///
/// Implementations are synchronous; cache lookups never suspend.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> McpResult<Option<CachedTestResult>>;

    /// Replace whatever is stored under the record's key.
    fn store(&self, record: &CachedTestResult) -> McpResult<()>;

    /// Returns true if a record was removed.
    fn delete(&self, key: &CacheKey) -> McpResult<bool>;

    /// Every readable stored record, in no particular order.
    fn records(&self) -> McpResult<Vec<CachedTestResult>>;

    /// Remove stored records that can no longer be decoded. Returns how many
    /// were removed.
    fn purge_unreadable(&self) -> McpResult<usize> {
        Ok(0)
    }
}

/// Records kept in a map; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    records: RwLock<HashMap<CacheKey, CachedTestResult>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, key: &CacheKey) -> McpResult<Option<CachedTestResult>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn store(&self, record: &CachedTestResult) -> McpResult<()> {
        self.records.write().insert(record.key(), record.clone());
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> McpResult<bool> {
        Ok(self.records.write().remove(key).is_some())
    }

    fn records(&self) -> McpResult<Vec<CachedTestResult>> {
        Ok(self.records.read().values().cloned().collect())
    }
}

type Decoded = Result<CachedTestResult, serde_json::Error>;

/// One JSON file per record, named by a blake3 hash of the key.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    directory: PathBuf,
}

impl FileCacheStore {
    /// Open (creating if needed) a cache directory.
    pub fn new(directory: impl Into<PathBuf>) -> McpResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| {
            McpError::Cache(format!(
                "create cache directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the file holding `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.component_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(key.test_type.as_str().as_bytes());
        self.directory
            .join(format!("{}.json", hasher.finalize().to_hex()))
    }

    fn read_record(path: &Path) -> McpResult<Option<Decoded>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn record_paths(&self) -> McpResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn remove_unreadable(path: &Path, error: &serde_json::Error) -> McpResult<bool> {
        warn!(path = %path.display(), error = %error, "Removing unreadable cache record");
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl CacheStore for FileCacheStore {
    /// An undecodable record is removed and reported as a miss.
    fn load(&self, key: &CacheKey) -> McpResult<Option<CachedTestResult>> {
        let path = self.path_for(key);
        match Self::read_record(&path)? {
            Some(Ok(record)) => {
                // Guard against hash collisions and hand-edited files
                Ok(Some(record).filter(|r| &r.key() == key))
            }
            Some(Err(e)) => {
                Self::remove_unreadable(&path, &e)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn store(&self, record: &CachedTestResult) -> McpResult<()> {
        let path = self.path_for(&record.key());
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> McpResult<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn records(&self) -> McpResult<Vec<CachedTestResult>> {
        let mut records = Vec::new();
        for path in self.record_paths()? {
            match Self::read_record(&path) {
                Ok(Some(Ok(record))) => records.push(record),
                Ok(None) => {}
                Ok(Some(Err(e))) => {
                    debug!(
                        path = %path.display(),
                        error = %e,
                        "Skipping undecodable cache record"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache record");
                }
            }
        }
        Ok(records)
    }

    fn purge_unreadable(&self) -> McpResult<usize> {
        let mut removed = 0;
        for path in self.record_paths()? {
            if let Some(Err(e)) = Self::read_record(&path)? {
                if Self::remove_unreadable(&path, &e)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
