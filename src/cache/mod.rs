//! Local cache adapter contract and implementations.
//!
//! A cache lets a session hydrate its projection before the first snapshot
//! arrives and persists every accepted snapshot. The contract is two calls:
//! [`CacheAdapter::load`] and [`CacheAdapter::save`]. Callers in the sync path
//! treat any failure as a miss.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Cache failures.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// A stored module image.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CachedModule {
    /// ModuleState-shaped payload.
    pub data: Value,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// Options for [`CacheAdapter::save`].
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub metadata: Map<String, Value>,
    /// Merge `metadata` into the stored metadata instead of replacing it.
    pub merge_metadata: bool,
}

/// Durable per-module store.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    async fn load(&self, module_id: &str) -> Result<Option<CachedModule>, CacheError>;

    async fn save(&self, module_id: &str, data: Value, options: SaveOptions) -> Result<(), CacheError>;
}

fn apply_metadata(previous: Option<Map<String, Value>>, options: SaveOptions) -> Map<String, Value> {
    match previous {
        Some(mut meta) if options.merge_metadata => {
            meta.extend(options.metadata);
            meta
        }
        _ => options.metadata,
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Process-local cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CachedModule>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn load(&self, module_id: &str) -> Result<Option<CachedModule>, CacheError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(module_id)
            .cloned())
    }

    async fn save(&self, module_id: &str, data: Value, options: SaveOptions) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let previous = entries.remove(module_id).map(|entry| entry.meta);
        let meta = apply_metadata(previous, options);
        entries.insert(module_id.to_string(), CachedModule { data, meta });
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

/// One JSON document per module under a directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Every byte outside `[A-Za-z0-9-]` is written as `%XX`, so distinct
    /// module ids never share a file.
    fn path_for(&self, module_id: &str) -> PathBuf {
        let mut name = String::with_capacity(module_id.len());
        for byte in module_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("%{byte:02X}"));
            }
        }
        self.dir.join(format!("{name}.json"))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<CachedModule>, CacheError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CacheAdapter for FileCache {
    async fn load(&self, module_id: &str) -> Result<Option<CachedModule>, CacheError> {
        self.read_entry(&self.path_for(module_id)).await
    }

    async fn save(&self, module_id: &str, data: Value, options: SaveOptions) -> Result<(), CacheError> {
        let path = self.path_for(module_id);
        let previous = if options.merge_metadata {
            // A corrupt previous entry is overwritten.
            self.read_entry(&path).await.ok().flatten().map(|entry| entry.meta)
        } else {
            None
        };
        let entry = CachedModule {
            data,
            meta: apply_metadata(previous, options),
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(module_id = %module_id, path = %path.display(), "Cache entry written");
        Ok(())
    }
}
