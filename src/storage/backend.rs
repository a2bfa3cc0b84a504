//! Sled-backed persistent storage backend.
//!
//! All keys live in a single sled tree. The key layout itself (namespaces, separators) is
//! the document layer's business; this module only moves bytes.
//!
//! Sled keeps its own page cache and flushes dirty pages on a timer, both of which are
//! configurable here. A temporary backend is removed from disk when it is dropped.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::{StorageBackend, StorageResult};

/// Name of the sled tree holding every key.
const DOCUMENTS_TREE: &str = "sofa";

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Maximum page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often sled flushes dirty pages to disk.
    pub flush_interval_ms: u64,

    /// Compress stored pages. Requires the `compression` feature.
    pub compression: bool,

    /// Delete the store when the backend is dropped.
    pub temporary: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            compression: false,
            temporary: false,
        }
    }
}

/// The persistent storage backend using sled.
pub struct SledBackend {
    db: sled::Db,

    tree: sled::Tree,
}

impl SledBackend {
    /// Opens (or creates) the store described by `config`.
    pub fn new(config: BackendConfig) -> BackendResult<Arc<Self>> {
        debug!("Initializing storage backend at {:?}", config.data_dir);

        if config.cache_size_mb == 0 {
            return Err(BackendError::ConfigError(
                "cache size must be at least 1MB".to_string(),
            ));
        }
        if config.compression && !cfg!(feature = "compression") {
            return Err(BackendError::ConfigError(
                "compression requested but the `compression` feature is disabled".to_string(),
            ));
        }

        if !config.temporary {
            std::fs::create_dir_all(&config.data_dir)?;
        }

        let mut sled_config = sled::Config::new()
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(Some(config.flush_interval_ms))
            .use_compression(config.compression)
            .temporary(config.temporary);
        if !config.temporary {
            sled_config = sled_config.path(&config.data_dir);
        }

        let db = sled_config.open().map_err(|e| {
            BackendError::ConfigError(format!("Failed to open sled database: {}", e))
        })?;
        let tree = db.open_tree(DOCUMENTS_TREE)?;

        info!(
            "Storage backend initialized with cache_size={}MB, flush_interval={}ms, temporary={}",
            config.cache_size_mb, config.flush_interval_ms, config.temporary
        );

        Ok(Arc::new(Self { db, tree }))
    }

    /// Retrieves a value by key.
    pub fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    /// Stores a key-value pair.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> BackendResult<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    /// Scans all keys with a given prefix. A `limit` of 0 returns everything.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> BackendResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut results = Vec::new();

        for item in self.tree.scan_prefix(prefix) {
            let (k, v) = item?;
            results.push((k.to_vec(), v.to_vec()));

            if limit > 0 && results.len() >= limit {
                break;
            }
        }

        Ok(results)
    }

    /// Visits every key-value pair in key order.
    pub fn iter_all(
        &self,
        mut visit: impl FnMut(&[u8], &[u8]),
    ) -> BackendResult<usize> {
        let mut count = 0;
        for item in self.tree.iter() {
            let (k, v) = item?;
            visit(&k, &v);
            count += 1;
        }
        Ok(count)
    }

    /// Flushes all pending writes to disk.
    pub fn flush_sync(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl StorageBackend for SledBackend {
    fn try_get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        Ok(self.insert(key.as_bytes(), value)?)
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(self.flush_sync()?)
    }
}
