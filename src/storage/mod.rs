//! Storage backends for the document engine.
//!
//! The document layer talks to storage only through [`StorageBackend`]: point reads, point
//! writes and optional point-in-time snapshots over string keys. Two implementations ship:
//!
//! 1. [`SledBackend`]: persistent, backed by sled. Sled has no read snapshots, so
//!    [`StorageBackend::snapshot`] fails with [`StorageError::Unsupported`].
//! 2. [`MemoryBackend`]: an in-memory ordered map with copy-on-write snapshots, used in tests
//!    and for scratch databases.
//!
//! No multi-key atomicity is assumed. Callers must tolerate a write that lands while a
//! later write in the same operation fails.

pub mod backend;
pub mod memory;

pub use backend::{BackendConfig, BackendError, BackendResult, SledBackend};
pub use memory::MemoryBackend;

use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Unknown snapshot: {0}")]
    UnknownSnapshot(u64),

    #[error("Storage failure: {0}")]
    Failure(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Opaque handle to a point-in-time view of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SnapshotHandle(pub(crate) u64);

impl SnapshotHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Narrow interface over an ordered key-value store.
pub trait StorageBackend: Send + Sync {
    /// Reads the current value of `key`.
    fn try_get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Writes `value` at `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Takes a point-in-time view. Backends without snapshots must refuse
    /// rather than hand out a view that can change underneath the reader.
    fn snapshot(&self) -> StorageResult<SnapshotHandle> {
        Err(StorageError::Unsupported("snapshot"))
    }

    /// Reads `key` as of `snapshot`.
    fn try_get_at(&self, snapshot: SnapshotHandle, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let _ = key;
        Err(StorageError::UnknownSnapshot(snapshot.id()))
    }

    /// Releases a snapshot taken with [`StorageBackend::snapshot`].
    fn release(&self, snapshot: SnapshotHandle) {
        let _ = snapshot;
    }

    /// Makes previous writes durable.
    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}
