//! In-memory storage backend with point-in-time snapshots.
//!
//! The live map sits behind an `Arc`. Writers clone-on-write only while a snapshot shares
//! the current version, so a snapshot is a pointer copy and never observes later writes.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{SnapshotHandle, StorageBackend, StorageError, StorageResult};

type Map = BTreeMap<String, Vec<u8>>;

/// Ordered in-memory key-value store.
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<Arc<Map>>,

    snapshots: Mutex<HashMap<u64, Arc<Map>>>,

    next_snapshot: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Number of snapshots not yet released.
    pub fn open_snapshots(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Removes a key. Used to simulate pruning of revision bodies.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        let mut data = self.data.write();
        Arc::make_mut(&mut *data).remove(key)
    }

    /// All keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl StorageBackend for MemoryBackend {
    fn try_get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        Arc::make_mut(&mut *data).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn snapshot(&self) -> StorageResult<SnapshotHandle> {
        let view = self.data.read().clone();
        let id = self.next_snapshot.fetch_add(1, Ordering::SeqCst) + 1;
        self.snapshots.lock().insert(id, view);
        debug!("Took memory snapshot {}", id);
        Ok(SnapshotHandle(id))
    }

    fn try_get_at(&self, snapshot: SnapshotHandle, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let snapshots = self.snapshots.lock();
        let view = snapshots
            .get(&snapshot.id())
            .ok_or(StorageError::UnknownSnapshot(snapshot.id()))?;
        Ok(view.get(key).cloned())
    }

    fn release(&self, snapshot: SnapshotHandle) {
        if self.snapshots.lock().remove(&snapshot.id()).is_some() {
            debug!("Released memory snapshot {}", snapshot.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty());

        backend.put("k", b"v1").unwrap();
        assert_eq!(backend.try_get("k").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(backend.try_get("other").unwrap(), None);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_snapshot_isolation() {
        let backend = MemoryBackend::new();
        backend.put("k", b"old").unwrap();

        let snap = backend.snapshot().unwrap();
        backend.put("k", b"new").unwrap();
        backend.put("added", b"x").unwrap();
        backend.remove("k");

        assert_eq!(backend.try_get_at(snap, "k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(backend.try_get_at(snap, "added").unwrap(), None);
        assert_eq!(backend.try_get("k").unwrap(), None);

        backend.release(snap);
        assert_eq!(backend.open_snapshots(), 0);
        assert!(matches!(
            backend.try_get_at(snap, "k"),
            Err(StorageError::UnknownSnapshot(_))
        ));
    }

    #[test]
    fn test_keys_with_prefix() {
        let backend = MemoryBackend::new();
        backend.put("a/1", b"").unwrap();
        backend.put("a/2", b"").unwrap();
        backend.put("b/1", b"").unwrap();

        assert_eq!(backend.keys_with_prefix("a/"), vec!["a/1", "a/2"]);
        assert!(backend.keys_with_prefix("c/").is_empty());
    }
}
