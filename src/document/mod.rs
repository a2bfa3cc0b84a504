//! Document store: the put/get protocol over revision logs and immutable bodies.
//!
//! Each document owns two kinds of records:
//! - the revision log at `path(id)`, rewritten as a whole on every update
//! - one body per revision at `path(id) + revision`, written once and never changed
//!
//! Writers use optimistic concurrency. A `put` names the revision it was based on; if the
//! log's winner moved on, the write is refused with [`PutCode::Conflict`] unless the caller
//! asked for a merge, in which case both branches are kept and
//! [`crate::revision::conflict`] picks the winner.
//!
//! The load-check-write sequence of a `put` is serialized per `(database, id)` through one
//! process-wide set of lock stripes, so any two stores for the same database exclude each
//! other. Reads take no document locks: bodies are immutable, so a stale log at worst yields
//! an older revision.

pub mod path;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

use crate::codec::{self, CodecError};
use crate::revision::{self, RevisionError, RevisionId, RevisionLog};
use crate::storage::{SnapshotHandle, StorageBackend, StorageError, StorageResult};

/// Number of lock stripes guarding concurrent writers.
const LOCK_STRIPES: usize = 256;

static WRITE_LOCKS: LazyLock<WriteLocks> = LazyLock::new(|| WriteLocks::new(LOCK_STRIPES));

/// Striped writer locks keyed by `(database, id)`.
struct WriteLocks {
    stripes: Box<[Mutex<()>]>,
}

impl WriteLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, db_name: &str, id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        (db_name, id).hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }
}

/// Document operation errors.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Invalid document id: {0:?}")]
    InvalidId(String),

    #[error("Database {0} is closed")]
    Closed(String),

    #[error("Revision error: {0}")]
    Revision(#[from] RevisionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Outcome code of a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutCode {
    Ok,
    /// The expected revision is not the current winner and no merge was requested
    Conflict,
}

/// Result of a write.
#[derive(Clone, Debug)]
pub struct PutResult {
    pub code: PutCode,

    /// The new revision; `None` when the write was refused
    pub assigned_rev: Option<RevisionId>,

    /// The log as written, or as found when the write was refused
    pub rev_log: RevisionLog,
}

impl PutResult {
    pub fn is_ok(&self) -> bool {
        self.code == PutCode::Ok
    }

    pub fn is_conflict(&self) -> bool {
        self.code == PutCode::Conflict
    }
}

/// Which parts of a document a read should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetOptions {
    pub body: bool,
    pub rev_info: bool,
    pub log: bool,
}

impl GetOptions {
    pub fn all() -> Self {
        Self {
            body: true,
            rev_info: true,
            log: true,
        }
    }

    pub fn log_only() -> Self {
        Self {
            body: false,
            rev_info: false,
            log: true,
        }
    }
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            body: true,
            rev_info: false,
            log: false,
        }
    }
}

/// Metadata of one stored revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionInfo {
    pub id: String,
    pub rev: RevisionId,
    pub deleted: bool,
    pub previous_rev: RevisionId,
}

/// The parts of a document a read asked for.
#[derive(Clone, Debug, Default)]
pub struct GetResult {
    pub content: Option<Value>,
    pub rev_info: Option<RevisionInfo>,
    pub rev_log: Option<RevisionLog>,
}

impl GetResult {
    /// True if the returned revision is a tombstone. Requires `rev_info`.
    pub fn is_deleted(&self) -> bool {
        self.rev_info.as_ref().map_or(false, |info| info.deleted)
    }
}

/// Outcome of a read.
#[derive(Clone, Debug)]
pub enum Lookup {
    Found(GetResult),

    /// The document has never been written
    NotFound,

    /// The log names this revision but its body is gone
    Pruned(RevisionId),
}

impl Lookup {
    pub fn found(self) -> Option<GetResult> {
        match self {
            Lookup::Found(res) => Some(res),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// Reads through a snapshot when the backend has one, released on drop.
struct SnapshotReader<'a, S: StorageBackend + ?Sized> {
    storage: &'a S,
    snapshot: Option<SnapshotHandle>,
}

impl<'a, S: StorageBackend + ?Sized> SnapshotReader<'a, S> {
    fn open(storage: &'a S) -> StorageResult<Self> {
        let snapshot = match storage.snapshot() {
            Ok(handle) => Some(handle),
            Err(StorageError::Unsupported(_)) => {
                debug!("Backend has no snapshots, reading without isolation");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(Self { storage, snapshot })
    }

    fn try_get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.snapshot {
            Some(handle) => self.storage.try_get_at(handle, key),
            None => self.storage.try_get(key),
        }
    }
}

impl<S: StorageBackend + ?Sized> Drop for SnapshotReader<'_, S> {
    fn drop(&mut self) {
        if let Some(handle) = self.snapshot.take() {
            self.storage.release(handle);
        }
    }
}

/// The documents of one database.
///
/// Holds only the database name and its key prefix; all durable state lives in the backend
/// passed to each call. Two stores for the same name are interchangeable.
pub struct DocumentStore {
    db_name: String,
    prefix: String,
}

impl DocumentStore {
    pub fn new(db_name: impl Into<String>) -> Self {
        let db_name = db_name.into();
        let prefix = path::database_prefix(&db_name);
        Self { db_name, prefix }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Key of the revision log of `id`.
    pub fn doc_path(&self, id: &str) -> String {
        path::document_path(&self.prefix, id)
    }

    /// Writes a new revision of `id` based on `old_rev`.
    ///
    /// With `allow_merge`, a stale `old_rev` creates a conflicting branch instead of
    /// being refused.
    pub fn put<S: StorageBackend + ?Sized>(
        &self,
        storage: &S,
        id: &str,
        old_rev: &RevisionId,
        content: &Value,
        allow_merge: bool,
    ) -> DocumentResult<PutResult> {
        let no_conflicts = BTreeSet::new();
        self.write(
            storage,
            id,
            old_rev,
            false,
            content,
            allow_merge.then_some(&no_conflicts),
        )
    }

    /// Writes a revision that may diverge from the local winner, carrying the conflicts
    /// its originator already knows about. Always merges.
    pub fn merge_put<S: StorageBackend + ?Sized>(
        &self,
        storage: &S,
        id: &str,
        old_rev: &RevisionId,
        content: &Value,
        incoming_conflicts: &BTreeSet<String>,
    ) -> DocumentResult<PutResult> {
        self.write(storage, id, old_rev, false, content, Some(incoming_conflicts))
    }

    /// Writes a tombstone revision of `id` based on `old_rev`.
    pub fn remove<S: StorageBackend + ?Sized>(
        &self,
        storage: &S,
        id: &str,
        old_rev: &RevisionId,
        allow_merge: bool,
    ) -> DocumentResult<PutResult> {
        let no_conflicts = BTreeSet::new();
        self.write(
            storage,
            id,
            old_rev,
            true,
            &Value::Object(Map::new()),
            allow_merge.then_some(&no_conflicts),
        )
    }

    fn write<S: StorageBackend + ?Sized>(
        &self,
        storage: &S,
        id: &str,
        old_rev: &RevisionId,
        deleted: bool,
        content: &Value,
        merge_with: Option<&BTreeSet<String>>,
    ) -> DocumentResult<PutResult> {
        if id.is_empty() {
            return Err(DocumentError::InvalidId(id.to_string()));
        }

        let doc_path = self.doc_path(id);
        let _guard = WRITE_LOCKS.stripe(&self.db_name, id).lock();

        let (mut rev_log, has_prior) = match storage.try_get(&doc_path)? {
            Some(bytes) => (codec::decode_log(&bytes)?, true),
            None => (RevisionLog::new_empty(), false),
        };

        let mut need_to_merge = false;
        if has_prior {
            let top = rev_log.top()?;
            if top != *old_rev {
                if merge_with.is_none() {
                    debug!(
                        "Update conflict on {} in {}: expected {:?}, current {}",
                        id, self.db_name, old_rev.format(), top
                    );
                    return Ok(PutResult {
                        code: PutCode::Conflict,
                        assigned_rev: None,
                        rev_log,
                    });
                }
                need_to_merge = true;
            }
        }

        let body = codec::encode_body(deleted, old_rev, content)?;
        let new_rev = RevisionId::child_of(old_rev, codec::content_hash(&body))?;
        storage.put(&path::revision_path(&doc_path, &new_rev), &body)?;

        match merge_with {
            Some(incoming_conflicts) if need_to_merge => {
                revision::merge_entry(&mut rev_log, &new_rev, deleted, incoming_conflicts)?;
            }
            _ => {
                if !old_rev.is_empty() && !has_prior {
                    // The caller knows a revision this store never saw
                    rev_log.append(old_rev, false, false);
                }
                rev_log.append(&new_rev, true, deleted);
            }
        }

        storage.put(&doc_path, &codec::encode_log(&rev_log)?)?;

        debug!(
            "Stored document {} in the database {} revid={} merged={}",
            id, self.db_name, new_rev, need_to_merge
        );

        Ok(PutResult {
            code: PutCode::Ok,
            assigned_rev: Some(new_rev),
            rev_log,
        })
    }

    /// Reads `id` at `rev`, or at its winning revision when `rev` is `None`.
    pub fn get<S: StorageBackend + ?Sized>(
        &self,
        storage: &S,
        id: &str,
        rev: Option<&RevisionId>,
        options: GetOptions,
    ) -> DocumentResult<Lookup> {
        if id.is_empty() {
            return Err(DocumentError::InvalidId(id.to_string()));
        }

        let doc_path = self.doc_path(id);
        let reader = SnapshotReader::open(storage)?;
        let mut result = GetResult::default();

        let target = match rev.filter(|r| !r.is_empty()) {
            Some(explicit) if !options.log => explicit.clone(),
            explicit => {
                let Some(bytes) = reader.try_get(&doc_path)? else {
                    return Ok(Lookup::NotFound);
                };
                let log = codec::decode_log(&bytes)?;
                let target = match explicit {
                    Some(r) => r.clone(),
                    None => log.top()?,
                };
                if options.log {
                    result.rev_log = Some(log);
                }
                if !options.body && !options.rev_info {
                    return Ok(Lookup::Found(result));
                }
                target
            }
        };

        let Some(bytes) = reader.try_get(&path::revision_path(&doc_path, &target))? else {
            if result.rev_log.is_none() && reader.try_get(&doc_path)?.is_none() {
                return Ok(Lookup::NotFound);
            }
            debug!(
                "Revision {} of {} in {} has no body, pruned during retrieval",
                target, id, self.db_name
            );
            return Ok(Lookup::Pruned(target));
        };

        let body = codec::decode_body(&bytes)?;
        if options.rev_info {
            result.rev_info = Some(RevisionInfo {
                id: id.to_string(),
                rev: target,
                deleted: body.deleted,
                previous_rev: body.previous_revision,
            });
        }
        if options.body {
            result.content = Some(body.content);
        }

        Ok(Lookup::Found(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    fn rev(text: &str) -> RevisionId {
        RevisionId::parse(text).unwrap()
    }

    #[test]
    fn test_first_put() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let res = docs
            .put(&*storage, "doc1", &RevisionId::empty(), &json!({"a": 1}), false)
            .unwrap();
        assert!(res.is_ok());

        let assigned = res.assigned_rev.unwrap();
        assert_eq!(assigned.generation(), 1);
        assert_eq!(assigned.unique_token().len(), 32);
        assert_eq!(res.rev_log.top().unwrap(), assigned);
        assert_eq!(res.rev_log.entries().len(), 1);
    }

    #[test]
    fn test_revision_is_hash_of_body() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let res = docs
            .put(&*storage, "doc1", &RevisionId::empty(), &json!({"a": 1}), false)
            .unwrap();
        let expected = codec::content_hash(br#"[false,"",null,{"a":1}]"#);
        assert_eq!(res.assigned_rev.unwrap().unique_token(), expected);
    }

    #[test]
    fn test_update_and_stale_update() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let r1 = docs
            .put(&*storage, "doc", &RevisionId::empty(), &json!({"v": 1}), false)
            .unwrap()
            .assigned_rev
            .unwrap();
        let r2 = docs
            .put(&*storage, "doc", &r1, &json!({"v": 2}), false)
            .unwrap()
            .assigned_rev
            .unwrap();
        assert_eq!(r2.generation(), r1.generation() + 1);

        let keys_before = storage.keys_with_prefix("data/");
        let stale = docs
            .put(&*storage, "doc", &r1, &json!({"v": 3}), false)
            .unwrap();
        assert!(stale.is_conflict());
        assert!(stale.assigned_rev.is_none());
        assert_eq!(stale.rev_log.top().unwrap(), r2);
        assert_eq!(storage.keys_with_prefix("data/"), keys_before);
    }

    #[test]
    fn test_placeholder_for_unknown_parent() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let res = docs
            .put(&*storage, "doc", &rev("3-remote"), &json!({}), false)
            .unwrap();
        assert!(res.is_ok());

        let entries = res.rev_log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].revision(), rev("3-remote"));
        assert!(!entries[0].available);
        assert!(entries[1].available);
        assert_eq!(res.assigned_rev.unwrap().generation(), 4);

        // The placeholder is known but unreadable
        let lookup = docs
            .get(&*storage, "doc", Some(&rev("3-remote")), GetOptions::default())
            .unwrap();
        assert!(matches!(lookup, Lookup::Pruned(r) if r == rev("3-remote")));
    }

    #[test]
    fn test_merge_keeps_both_branches() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let r1 = docs
            .put(&*storage, "doc", &RevisionId::empty(), &json!({"a": 1}), false)
            .unwrap()
            .assigned_rev
            .unwrap();
        let merged = docs
            .put(&*storage, "doc", &RevisionId::empty(), &json!({"a": 2}), true)
            .unwrap();
        assert!(merged.is_ok());
        let r2 = merged.assigned_rev.unwrap();

        let (winner, loser) = if revision::is_winner(&r1, &r2) {
            (r1, r2)
        } else {
            (r2, r1)
        };
        let log = merged.rev_log;
        assert_eq!(log.top().unwrap(), winner);
        assert_eq!(log.conflicts().len(), 1);
        assert!(log.conflicts().contains(&loser.format()));

        // Both branches stay readable by explicit revision
        for r in [&winner, &loser] {
            assert!(docs
                .get(&*storage, "doc", Some(r), GetOptions::default())
                .unwrap()
                .is_found());
        }
    }

    #[test]
    fn test_merge_put_carries_conflicts() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let r1 = docs
            .put(&*storage, "doc", &RevisionId::empty(), &json!({"a": 1}), false)
            .unwrap()
            .assigned_rev
            .unwrap();
        let r2 = docs
            .put(&*storage, "doc", &r1, &json!({"a": 2}), false)
            .unwrap()
            .assigned_rev
            .unwrap();

        let known: BTreeSet<String> = ["2-elsewhere".to_string()].into_iter().collect();
        let res = docs
            .merge_put(&*storage, "doc", &r1, &json!({"a": 3}), &known)
            .unwrap();
        assert!(res.is_ok());

        let log = res.rev_log;
        assert!(log.conflicts().contains("2-elsewhere"));
        let top = log.top().unwrap();
        assert!(!log.conflicts().contains(&top.format()));
        assert!(top == r2 || Some(&top) == res.assigned_rev.as_ref());
    }

    #[test]
    fn test_remove_writes_tombstone() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let r1 = docs
            .put(&*storage, "doc", &RevisionId::empty(), &json!({"a": 1}), false)
            .unwrap()
            .assigned_rev
            .unwrap();
        let removed = docs.remove(&*storage, "doc", &r1, false).unwrap();
        assert!(removed.is_ok());
        assert!(removed.rev_log.top_entry().unwrap().deleted);

        let res = docs
            .get(&*storage, "doc", None, GetOptions::all())
            .unwrap()
            .found()
            .unwrap();
        assert!(res.is_deleted());
        assert_eq!(res.content, Some(json!({})));
        assert_eq!(res.rev_info.unwrap().previous_rev, r1);
    }

    #[test]
    fn test_get_parts() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let r1 = docs
            .put(&*storage, "doc", &RevisionId::empty(), &json!({"a": 1}), false)
            .unwrap()
            .assigned_rev
            .unwrap();

        let body_only = docs
            .get(&*storage, "doc", None, GetOptions::default())
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(body_only.content, Some(json!({"a": 1})));
        assert!(body_only.rev_info.is_none());
        assert!(body_only.rev_log.is_none());

        let log_only = docs
            .get(&*storage, "doc", None, GetOptions::log_only())
            .unwrap()
            .found()
            .unwrap();
        assert!(log_only.content.is_none());
        assert_eq!(log_only.rev_log.unwrap().top().unwrap(), r1);

        let info = docs
            .get(&*storage, "doc", Some(&r1), GetOptions::all())
            .unwrap()
            .found()
            .unwrap()
            .rev_info
            .unwrap();
        assert_eq!(info.id, "doc");
        assert_eq!(info.rev, r1);
        assert!(!info.deleted);
        assert!(info.previous_rev.is_empty());
    }

    #[test]
    fn test_missing_versus_pruned() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        docs.put(&*storage, "doc", &RevisionId::empty(), &json!({}), false)
            .unwrap();

        let missing = docs
            .get(&*storage, "nope", None, GetOptions::default())
            .unwrap();
        assert!(matches!(missing, Lookup::NotFound));

        let missing_with_rev = docs
            .get(&*storage, "nope", Some(&rev("1-abc")), GetOptions::default())
            .unwrap();
        assert!(matches!(missing_with_rev, Lookup::NotFound));

        let pruned = docs
            .get(&*storage, "doc", Some(&rev("9-abc")), GetOptions::default())
            .unwrap();
        assert!(matches!(pruned, Lookup::Pruned(r) if r == rev("9-abc")));
    }

    #[test]
    fn test_pruned_winner_is_soft() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let r1 = docs
            .put(&*storage, "doc", &RevisionId::empty(), &json!({}), false)
            .unwrap()
            .assigned_rev
            .unwrap();
        storage.remove(&path::revision_path(&docs.doc_path("doc"), &r1));

        let lookup = docs
            .get(&*storage, "doc", None, GetOptions::default())
            .unwrap();
        assert!(matches!(lookup, Lookup::Pruned(r) if r == r1));
        assert_eq!(storage.open_snapshots(), 0);
    }

    #[test]
    fn test_empty_id_rejected() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        assert!(matches!(
            docs.put(&*storage, "", &RevisionId::empty(), &json!({}), false),
            Err(DocumentError::InvalidId(_))
        ));
        assert!(matches!(
            docs.get(&*storage, "", None, GetOptions::default()),
            Err(DocumentError::InvalidId(_))
        ));
    }

    #[test]
    fn test_databases_are_isolated() {
        let storage = MemoryBackend::new();
        let a = DocumentStore::new("a");
        let b = DocumentStore::new("b");

        a.put(&*storage, "doc", &RevisionId::empty(), &json!({"db": "a"}), false)
            .unwrap();
        assert!(matches!(
            b.get(&*storage, "doc", None, GetOptions::default()).unwrap(),
            Lookup::NotFound
        ));
    }

    #[test]
    fn test_put_past_last_generation_fails() {
        let storage = MemoryBackend::new();
        let docs = DocumentStore::new("test");

        let res = docs.put(&*storage, "doc", &rev("4294967295-x"), &json!({}), false);
        assert!(matches!(
            res,
            Err(DocumentError::Revision(RevisionError::GenerationOverflow(_)))
        ));
        assert!(storage.keys_with_prefix("data/").is_empty());
    }

    #[test]
    fn test_stores_for_same_database_exclude_each_other() {
        use std::sync::Arc;
        use std::thread;

        let storage = MemoryBackend::new();
        let stores = [
            Arc::new(DocumentStore::new("shared")),
            Arc::new(DocumentStore::new("shared")),
        ];

        let handles: Vec<_> = stores
            .iter()
            .map(|docs| {
                let docs = Arc::clone(docs);
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    let mut successes = 0u32;
                    for i in 0..500 {
                        let current = match docs
                            .get(&*storage, "c", None, GetOptions::log_only())
                            .unwrap()
                        {
                            Lookup::Found(doc) => doc.rev_log.unwrap().top().unwrap(),
                            _ => RevisionId::empty(),
                        };
                        let res = docs
                            .put(&*storage, "c", &current, &json!({"i": i}), false)
                            .unwrap();
                        if res.is_ok() {
                            successes += 1;
                        }
                    }
                    successes
                })
            })
            .collect();

        let successes: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let log = stores[0]
            .get(&*storage, "c", None, GetOptions::log_only())
            .unwrap()
            .found()
            .unwrap()
            .rev_log
            .unwrap();
        assert_eq!(log.top().unwrap().generation(), successes);
        assert_eq!(log.entries().len() as u32, successes);
    }
}
