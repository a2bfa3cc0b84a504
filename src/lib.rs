//! # sofadb: a CouchDB-style revisioned document store
//!
//! sofadb keeps JSON documents in an embedded ordered key-value store. Every document
//! evolves through a chain of immutable, content-addressed revisions:
//!
//! - **Revisions**: `{generation}-{md5}` identifiers derived from the body and its lineage
//! - **Optimistic concurrency**: writers name the revision they edited; stale writes are refused
//! - **Deterministic merges**: conflicting branches are kept and every replica picks the same winner
//! - **Pluggable storage**: sled on disk, or an in-memory map with snapshots
//!
//! # Usage
//!
//! ```no_run
//! use serde_json::json;
//! use sofadb::{Engine, GetOptions, RevisionId};
//!
//! let engine = Engine::in_memory();
//! let db = engine.create_or_open("music")?;
//!
//! let res = db.put("track1", &RevisionId::empty(), &json!({"title": "Intro"}), false)?;
//! let rev = res.assigned_rev.expect("first write succeeds");
//!
//! let doc = db.get("track1", None, GetOptions::default())?.found();
//! assert_eq!(doc.and_then(|d| d.content), Some(json!({"title": "Intro"})));
//! # let _ = rev;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Core modules
pub mod codec;
pub mod document;
pub mod engine;
pub mod revision;
pub mod storage;

// Re-export main types at crate root for convenience
pub use document::{
    DocumentError, DocumentStore, GetOptions, GetResult, Lookup, PutCode, PutResult,
    RevisionInfo,
};
pub use engine::{Database, DatabaseInfo, Engine, EngineError};
pub use revision::{RevisionError, RevisionId, RevisionLog, RevisionLogEntry};
pub use storage::{
    BackendConfig, MemoryBackend, SledBackend, SnapshotHandle, StorageBackend, StorageError,
};
