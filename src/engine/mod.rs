//! Database registry.
//!
//! An [`Engine`] owns one storage backend and a cache of open databases keyed by name.
//! Opening a database for the first time reads its metadata record from the system
//! namespace, creating and persisting fresh metadata if none exists. Handles are cached
//! until [`Engine::close_database`] or [`Engine::shutdown`].
//!
//! There is no process-wide engine; callers construct one and pass it around.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{self, CodecError};
use crate::document::{
    path, DocumentError, DocumentResult, DocumentStore, GetOptions, Lookup, PutResult,
};
use crate::revision::RevisionId;
use crate::storage::{
    BackendConfig, BackendError, MemoryBackend, SledBackend, StorageBackend, StorageError,
};

/// Engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid database name: {0:?}")]
    InvalidName(String),

    #[error("Corrupt metadata for database {name}: {reason}")]
    CorruptMetadata { name: String, reason: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Name and metadata of a database, as persisted in the system namespace.
#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseInfo {
    pub name: String,
    pub metadata: Value,
}

impl DatabaseInfo {
    /// Fresh metadata for a database created now.
    fn fresh(name: &str) -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Self {
            name: name.to_string(),
            metadata: json!({
                "db_name": name,
                "instance_start_time": micros.to_string(),
            }),
        }
    }

    fn from_metadata(name: &str, metadata: Value) -> EngineResult<Self> {
        match metadata.get("db_name").and_then(Value::as_str) {
            Some(stored) if stored == name => Ok(Self {
                name: name.to_string(),
                metadata,
            }),
            other => Err(EngineError::CorruptMetadata {
                name: name.to_string(),
                reason: format!("db_name is {:?}", other),
            }),
        }
    }
}

/// An open database: its metadata plus the document store bound to the engine's backend.
pub struct Database {
    info: DatabaseInfo,
    documents: DocumentStore,
    storage: Arc<dyn StorageBackend>,
    closed: AtomicBool,
}

impl Database {
    fn new(info: DatabaseInfo, storage: Arc<dyn StorageBackend>) -> Self {
        let documents = DocumentStore::new(info.name.clone());
        Self {
            info,
            documents,
            storage,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &DatabaseInfo {
        &self.info
    }

    pub fn metadata(&self) -> &Value {
        &self.info.metadata
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    /// Marks the handle closed; later document operations fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_closed(&self) -> DocumentResult<()> {
        if self.is_closed() {
            return Err(DocumentError::Closed(self.info.name.clone()));
        }
        Ok(())
    }

    pub fn put(
        &self,
        id: &str,
        old_rev: &RevisionId,
        content: &Value,
        allow_merge: bool,
    ) -> DocumentResult<PutResult> {
        self.check_closed()?;
        self.documents
            .put(&*self.storage, id, old_rev, content, allow_merge)
    }

    pub fn merge_put(
        &self,
        id: &str,
        old_rev: &RevisionId,
        content: &Value,
        incoming_conflicts: &BTreeSet<String>,
    ) -> DocumentResult<PutResult> {
        self.check_closed()?;
        self.documents
            .merge_put(&*self.storage, id, old_rev, content, incoming_conflicts)
    }

    pub fn remove(
        &self,
        id: &str,
        old_rev: &RevisionId,
        allow_merge: bool,
    ) -> DocumentResult<PutResult> {
        self.check_closed()?;
        self.documents
            .remove(&*self.storage, id, old_rev, allow_merge)
    }

    pub fn get(
        &self,
        id: &str,
        rev: Option<&RevisionId>,
        options: GetOptions,
    ) -> DocumentResult<Lookup> {
        self.check_closed()?;
        self.documents.get(&*self.storage, id, rev, options)
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("info", &self.info)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry of open databases over one storage backend.
pub struct Engine {
    storage: Arc<dyn StorageBackend>,
    databases: DashMap<String, Arc<Database>>,
}

impl Engine {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            databases: DashMap::new(),
        }
    }

    /// Opens an engine over a sled store.
    pub fn open(config: BackendConfig) -> EngineResult<Self> {
        let backend = SledBackend::new(config)?;
        Ok(Self::new(backend))
    }

    /// An engine over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Returns the database called `name`, creating and persisting it on first use.
    pub fn create_or_open(&self, name: &str) -> EngineResult<Arc<Database>> {
        if name.is_empty() {
            return Err(EngineError::InvalidName(name.to_string()));
        }

        if let Some(db) = self.databases.get(name) {
            if !db.is_closed() {
                return Ok(Arc::clone(&db));
            }
        }

        match self.databases.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Ok(Arc::clone(entry.get()));
                }
                let db = Arc::new(self.load_database(name)?);
                entry.insert(Arc::clone(&db));
                Ok(db)
            }
            Entry::Vacant(entry) => {
                let db = Arc::new(self.load_database(name)?);
                entry.insert(Arc::clone(&db));
                Ok(db)
            }
        }
    }

    fn load_database(&self, name: &str) -> EngineResult<Database> {
        let info_path = path::database_info_path(name);

        let info = match self.storage.try_get(&info_path)? {
            Some(bytes) => {
                let info = DatabaseInfo::from_metadata(name, codec::parse(&bytes)?)?;
                debug!("Opened database {}", name);
                info
            }
            None => {
                let info = DatabaseInfo::fresh(name);
                self.storage
                    .put(&info_path, &codec::serialize(&info.metadata)?)?;
                info!("Created database {}", name);
                info
            }
        };

        Ok(Database::new(info, Arc::clone(&self.storage)))
    }

    /// Names of the cached databases, sorted.
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Closes and evicts one cached database. Returns false if it was not open.
    pub fn close_database(&self, name: &str) -> bool {
        match self.databases.remove(name) {
            Some((_, db)) => {
                db.close();
                debug!("Closed database {}", name);
                true
            }
            None => false,
        }
    }

    /// Closes every cached database and flushes the backend.
    pub fn shutdown(&self) -> EngineResult<()> {
        for entry in self.databases.iter() {
            entry.value().close();
        }
        self.databases.clear();
        self.storage.flush()?;
        info!("Engine shut down");
        Ok(())
    }
}
