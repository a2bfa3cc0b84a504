//! Per-document revision ledger.
//!
//! The log is read whole, mutated in memory and written back as one record. Entries are
//! append-only: the last entry is the current winner, earlier entries are history or
//! placeholders for revisions known only by reference (`available == false`).
//!
//! Losing branches are tracked by their full revision strings in two sets, one for live
//! revisions and one for tombstones. The current winner is never listed in either.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{RevisionError, RevisionId, RevisionResult};

/// One revision known to the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionLogEntry {
    pub generation: u32,

    #[serde(rename = "token")]
    pub unique_token: String,

    /// False for a placeholder whose body is not stored locally
    pub available: bool,

    pub deleted: bool,
}

impl RevisionLogEntry {
    pub fn revision(&self) -> RevisionId {
        RevisionId {
            generation: self.generation,
            unique_token: self.unique_token.clone(),
        }
    }
}

/// Ordered revision entries plus the conflict sets of one document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionLog {
    #[serde(default)]
    conflicts: BTreeSet<String>,

    #[serde(default)]
    deleted_conflicts: BTreeSet<String>,

    entries: Vec<RevisionLogEntry>,
}

impl RevisionLog {
    /// A log with no entries and no conflicts, used for a document's first write.
    pub fn new_empty() -> Self {
        Self::default()
    }

    /// The current winning revision.
    pub fn top(&self) -> RevisionResult<RevisionId> {
        self.top_entry().map(RevisionLogEntry::revision)
    }

    pub fn top_entry(&self) -> RevisionResult<&RevisionLogEntry> {
        self.entries.last().ok_or(RevisionError::EmptyLog)
    }

    /// Pushes a new entry. Existing entries are never removed or reordered.
    pub fn append(&mut self, rev: &RevisionId, available: bool, deleted: bool) {
        self.entries.push(RevisionLogEntry {
            generation: rev.generation(),
            unique_token: rev.unique_token().to_string(),
            available,
            deleted,
        });
    }

    pub fn entries(&self) -> &[RevisionLogEntry] {
        &self.entries
    }

    /// Looks up the most recent entry recorded for `rev`.
    pub fn find(&self, rev: &RevisionId) -> Option<&RevisionLogEntry> {
        self.entries.iter().rev().find(|e| {
            e.generation == rev.generation() && e.unique_token == rev.unique_token()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn conflicts(&self) -> &BTreeSet<String> {
        &self.conflicts
    }

    pub fn deleted_conflicts(&self) -> &BTreeSet<String> {
        &self.deleted_conflicts
    }

    /// Adds a losing live revision. Idempotent.
    pub fn add_conflict(&mut self, rev: impl Into<String>) {
        self.conflicts.insert(rev.into());
    }

    /// Adds a losing tombstone revision. Idempotent.
    pub fn add_deleted_conflict(&mut self, rev: impl Into<String>) {
        self.deleted_conflicts.insert(rev.into());
    }

    /// Drops `rev` from both conflict sets.
    pub(crate) fn clear_conflict(&mut self, rev: &str) {
        self.conflicts.remove(rev);
        self.deleted_conflicts.remove(rev);
    }
}
