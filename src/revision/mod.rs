//! Document revision identifiers and the per-document revision ledger.
//!
//! A revision is written as `{generation}-{unique_token}`, e.g. `3-9a0364b9e99bb480dd25e1f0284c8555`.
//! The generation counts edits along one branch of a document; the token is the content hash
//! of the revision body. Generation 0 is reserved for the empty revision, which names
//! "no document yet" and formats to the empty string.
//!
//! - [`RevisionId`]: parse/format/equality of identifiers
//! - [`log::RevisionLog`]: ordered entries plus the conflict sets of one document
//! - [`conflict`]: the deterministic winner order and the log merge

pub mod conflict;
pub mod log;

pub use conflict::{is_winner, merge, merge_entry};
pub use log::{RevisionLog, RevisionLogEntry};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Revision-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevisionError {
    #[error("Invalid revision: {0}")]
    Malformed(String),

    #[error("Revision log has no entries")]
    EmptyLog,

    #[error("Generation {0} has no successor")]
    GenerationOverflow(u32),
}

pub type RevisionResult<T> = Result<T, RevisionError>;

/// An immutable revision identifier.
///
/// Equality is on `(generation, unique_token)`. This is the order used by the
/// optimistic concurrency check; conflict winners are chosen by [`conflict::is_winner`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u32,
    unique_token: String,
}

impl RevisionId {
    /// The distinguished empty revision (no document exists yet).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the child of `parent` whose body hashes to `token`.
    ///
    /// Fails when `parent` already carries the largest representable generation.
    pub fn child_of(parent: &RevisionId, token: impl Into<String>) -> RevisionResult<Self> {
        let generation = parent
            .generation
            .checked_add(1)
            .ok_or(RevisionError::GenerationOverflow(parent.generation))?;
        Ok(Self {
            generation,
            unique_token: token.into(),
        })
    }

    /// Builds a revision from its parts.
    ///
    /// Fails if the parts violate the `generation == 0` iff empty-token invariant.
    pub fn new(generation: u32, unique_token: impl Into<String>) -> RevisionResult<Self> {
        let unique_token = unique_token.into();
        if (generation == 0) != unique_token.is_empty() {
            return Err(RevisionError::Malformed(format!(
                "{}-{}",
                generation, unique_token
            )));
        }
        Ok(Self {
            generation,
            unique_token,
        })
    }

    /// Parses the canonical text form. The empty string is the empty revision.
    pub fn parse(text: &str) -> RevisionResult<Self> {
        if text.is_empty() {
            return Ok(Self::empty());
        }

        let malformed = || RevisionError::Malformed(text.to_string());

        let (number, token) = text.split_once('-').ok_or_else(malformed)?;
        if number.is_empty() || token.is_empty() {
            return Err(malformed());
        }
        if !number.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        // A leading zero would not survive a format round trip
        if number.len() > 1 && number.starts_with('0') {
            return Err(malformed());
        }

        let generation: u32 = number.parse().map_err(|_| malformed())?;
        if generation == 0 {
            return Err(malformed());
        }

        Ok(Self {
            generation,
            unique_token: token.to_string(),
        })
    }

    /// Formats to the canonical text form; the empty revision formats to `""`.
    pub fn format(&self) -> String {
        self.to_string()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn unique_token(&self) -> &str {
        &self.unique_token
    }

    pub fn is_empty(&self) -> bool {
        self.generation == 0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}-{}", self.generation, self.unique_token)
    }
}

impl FromStr for RevisionId {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = RevisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RevisionId> for String {
    fn from(rev: RevisionId) -> Self {
        rev.to_string()
    }
}
