//! Value serialization, content hashing and the document body format.
//!
//! Values are `serde_json::Value` (with `arbitrary_precision`, so big integers keep every
//! digit). Serialization is compact JSON with object keys sorted: equal `Value`s always
//! produce equal bytes, and therefore equal revision hashes. Numbers keep the text they were
//! parsed from, so `1.0` and `1.00` are different values and hash differently.
//!
//! A stored body is the array `[deleted, previous_revision, attachments, content]`.
//! The same bytes are hashed to produce the revision token, so the order of the fields
//! and their encoding must never change.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::revision::{RevisionError, RevisionId, RevisionLog};

/// Codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed document body: {0}")]
    MalformedBody(String),

    #[error("Revision error: {0}")]
    Revision(#[from] RevisionError),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Compact encoding of a value with sorted object keys.
pub fn serialize(value: &Value) -> CodecResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Parses bytes produced by [`serialize`] (or any JSON text).
pub fn parse(bytes: &[u8]) -> CodecResult<Value> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Lowercase hex MD5 digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Encodes a revision log record.
pub fn encode_log(log: &RevisionLog) -> CodecResult<Vec<u8>> {
    Ok(serde_json::to_vec(log)?)
}

/// Decodes a revision log record.
pub fn decode_log(bytes: &[u8]) -> CodecResult<RevisionLog> {
    Ok(serde_json::from_slice(bytes)?)
}

/// A decoded revision body.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentBody {
    pub deleted: bool,
    pub previous_revision: RevisionId,
    /// Reserved, always null
    pub attachments: Value,
    pub content: Value,
}

/// Encodes `[deleted, previous_revision, null, content]`.
pub fn encode_body(
    deleted: bool,
    previous_revision: &RevisionId,
    content: &Value,
) -> CodecResult<Vec<u8>> {
    // The unit value encodes as null
    Ok(serde_json::to_vec(&(
        deleted,
        previous_revision.format(),
        (),
        content,
    ))?)
}

/// Decodes a body written by [`encode_body`].
pub fn decode_body(bytes: &[u8]) -> CodecResult<DocumentBody> {
    let value = parse(bytes)?;
    let Value::Array(mut parts) = value else {
        return Err(CodecError::MalformedBody("expected an array".to_string()));
    };
    if parts.len() != 4 {
        return Err(CodecError::MalformedBody(format!(
            "expected 4 elements, found {}",
            parts.len()
        )));
    }

    let content = parts.pop().unwrap_or(Value::Null);
    let attachments = parts.pop().unwrap_or(Value::Null);
    let previous_revision = match parts.pop() {
        Some(Value::String(s)) => RevisionId::parse(&s)?,
        other => {
            return Err(CodecError::MalformedBody(format!(
                "previous revision is not a string: {:?}",
                other
            )))
        }
    };
    let deleted = match parts.pop() {
        Some(Value::Bool(b)) => b,
        other => {
            return Err(CodecError::MalformedBody(format!(
                "deleted flag is not a bool: {:?}",
                other
            )))
        }
    };

    Ok(DocumentBody {
        deleted,
        previous_revision,
        attachments,
        content,
    })
}

/// Splits an object into its ordinary fields and its `_`-prefixed reserved fields.
///
/// Non-object values are returned unchanged with an empty reserved map.
pub fn split_reserved(value: &Value) -> (Value, Value) {
    let Value::Object(fields) = value else {
        return (value.clone(), Value::Object(Map::new()));
    };

    let mut sanitized = Map::new();
    let mut special = Map::new();
    for (name, field) in fields {
        if name.starts_with('_') {
            special.insert(name.clone(), field.clone());
        } else {
            sanitized.insert(name.clone(), field.clone());
        }
    }

    (Value::Object(sanitized), Value::Object(special))
}
