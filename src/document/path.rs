//! Key layout over the flat key space.
//!
//! ```text
//! system/{db}\x01dbinfo             database metadata
//! data/{db}\x01{id}\x02             revision log of a document
//! data/{db}\x01{id}\x02{gen}-{hash} body of one revision
//! ```
//!
//! The separators are control characters. Any `\x00`, `\x01` or `\x02` inside a database
//! name or document id is escaped as `\x00` followed by an ASCII digit, so neither component
//! can forge a separator and the mapping stays injective.

use crate::revision::RevisionId;

pub const DATA_NAMESPACE: &str = "data";
pub const SYSTEM_NAMESPACE: &str = "system";
pub const DB_SEPARATOR: char = '\u{1}';
pub const REV_SEPARATOR: char = '\u{2}';

const ESCAPE: char = '\u{0}';

fn push_escaped(out: &mut String, component: &str) {
    for c in component.chars() {
        match c {
            '\u{0}' => out.extend([ESCAPE, '0']),
            '\u{1}' => out.extend([ESCAPE, '1']),
            '\u{2}' => out.extend([ESCAPE, '2']),
            _ => out.push(c),
        }
    }
}

/// Key of a database's metadata record.
pub fn database_info_path(db_name: &str) -> String {
    let mut res = String::with_capacity(SYSTEM_NAMESPACE.len() + db_name.len() + 8);
    res.push_str(SYSTEM_NAMESPACE);
    res.push('/');
    push_escaped(&mut res, db_name);
    res.push(DB_SEPARATOR);
    res.push_str("dbinfo");
    res
}

/// Prefix shared by every key of one database's documents.
pub fn database_prefix(db_name: &str) -> String {
    let mut res = String::with_capacity(DATA_NAMESPACE.len() + db_name.len() + 2);
    res.push_str(DATA_NAMESPACE);
    res.push('/');
    push_escaped(&mut res, db_name);
    res.push(DB_SEPARATOR);
    res
}

/// Key of a document's revision log, given the database prefix.
pub fn document_path(db_prefix: &str, id: &str) -> String {
    let mut res = String::with_capacity(db_prefix.len() + id.len() + 42);
    res.push_str(db_prefix);
    push_escaped(&mut res, id);
    res.push(REV_SEPARATOR);
    res
}

/// Key of one revision body, given the document's log key.
pub fn revision_path(doc_path: &str, rev: &RevisionId) -> String {
    format!("{}{}", doc_path, rev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(database_info_path("test"), "system/test\u{1}dbinfo");

        let prefix = database_prefix("test");
        assert_eq!(prefix, "data/test\u{1}");

        let doc = document_path(&prefix, "doc1");
        assert_eq!(doc, "data/test\u{1}doc1\u{2}");

        let rev = RevisionId::parse("1-abc").unwrap();
        assert_eq!(revision_path(&doc, &rev), "data/test\u{1}doc1\u{2}1-abc");
    }

    #[test]
    fn test_separators_are_escaped() {
        let prefix = database_prefix("db");
        let forged = document_path(&prefix, "a\u{2}1-x");
        assert_eq!(forged, "data/db\u{1}a\u{0}21-x\u{2}");

        // An id ending in the escape digit must not collide with an escaped separator
        let a = document_path(&prefix, "x\u{0}2");
        let b = document_path(&prefix, "x\u{2}");
        assert_ne!(a, b);
    }

    #[test]
    fn test_database_names_cannot_leak_into_ids() {
        let a = document_path(&database_prefix("a\u{1}b"), "c");
        let b = document_path(&database_prefix("a"), "b\u{1}c");
        assert_ne!(a, b);
    }

    #[test]
    fn test_body_keys_share_log_prefix() {
        let doc = document_path(&database_prefix("db"), "id");
        let rev = RevisionId::parse("3-ff").unwrap();
        assert!(revision_path(&doc, &rev).starts_with(&doc));
    }
}
