//! Deterministic conflict resolution.
//!
//! Every replica holding the same two revisions must pick the same winner without
//! coordination, so the order below depends only on the identifiers themselves:
//!
//! 1. Higher generation wins.
//! 2. On equal generations, the shorter token wins.
//! 3. On equal lengths, the lexicographically larger token wins.

use std::collections::BTreeSet;
use tracing::debug;

use super::{RevisionId, RevisionLog, RevisionResult};

/// Returns true if `left` beats `right`. False for identical revisions.
pub fn is_winner(left: &RevisionId, right: &RevisionId) -> bool {
    if left.generation() != right.generation() {
        return left.generation() > right.generation();
    }

    let (lsz, rsz) = (left.unique_token().len(), right.unique_token().len());
    if lsz != rsz {
        return lsz < rsz;
    }

    left.unique_token() > right.unique_token()
}

/// Merges a live incoming revision and its known conflicts into `log`.
pub fn merge(
    log: &mut RevisionLog,
    incoming: &RevisionId,
    incoming_conflicts: &BTreeSet<String>,
) -> RevisionResult<()> {
    merge_entry(log, incoming, false, incoming_conflicts)
}

/// Merges an incoming revision into `log`.
///
/// If the current top still wins, the incoming revision becomes a conflict. Otherwise it is
/// appended as the new top and the former top is demoted to a conflict. Nothing is ever
/// removed from the entry list. Performs no I/O.
pub fn merge_entry(
    log: &mut RevisionLog,
    incoming: &RevisionId,
    incoming_deleted: bool,
    incoming_conflicts: &BTreeSet<String>,
) -> RevisionResult<()> {
    let current = log.top_entry()?.clone();
    let current_top = current.revision();

    for rev in incoming_conflicts {
        log.add_conflict(rev.as_str());
    }

    if current_top == *incoming {
        debug!("Merge of {} is a no-op, already the winner", incoming);
    } else if is_winner(&current_top, incoming) {
        debug!("Merge: local {} beats incoming {}", current_top, incoming);
        if incoming_deleted {
            log.add_deleted_conflict(incoming.to_string());
        } else {
            log.add_conflict(incoming.to_string());
        }
    } else {
        debug!("Merge: incoming {} beats local {}", incoming, current_top);
        log.append(incoming, true, incoming_deleted);
        if current.deleted {
            log.add_deleted_conflict(current_top.to_string());
        } else {
            log.add_conflict(current_top.to_string());
        }
    }

    let winner = log.top()?.to_string();
    log.clear_conflict(&winner);

    Ok(())
}
