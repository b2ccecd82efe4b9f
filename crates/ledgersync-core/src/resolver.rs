//! # Action Resolver
//!
//! Decides what to do with one change record given the replica's current row.
//!
//! ## Decision Table (first match wins)
//! ```text
//! ┌───┬──────────────┬──────────────────┬──────────────────────┬─────────┐
//! │ # │ existing     │ change.deleted   │ ordering             │ action  │
//! ├───┼──────────────┼──────────────────┼──────────────────────┼─────────┤
//! │ 1 │ absent       │ true             │ -                    │ SKIP    │
//! │ 2 │ absent       │ false            │ -                    │ INSERT  │
//! │ 3 │ present      │ true             │ ignored              │ DELETE  │
//! │ 4 │ present      │ false            │ change newer         │ UPDATE  │
//! │ 5 │ present      │ false            │ change not newer     │ SKIP    │
//! └───┴──────────────┴──────────────────┴──────────────────────┴─────────┘
//! ```
//!
//! "Newer" compares revisions. An unversioned change (revision 0) falls back
//! to last-write-wins on `modified_at`.
//!
//! Rule 5 is what makes re-running a cycle safe: records already applied
//! resolve to SKIP.

use crate::types::{Action, ChangeRecord, ReplicaRecord};

/// Resolves the action for `change` against the replica's current row.
///
/// Pure: no side effects, no I/O.
///
/// ## Example
/// ```rust
/// use chrono::Utc;
/// use ledgersync_core::{resolve, Action, ChangeRecord, PartitionKey};
///
/// let p = PartitionKey::new("acme", "ledger");
/// let delete_of_unknown = ChangeRecord::new(&p, "X", 7, Utc::now(), true);
/// assert_eq!(resolve(&delete_of_unknown, None), Action::Skip);
/// ```
pub fn resolve(change: &ChangeRecord, existing: Option<&ReplicaRecord>) -> Action {
    match existing {
        None if change.deleted => Action::Skip,
        None => Action::Insert,
        // Deletion is terminal at the source, so it wins over staleness.
        Some(_) if change.deleted => Action::Delete,
        Some(current) if is_newer(change, current) => Action::Update,
        Some(_) => Action::Skip,
    }
}

/// Returns true if `change` supersedes the stored row.
pub fn is_newer(change: &ChangeRecord, current: &ReplicaRecord) -> bool {
    if change.is_versioned() {
        change.revision > current.revision
    } else {
        change.modified_at > current.modified_at
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
