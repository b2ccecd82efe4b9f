//! # Reconciliation Applier
//!
//! Executes one resolved action against the replica store.
//!
//! ## Action → Store Operation
//! ```text
//! ┌──────────┬─────────────────────────────┬──────────────────────────────┐
//! │ Action   │ Store operation             │ Outcomes                     │
//! ├──────────┼─────────────────────────────┼──────────────────────────────┤
//! │ Insert   │ insert_or_update            │ Inserted, Updated (raced),   │
//! │          │                             │ SkippedStale                 │
//! │ Update   │ compare_and_set             │ Updated, SkippedStale        │
//! │ Delete   │ soft_delete                 │ Deleted, Skipped             │
//! │ Skip     │ (none)                      │ Skipped                      │
//! └──────────┴─────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Store errors are captured in [`ApplyResult`] rather than raised, so the
//! orchestrator can decide between retrying and counting the record failed.
//!
//! The orchestrator reaches the replica through [`ReplicaStore`];
//! [`Applier`] is the SQLite implementation.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use ledgersync_core::{Action, ApplyOutcome, ChangeRecord, ReplicaRecord};
use ledgersync_db::{Database, DbError, DbResult};

use crate::error::SyncResult;

/// Outcome of one apply call.
#[derive(Debug)]
pub struct ApplyResult {
    pub action: Action,
    pub outcome: Result<ApplyOutcome, DbError>,
}

impl ApplyResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> SyncResult<ApplyOutcome> {
        Ok(self.outcome?)
    }
}

/// Replica access needed by a cycle: look up the stored row, then apply
/// the resolved action.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    async fn current(&self, change: &ChangeRecord) -> DbResult<Option<ReplicaRecord>>;

    async fn apply(&self, action: Action, change: &ChangeRecord) -> ApplyResult;
}

/// Applies resolved actions to the replica.
#[derive(Debug, Clone)]
pub struct Applier {
    db: Arc<Database>,
}

impl Applier {
    pub fn new(db: Arc<Database>) -> Self {
        Applier { db }
    }

    /// Applies `action` for `change`. Every mutation stamps `last_synced_at`.
    pub async fn apply(&self, action: Action, change: &ChangeRecord) -> ApplyResult {
        let now = Utc::now();
        let replicas = self.db.replicas();

        let outcome = match action {
            Action::Insert => replicas.insert_or_update(change, now).await,
            Action::Update => replicas.compare_and_set(change, now).await,
            Action::Delete => replicas.soft_delete(change, now).await,
            Action::Skip => Ok(ApplyOutcome::Skipped),
        };

        ApplyResult { action, outcome }
    }
}

#[async_trait]
impl ReplicaStore for Applier {
    async fn current(&self, change: &ChangeRecord) -> DbResult<Option<ReplicaRecord>> {
        self.db
            .replicas()
            .get(&change.partition(), &change.identity)
            .await
    }

    async fn apply(&self, action: Action, change: &ChangeRecord) -> ApplyResult {
        Applier::apply(self, action, change).await
    }
}

/// Payload fields whose values differ between the stored row and a change.
///
/// Sorted; includes fields present on only one side.
pub fn changed_fields(existing: &ReplicaRecord, change: &ChangeRecord) -> Vec<String> {
    let mut fields: Vec<String> = change
        .payload
        .iter()
        .filter(|(field, value)| existing.payload.get(field.as_str()) != Some(*value))
        .map(|(field, _)| field.clone())
        .chain(
            existing
                .payload
                .keys()
                .filter(|field| !change.payload.contains_key(field.as_str()))
                .cloned(),
        )
        .collect();

    fields.sort();
    fields
}

// =============================================================================
// Unit Tests
// =============================================================================
