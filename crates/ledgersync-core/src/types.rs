//! # Domain Types
//!
//! The data model of the reconciliation engine.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  ChangeRecord   │   │  ReplicaRecord  │   │   Watermark     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  identity       │   │  identity       │   │  tenant         │       │
//! │  │  revision       │──►│  revision       │   │  entity_type    │       │
//! │  │  modified_at    │   │  status         │   │  last_modified  │       │
//! │  │  deleted        │   │  first_synced   │   │  last_revision  │       │
//! │  │  payload        │   │  last_synced    │   │  cursor_token   │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    SyncRun      │   │   RunStatus     │   │     Action      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  run_id         │   │  InProgress     │   │  Insert         │       │
//! │  │  mode           │   │  Success        │   │  Update         │       │
//! │  │  counts         │   │  PartialFailure │   │  Delete         │       │
//! │  │  status         │   │  Failed         │   │  Skip           │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Partitioning
//! Every record, watermark and run is keyed by a [`PartitionKey`]
//! (tenant + entity type). Replica rows are additionally keyed by identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

/// Entity-specific payload fields, opaque to the reconciliation engine.
pub type Payload = Map<String, Value>;

// =============================================================================
// Partition Key
// =============================================================================

/// One (tenant, entity type) partition of the replica.
///
/// Cycles for different partitions are fully independent; at most one cycle
/// per partition runs at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PartitionKey {
    pub tenant: String,
    pub entity_type: String,
}

impl PartitionKey {
    pub fn new(tenant: impl Into<String>, entity_type: impl Into<String>) -> Self {
        PartitionKey {
            tenant: tenant.into(),
            entity_type: entity_type.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.entity_type)
    }
}

// =============================================================================
// Change Record
// =============================================================================

/// Canonical unit processed by the engine.
///
/// Produced by the [`Normalizer`](crate::normalizer::Normalizer) from a raw
/// source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub tenant: String,
    pub entity_type: String,

    /// Source-assigned identity (GUID), immutable for the record's lifetime.
    pub identity: String,

    /// Per-identity revision counter (alter id). 0 means unversioned.
    pub revision: u64,

    /// Last mutation time at the source.
    pub modified_at: DateTime<Utc>,

    /// Soft-delete flag from the source.
    pub deleted: bool,

    /// Entity-specific fields.
    #[serde(default)]
    pub payload: Payload,
}

impl ChangeRecord {
    /// Creates a change record with an empty payload.
    pub fn new(
        partition: &PartitionKey,
        identity: impl Into<String>,
        revision: u64,
        modified_at: DateTime<Utc>,
        deleted: bool,
    ) -> Self {
        ChangeRecord {
            tenant: partition.tenant.clone(),
            entity_type: partition.entity_type.clone(),
            identity: identity.into(),
            revision,
            modified_at,
            deleted,
            payload: Payload::new(),
        }
    }

    /// Replaces the payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Returns true if the source assigned a revision to this record.
    #[inline]
    pub fn is_versioned(&self) -> bool {
        self.revision > 0
    }

    /// Returns the partition this record belongs to.
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.tenant.clone(), self.entity_type.clone())
    }

    /// Ordering used to pick the newest delivery of an identity.
    ///
    /// Revision first; among equal revisions (including unversioned records)
    /// the later modification time wins.
    #[inline]
    pub fn ordering_key(&self) -> (u64, DateTime<Utc>) {
        (self.revision, self.modified_at)
    }
}

// =============================================================================
// Replica Record
// =============================================================================

/// Sync status of a replica row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    #[default]
    Active,
    /// Soft-deleted: the row is retained, never physically removed.
    Deleted,
}

impl ReplicaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaStatus::Active => "active",
            ReplicaStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted counterpart of a [`ChangeRecord`].
///
/// ## Invariants
/// - At most one row per (tenant, entity_type, identity)
/// - `revision` is never decreased by a sync operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub tenant: String,
    pub entity_type: String,
    pub identity: String,
    pub revision: u64,

    /// Source modification time of the applied change.
    pub modified_at: DateTime<Utc>,

    pub status: ReplicaStatus,
    pub payload: Payload,
    pub first_synced_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,

    /// When the row was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ReplicaRecord {
    /// Returns true if the row is soft-deleted.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.status == ReplicaStatus::Deleted
    }
}

// =============================================================================
// Actions and Outcomes
// =============================================================================

/// Decision produced by the resolver for one change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Insert,
    Update,
    Delete,
    Skip,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Insert => write!(f, "insert"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
            Action::Skip => write!(f, "skip"),
        }
    }
}

/// What actually happened in the store when an action was applied.
///
/// An `Insert` may end up `Updated` (concurrent insert of the same identity)
/// and an `Update` may end up `SkippedStale` (a newer revision landed first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Deleted,
    Skipped,
    SkippedStale,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Inserted => write!(f, "inserted"),
            ApplyOutcome::Updated => write!(f, "updated"),
            ApplyOutcome::Deleted => write!(f, "deleted"),
            ApplyOutcome::Skipped => write!(f, "skipped"),
            ApplyOutcome::SkippedStale => write!(f, "skipped_stale"),
        }
    }
}

// =============================================================================
// Watermark
// =============================================================================

/// Per-partition cursor marking the latest fully processed point.
///
/// Created on the first successful batch of a partition, advanced only after
/// a full batch is applied, removed only by an explicit full resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Watermark {
    pub tenant: String,
    pub entity_type: String,

    /// Maximum `modified_at` among applied records.
    #[ts(as = "String")]
    pub last_modified_seen: DateTime<Utc>,

    /// Maximum revision among applied records.
    pub last_revision_seen: u64,

    /// Opaque continuation token when the extractor paginates.
    pub cursor_token: Option<String>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.tenant.clone(), self.entity_type.clone())
    }
}

// =============================================================================
// Sync Run
// =============================================================================

/// Whether a cycle starts from scratch or from a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No watermark: extract everything.
    #[default]
    Full,
    /// Extract changes at or after the watermark.
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Lifecycle of a SyncRun.
///
/// ```text
/// in_progress ──► success
///      │
///      ├────────► partial_failure
///      │
///      └────────► failed
/// ```
/// Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    InProgress,
    Success,
    PartialFailure,
    Failed,
}

impl RunStatus {
    /// Returns true once the run can no longer change.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }

    /// Returns true if `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(self, RunStatus::InProgress) && next.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RunCounts {
    /// Records received from the extractor (before de-duplication).
    pub seen: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl RunCounts {
    /// Tallies one applied record.
    pub fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Skipped | ApplyOutcome::SkippedStale => self.skipped += 1,
        }
    }

    /// Number of records that mutated the replica.
    pub fn mutations(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Audit record of one orchestration cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncRun {
    pub run_id: String,
    pub tenant: String,
    pub entity_type: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub counts: RunCounts,
    #[ts(as = "String")]
    pub started_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
    pub error_summary: Option<String>,
}

impl SyncRun {
    /// Creates a run in `in_progress`.
    pub fn start(
        run_id: impl Into<String>,
        partition: &PartitionKey,
        mode: SyncMode,
        now: DateTime<Utc>,
    ) -> Self {
        SyncRun {
            run_id: run_id.into(),
            tenant: partition.tenant.clone(),
            entity_type: partition.entity_type.clone(),
            mode,
            status: RunStatus::InProgress,
            counts: RunCounts::default(),
            started_at: now,
            completed_at: None,
            error_summary: None,
        }
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.tenant.clone(), self.entity_type.clone())
    }

    /// Moves the run into a terminal state.
    ///
    /// ## Errors
    /// `CoreError::InvalidRunTransition` if the run is already terminal or
    /// `status` is `InProgress`.
    pub fn finalize(
        &mut self,
        status: RunStatus,
        error_summary: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if !self.status.can_transition_to(status) {
            return Err(CoreError::InvalidRunTransition {
                from: self.status,
                to: status,
            });
        }

        self.status = status;
        self.error_summary = error_summary;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Status a completed (not aborted) run should finish with.
    pub fn completion_status(&self) -> RunStatus {
        if self.counts.failed == 0 {
            RunStatus::Success
        } else {
            RunStatus::PartialFailure
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_partition_display() {
        let key = PartitionKey::new("acme", "ledger");
        assert_eq!(key.to_string(), "acme/ledger");
    }

    #[test]
    fn test_ordering_key_prefers_revision_then_time() {
        let p = PartitionKey::new("acme", "ledger");
        let older = ChangeRecord::new(&p, "A", 3, ts(), false);
        let newer_time = ChangeRecord::new(&p, "A", 3, ts() + chrono::Duration::days(1), false);
        let higher_rev = ChangeRecord::new(&p, "A", 4, ts(), false);

        assert!(newer_time.ordering_key() > older.ordering_key());
        assert!(higher_rev.ordering_key() > newer_time.ordering_key());
    }

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::InProgress.can_transition_to(RunStatus::Success));
        assert!(RunStatus::InProgress.can_transition_to(RunStatus::PartialFailure));
        assert!(RunStatus::InProgress.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::InProgress.can_transition_to(RunStatus::InProgress));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Success));
    }

    #[test]
    fn test_finalize_is_one_shot() {
        let p = PartitionKey::new("acme", "ledger");
        let mut run = SyncRun::start("run-1", &p, SyncMode::Full, ts());

        run.finalize(RunStatus::Success, None, ts()).unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.completed_at, Some(ts()));

        let err = run.finalize(RunStatus::Failed, Some("late".into()), ts());
        assert!(err.is_err());
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.error_summary.is_none());
    }

    #[test]
    fn test_counts_and_completion_status() {
        let p = PartitionKey::new("acme", "ledger");
        let mut run = SyncRun::start("run-1", &p, SyncMode::Incremental, ts());

        run.counts.record(ApplyOutcome::Inserted);
        run.counts.record(ApplyOutcome::SkippedStale);
        run.counts.record(ApplyOutcome::Deleted);
        assert_eq!(run.counts.skipped, 1);
        assert_eq!(run.counts.mutations(), 2);
        assert_eq!(run.completion_status(), RunStatus::Success);

        run.counts.failed += 1;
        assert_eq!(run.completion_status(), RunStatus::PartialFailure);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::PartialFailure).unwrap();
        assert_eq!(json, "\"partial_failure\"");
        let mode: SyncMode = serde_json::from_str("\"incremental\"").unwrap();
        assert_eq!(mode, SyncMode::Incremental);
    }
}
