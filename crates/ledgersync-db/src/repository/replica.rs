//! # Replica Record Repository
//!
//! The replicated rows themselves, keyed by (tenant, entity_type, identity).
//!
//! ## Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  insert_or_update (one transaction)                                    │
//! │                                                                         │
//! │  INSERT ... ON CONFLICT DO NOTHING                                     │
//! │       │                                                                 │
//! │       ├── 1 row  ──► Inserted                                          │
//! │       │                                                                 │
//! │       └── 0 rows (someone inserted first)                              │
//! │              │                                                          │
//! │              ▼                                                          │
//! │           compare-and-set UPDATE                                       │
//! │              ├── 1 row  ──► Updated                                    │
//! │              └── 0 rows ──► SkippedStale                               │
//! │                                                                         │
//! │  compare_and_set:  UPDATE ... WHERE revision < :rev                    │
//! │                    (unversioned: WHERE modified_at_ms < :modified)     │
//! │                                                                         │
//! │  soft_delete:      UPDATE ... SET sync_status = 'deleted',             │
//! │                    revision = MAX(revision, :rev)                      │
//! │                    WHERE not yet deleted at >= :rev                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The guard is part of the UPDATE statement, so concurrent appliers writing
//! the same identity need no external lock: the loser sees 0 rows affected.
//! Rows are never physically deleted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool};
use tracing::debug;

use super::{from_millis, to_i64, to_millis, to_u64};
use crate::error::DbResult;
use ledgersync_core::{
    ApplyOutcome, ChangeRecord, PartitionKey, Payload, ReplicaRecord, ReplicaStatus,
};

/// Row shape of `replica_records`.
#[derive(Debug, sqlx::FromRow)]
struct ReplicaRow {
    tenant: String,
    entity_type: String,
    identity: String,
    revision: i64,
    modified_at_ms: i64,
    sync_status: ReplicaStatus,
    payload: String,
    first_synced_at: DateTime<Utc>,
    last_synced_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl ReplicaRow {
    fn into_record(self) -> DbResult<ReplicaRecord> {
        let payload: Payload = serde_json::from_str(&self.payload)?;

        Ok(ReplicaRecord {
            tenant: self.tenant,
            entity_type: self.entity_type,
            identity: self.identity,
            revision: to_u64(self.revision)?,
            modified_at: from_millis(self.modified_at_ms)?,
            status: self.sync_status,
            payload,
            first_synced_at: self.first_synced_at,
            last_synced_at: self.last_synced_at,
            deleted_at: self.deleted_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT tenant, entity_type, identity, revision, modified_at_ms, sync_status,
           payload, first_synced_at, last_synced_at, deleted_at
    FROM replica_records
"#;

/// Active and deleted row totals for one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaCounts {
    pub active: u64,
    pub deleted: u64,
}

impl ReplicaCounts {
    pub fn total(&self) -> u64 {
        self.active + self.deleted
    }
}

/// Repository for replica rows.
#[derive(Debug, Clone)]
pub struct ReplicaRepository {
    pool: SqlitePool,
}

impl ReplicaRepository {
    /// Creates a new ReplicaRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReplicaRepository { pool }
    }

    /// Looks up the current row for an identity.
    pub async fn get(
        &self,
        partition: &PartitionKey,
        identity: &str,
    ) -> DbResult<Option<ReplicaRecord>> {
        let sql =
            format!("{SELECT_COLUMNS} WHERE tenant = ?1 AND entity_type = ?2 AND identity = ?3");

        let row = sqlx::query_as::<_, ReplicaRow>(&sql)
            .bind(&partition.tenant)
            .bind(&partition.entity_type)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ReplicaRow::into_record).transpose()
    }

    /// Inserts a new row; on an identity conflict falls through to the
    /// compare-and-set update inside the same transaction.
    ///
    /// ## Returns
    /// * `Inserted` - No row existed
    /// * `Updated` - A row existed and the change was newer
    /// * `SkippedStale` - A row existed with an equal or newer revision
    pub async fn insert_or_update(
        &self,
        change: &ChangeRecord,
        now: DateTime<Utc>,
    ) -> DbResult<ApplyOutcome> {
        let payload = serde_json::to_string(&change.payload)?;
        let revision = to_i64(change.revision)?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO replica_records (
                tenant, entity_type, identity, revision, modified_at_ms,
                sync_status, payload, first_synced_at, last_synced_at, deleted_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                'active', ?6, ?7, ?7, NULL
            )
            ON CONFLICT (tenant, entity_type, identity) DO NOTHING
            "#,
        )
        .bind(&change.tenant)
        .bind(&change.entity_type)
        .bind(&change.identity)
        .bind(revision)
        .bind(to_millis(change.modified_at))
        .bind(&payload)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let outcome = if inserted == 1 {
            ApplyOutcome::Inserted
        } else {
            debug!(
                identity = %change.identity,
                "Identity already present, degrading insert to update"
            );
            cas_update(&mut *tx, change, revision, &payload, now).await?
        };

        tx.commit().await?;

        debug!(
            tenant = %change.tenant,
            entity_type = %change.entity_type,
            identity = %change.identity,
            revision = change.revision,
            outcome = %outcome,
            "Replica insert"
        );

        Ok(outcome)
    }

    /// Overwrites the row only if the stored version is still older.
    ///
    /// ## Returns
    /// * `Updated` - Guard held, row overwritten (and re-activated if deleted)
    /// * `SkippedStale` - A newer or equal version is already stored
    pub async fn compare_and_set(
        &self,
        change: &ChangeRecord,
        now: DateTime<Utc>,
    ) -> DbResult<ApplyOutcome> {
        let payload = serde_json::to_string(&change.payload)?;
        let revision = to_i64(change.revision)?;

        let outcome = cas_update(&self.pool, change, revision, &payload, now).await?;

        debug!(
            identity = %change.identity,
            revision = change.revision,
            outcome = %outcome,
            "Replica compare-and-set"
        );

        Ok(outcome)
    }

    /// Marks the row deleted and lifts its revision to at least the change's.
    ///
    /// ## Returns
    /// * `Deleted` - The row was live, or deleted at an older revision
    /// * `Skipped` - Already deleted at this revision or later (no write)
    pub async fn soft_delete(
        &self,
        change: &ChangeRecord,
        now: DateTime<Utc>,
    ) -> DbResult<ApplyOutcome> {
        let revision = to_i64(change.revision)?;

        let affected = sqlx::query(
            r#"
            UPDATE replica_records SET
                sync_status = 'deleted',
                revision = MAX(revision, ?4),
                modified_at_ms = MAX(modified_at_ms, ?5),
                deleted_at = CASE WHEN sync_status = 'deleted' THEN deleted_at ELSE ?6 END,
                last_synced_at = ?6
            WHERE tenant = ?1 AND entity_type = ?2 AND identity = ?3
              AND (sync_status != 'deleted' OR revision < ?4)
            "#,
        )
        .bind(&change.tenant)
        .bind(&change.entity_type)
        .bind(&change.identity)
        .bind(revision)
        .bind(to_millis(change.modified_at))
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let outcome = if affected == 1 {
            ApplyOutcome::Deleted
        } else {
            ApplyOutcome::Skipped
        };

        debug!(
            identity = %change.identity,
            revision = change.revision,
            outcome = %outcome,
            "Replica soft delete"
        );

        Ok(outcome)
    }

    /// Counts active and deleted rows of a partition.
    pub async fn count(&self, partition: &PartitionKey) -> DbResult<ReplicaCounts> {
        let (active, deleted): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN sync_status = 'active' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'deleted' THEN 1 ELSE 0 END), 0)
            FROM replica_records
            WHERE tenant = ?1 AND entity_type = ?2
            "#,
        )
        .bind(&partition.tenant)
        .bind(&partition.entity_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(ReplicaCounts {
            active: to_u64(active)?,
            deleted: to_u64(deleted)?,
        })
    }

    /// Lists rows of a partition ordered by identity, including tombstones.
    pub async fn list(&self, partition: &PartitionKey, limit: u32) -> DbResult<Vec<ReplicaRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE tenant = ?1 AND entity_type = ?2 ORDER BY identity ASC LIMIT ?3"
        );

        let rows = sqlx::query_as::<_, ReplicaRow>(&sql)
            .bind(&partition.tenant)
            .bind(&partition.entity_type)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ReplicaRow::into_record).collect()
    }
}

/// The compare-and-set UPDATE shared by both write paths.
///
/// Versioned changes compare revisions; unversioned ones compare source
/// modification times. `revision` never decreases.
async fn cas_update<'e, E>(
    executor: E,
    change: &ChangeRecord,
    revision: i64,
    payload: &str,
    now: DateTime<Utc>,
) -> DbResult<ApplyOutcome>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let affected = sqlx::query(
        r#"
        UPDATE replica_records SET
            revision = MAX(revision, ?4),
            modified_at_ms = ?5,
            sync_status = 'active',
            payload = ?6,
            last_synced_at = ?7,
            deleted_at = NULL
        WHERE tenant = ?1 AND entity_type = ?2 AND identity = ?3
          AND ((?4 > 0 AND revision < ?4) OR (?4 = 0 AND modified_at_ms < ?5))
        "#,
    )
    .bind(&change.tenant)
    .bind(&change.entity_type)
    .bind(&change.identity)
    .bind(revision)
    .bind(to_millis(change.modified_at))
    .bind(payload)
    .bind(now)
    .execute(executor)
    .await?
    .rows_affected();

    Ok(if affected == 1 {
        ApplyOutcome::Updated
    } else {
        ApplyOutcome::SkippedStale
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
