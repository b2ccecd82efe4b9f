//! # Sync Run Repository
//!
//! Audit trail of orchestration cycles.
//!
//! ## Guarded Writes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  create          INSERT (status = in_progress)                          │
//! │  update_counts   UPDATE ... WHERE run_id = ? AND status = in_progress   │
//! │  finalize        UPDATE ... WHERE run_id = ? AND status = in_progress   │
//! │                                                                         │
//! │  Once a run leaves in_progress no statement here can touch it again:    │
//! │  the guard matches 0 rows and the call reports `false`.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use super::{to_i64, to_u64};
use crate::error::DbResult;
use ledgersync_core::{PartitionKey, RunCounts, RunStatus, SyncMode, SyncRun};

#[derive(Debug, sqlx::FromRow)]
struct SyncRunRow {
    run_id: String,
    tenant: String,
    entity_type: String,
    mode: SyncMode,
    status: RunStatus,
    seen: i64,
    inserted: i64,
    updated: i64,
    deleted: i64,
    skipped: i64,
    failed: i64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_summary: Option<String>,
}

impl SyncRunRow {
    fn into_run(self) -> DbResult<SyncRun> {
        Ok(SyncRun {
            run_id: self.run_id,
            tenant: self.tenant,
            entity_type: self.entity_type,
            mode: self.mode,
            status: self.status,
            counts: RunCounts {
                seen: to_u64(self.seen)?,
                inserted: to_u64(self.inserted)?,
                updated: to_u64(self.updated)?,
                deleted: to_u64(self.deleted)?,
                skipped: to_u64(self.skipped)?,
                failed: to_u64(self.failed)?,
            },
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_summary: self.error_summary,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT run_id, tenant, entity_type, mode, status,
           seen, inserted, updated, deleted, skipped, failed,
           started_at, completed_at, error_summary
    FROM sync_runs
"#;

/// Counts as bindable integers, in column order.
fn count_columns(counts: &RunCounts) -> DbResult<[i64; 6]> {
    Ok([
        to_i64(counts.seen)?,
        to_i64(counts.inserted)?,
        to_i64(counts.updated)?,
        to_i64(counts.deleted)?,
        to_i64(counts.skipped)?,
        to_i64(counts.failed)?,
    ])
}

/// Repository for sync run records.
#[derive(Debug, Clone)]
pub struct SyncRunRepository {
    pool: SqlitePool,
}

impl SyncRunRepository {
    /// Creates a new SyncRunRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncRunRepository { pool }
    }

    /// Inserts a freshly started run.
    pub async fn create(&self, run: &SyncRun) -> DbResult<()> {
        let [seen, inserted, updated, deleted, skipped, failed] = count_columns(&run.counts)?;

        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                run_id, tenant, entity_type, mode, status,
                seen, inserted, updated, deleted, skipped, failed,
                started_at, completed_at, error_summary
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14
            )
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.tenant)
        .bind(&run.entity_type)
        .bind(run.mode)
        .bind(run.status)
        .bind(seen)
        .bind(inserted)
        .bind(updated)
        .bind(deleted)
        .bind(skipped)
        .bind(failed)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error_summary)
        .execute(&self.pool)
        .await?;

        debug!(
            run_id = %run.run_id,
            tenant = %run.tenant,
            entity_type = %run.entity_type,
            mode = %run.mode,
            "Sync run created"
        );

        Ok(())
    }

    /// Persists in-flight counts.
    ///
    /// ## Returns
    /// `false` if the run is no longer `in_progress` (nothing written).
    pub async fn update_counts(&self, run_id: &str, counts: &RunCounts) -> DbResult<bool> {
        let [seen, inserted, updated, deleted, skipped, failed] = count_columns(counts)?;

        let affected = sqlx::query(
            r#"
            UPDATE sync_runs SET
                seen = ?2, inserted = ?3, updated = ?4,
                deleted = ?5, skipped = ?6, failed = ?7
            WHERE run_id = ?1 AND status = 'in_progress'
            "#,
        )
        .bind(run_id)
        .bind(seen)
        .bind(inserted)
        .bind(updated)
        .bind(deleted)
        .bind(skipped)
        .bind(failed)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    /// Writes the terminal state of `run` exactly once.
    ///
    /// ## Returns
    /// `false` if the stored run had already left `in_progress`.
    pub async fn finalize(&self, run: &SyncRun) -> DbResult<bool> {
        let [seen, inserted, updated, deleted, skipped, failed] = count_columns(&run.counts)?;

        let affected = sqlx::query(
            r#"
            UPDATE sync_runs SET
                status = ?2,
                seen = ?3, inserted = ?4, updated = ?5,
                deleted = ?6, skipped = ?7, failed = ?8,
                completed_at = ?9,
                error_summary = ?10
            WHERE run_id = ?1 AND status = 'in_progress'
            "#,
        )
        .bind(&run.run_id)
        .bind(run.status)
        .bind(seen)
        .bind(inserted)
        .bind(updated)
        .bind(deleted)
        .bind(skipped)
        .bind(failed)
        .bind(run.completed_at)
        .bind(&run.error_summary)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            warn!(run_id = %run.run_id, "Run already finalized, ignoring");
        }

        Ok(affected == 1)
    }

    /// Fails every `in_progress` run of a partition.
    ///
    /// Called by the holder of a freshly acquired lease: any run still in
    /// progress belonged to a holder that died without finalizing.
    ///
    /// ## Returns
    /// Number of runs closed.
    pub async fn abandon_in_progress(
        &self,
        partition: &PartitionKey,
        summary: &str,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let closed = sqlx::query(
            r#"
            UPDATE sync_runs SET
                status = 'failed',
                completed_at = ?3,
                error_summary = ?4
            WHERE tenant = ?1 AND entity_type = ?2 AND status = 'in_progress'
            "#,
        )
        .bind(&partition.tenant)
        .bind(&partition.entity_type)
        .bind(now)
        .bind(summary)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if closed > 0 {
            warn!(partition = %partition, closed, "Closed abandoned sync runs");
        }

        Ok(closed)
    }

    /// Fetches one run by id.
    pub async fn get(&self, run_id: &str) -> DbResult<Option<SyncRun>> {
        let sql = format!("{SELECT_COLUMNS} WHERE run_id = ?1");

        let row = sqlx::query_as::<_, SyncRunRow>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SyncRunRow::into_run).transpose()
    }

    /// Lists runs of a partition, newest first.
    pub async fn list(&self, partition: &PartitionKey, limit: u32) -> DbResult<Vec<SyncRun>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE tenant = ?1 AND entity_type = ?2 \
             ORDER BY started_at DESC, rowid DESC LIMIT ?3"
        );

        let rows = sqlx::query_as::<_, SyncRunRow>(&sql)
            .bind(&partition.tenant)
            .bind(&partition.entity_type)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SyncRunRow::into_run).collect()
    }

    /// Returns the most recent run of a partition.
    pub async fn latest(&self, partition: &PartitionKey) -> DbResult<Option<SyncRun>> {
        Ok(self.list(partition, 1).await?.into_iter().next())
    }

    /// Counts runs of a partition still `in_progress`.
    pub async fn count_in_progress(&self, partition: &PartitionKey) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sync_runs
            WHERE tenant = ?1 AND entity_type = ?2 AND status = 'in_progress'
            "#,
        )
        .bind(&partition.tenant)
        .bind(&partition.entity_type)
        .fetch_one(&self.pool)
        .await?;

        to_u64(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn partition() -> PartitionKey {
        PartitionKey::new("acme", "ledger")
    }

    async fn repo() -> SyncRunRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().runs()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = repo().await;
        let run = SyncRun::start("run-1", &partition(), SyncMode::Full, t0());
        repo.create(&run).await.unwrap();

        let stored = repo.get("run-1").await.unwrap().unwrap();
        assert_eq!(stored, run);
        assert!(repo.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalize_is_one_shot() {
        let repo = repo().await;
        let mut run = SyncRun::start("run-1", &partition(), SyncMode::Incremental, t0());
        repo.create(&run).await.unwrap();

        run.counts.seen = 3;
        run.counts.inserted = 2;
        run.counts.failed = 1;
        assert!(repo.update_counts(&run.run_id, &run.counts).await.unwrap());
        assert_eq!(repo.get("run-1").await.unwrap().unwrap().counts.inserted, 2);

        run.finalize(RunStatus::PartialFailure, Some("bad date on X".into()), t0())
            .unwrap();
        assert!(repo.finalize(&run).await.unwrap());

        // A second finalize or late count update changes nothing.
        let mut late = run.clone();
        late.status = RunStatus::Success;
        late.error_summary = None;
        assert!(!repo.finalize(&late).await.unwrap());
        assert!(!repo.update_counts(&run.run_id, &RunCounts::default()).await.unwrap());

        let stored = repo.get("run-1").await.unwrap().unwrap();
        assert_eq!(stored, run);
    }

    #[tokio::test]
    async fn test_list_newest_first_and_latest() {
        let repo = repo().await;
        for (i, id) in ["r1", "r2", "r3"].iter().enumerate() {
            let started = t0() + Duration::minutes(i as i64);
            let run = SyncRun::start(*id, &partition(), SyncMode::Full, started);
            repo.create(&run).await.unwrap();
        }
        let globex = PartitionKey::new("globex", "ledger");
        let other = SyncRun::start("x1", &globex, SyncMode::Full, t0());
        repo.create(&other).await.unwrap();

        let ids: Vec<_> = repo
            .list(&partition(), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["r3", "r2", "r1"]);

        assert_eq!(repo.latest(&partition()).await.unwrap().unwrap().run_id, "r3");
        assert!(repo.latest(&PartitionKey::new("nobody", "ledger")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandon_in_progress() {
        let repo = repo().await;
        let stale = SyncRun::start("stale", &partition(), SyncMode::Full, t0());
        repo.create(&stale).await.unwrap();

        let mut done = SyncRun::start("done", &partition(), SyncMode::Full, t0());
        repo.create(&done).await.unwrap();
        done.finalize(RunStatus::Success, None, t0()).unwrap();
        repo.finalize(&done).await.unwrap();

        assert_eq!(repo.count_in_progress(&partition()).await.unwrap(), 1);
        let closed = repo.abandon_in_progress(&partition(), "abandoned", t0()).await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(repo.count_in_progress(&partition()).await.unwrap(), 0);

        let stale = repo.get("stale").await.unwrap().unwrap();
        assert_eq!(stale.status, RunStatus::Failed);
        assert_eq!(stale.error_summary.as_deref(), Some("abandoned"));
        assert_eq!(repo.get("done").await.unwrap().unwrap().status, RunStatus::Success);
    }
}
