//! # Watermark Repository
//!
//! One row per (tenant, entity_type) recording the latest fully applied
//! point in the source's change stream.
//!
//! ## Lifecycle
//! ```text
//!   (absent) ──first committed batch──► present ──advance──► present
//!       ▲                                   │
//!       └──────────── reset (operator full resync) ◄────────┘
//! ```
//!
//! `advance` is a monotonic upsert: both the modification-time and revision
//! components only move forward, enforced by `MAX()` in SQL so a late writer
//! can never roll the watermark back.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{from_millis, to_i64, to_millis, to_u64};
use crate::error::{DbError, DbResult};
use ledgersync_core::{PartitionKey, Watermark};

#[derive(Debug, sqlx::FromRow)]
struct WatermarkRow {
    tenant: String,
    entity_type: String,
    last_modified_ms: i64,
    last_revision_seen: i64,
    cursor_token: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WatermarkRow> for Watermark {
    type Error = DbError;

    fn try_from(row: WatermarkRow) -> DbResult<Self> {
        Ok(Watermark {
            tenant: row.tenant,
            entity_type: row.entity_type,
            last_modified_seen: from_millis(row.last_modified_ms)?,
            last_revision_seen: to_u64(row.last_revision_seen)?,
            cursor_token: row.cursor_token,
            updated_at: row.updated_at,
        })
    }
}

/// Repository for per-partition watermarks.
#[derive(Debug, Clone)]
pub struct WatermarkRepository {
    pool: SqlitePool,
}

impl WatermarkRepository {
    /// Creates a new WatermarkRepository.
    pub fn new(pool: SqlitePool) -> Self {
        WatermarkRepository { pool }
    }

    /// Returns the watermark, or `None` if the partition was never synced
    /// (or was reset).
    pub async fn get(&self, partition: &PartitionKey) -> DbResult<Option<Watermark>> {
        let row = sqlx::query_as::<_, WatermarkRow>(
            r#"
            SELECT tenant, entity_type, last_modified_ms, last_revision_seen,
                   cursor_token, updated_at
            FROM sync_watermarks
            WHERE tenant = ?1 AND entity_type = ?2
            "#,
        )
        .bind(&partition.tenant)
        .bind(&partition.entity_type)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Watermark::try_from).transpose()
    }

    /// Stores `watermark`, never moving the persisted value backwards.
    ///
    /// ## Returns
    /// The watermark as stored after the upsert.
    pub async fn advance(&self, watermark: &Watermark) -> DbResult<Watermark> {
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (
                tenant, entity_type, last_modified_ms, last_revision_seen,
                cursor_token, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (tenant, entity_type) DO UPDATE SET
                last_modified_ms =
                    MAX(sync_watermarks.last_modified_ms, excluded.last_modified_ms),
                last_revision_seen =
                    MAX(sync_watermarks.last_revision_seen, excluded.last_revision_seen),
                cursor_token = COALESCE(excluded.cursor_token, sync_watermarks.cursor_token),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&watermark.tenant)
        .bind(&watermark.entity_type)
        .bind(to_millis(watermark.last_modified_seen))
        .bind(to_i64(watermark.last_revision_seen)?)
        .bind(&watermark.cursor_token)
        .bind(watermark.updated_at)
        .execute(&self.pool)
        .await?;

        let partition = watermark.partition();
        let stored = self
            .get(&partition)
            .await?
            .ok_or_else(|| DbError::not_found("Watermark", partition.to_string()))?;

        debug!(
            partition = %partition,
            last_modified_seen = %stored.last_modified_seen,
            last_revision_seen = stored.last_revision_seen,
            "Watermark advanced"
        );

        Ok(stored)
    }

    /// Removes the watermark so the next cycle runs in full mode.
    ///
    /// ## Returns
    /// `true` if a watermark existed.
    pub async fn reset(&self, partition: &PartitionKey) -> DbResult<bool> {
        let removed =
            sqlx::query("DELETE FROM sync_watermarks WHERE tenant = ?1 AND entity_type = ?2")
                .bind(&partition.tenant)
                .bind(&partition.entity_type)
                .execute(&self.pool)
                .await?
            .rows_affected();

        info!(partition = %partition, removed = removed > 0, "Watermark reset");
        Ok(removed > 0)
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

    fn watermark(modified: DateTime<Utc>, revision: u64, cursor: Option<&str>) -> Watermark {
        Watermark {
            tenant: "acme".into(),
            entity_type: "ledger".into(),
            last_modified_seen: modified,
            last_revision_seen: revision,
            cursor_token: cursor.map(str::to_string),
            updated_at: t0(),
        }
    }

    async fn repo() -> WatermarkRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().watermarks()
    }

    #[tokio::test]
    async fn test_absent_until_first_advance() {
        let repo = repo().await;
        let partition = PartitionKey::new("acme", "ledger");
        assert!(repo.get(&partition).await.unwrap().is_none());

        let stored = repo.advance(&watermark(t0(), 10, Some("p1"))).await.unwrap();
        assert_eq!(stored, watermark(t0(), 10, Some("p1")));
        assert_eq!(repo.get(&partition).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_advance_never_moves_backwards() {
        let repo = repo().await;
        repo.advance(&watermark(t0() + Duration::days(2), 50, Some("p9"))).await.unwrap();

        let stored = repo.advance(&watermark(t0(), 7, None)).await.unwrap();
        assert_eq!(stored.last_modified_seen, t0() + Duration::days(2));
        assert_eq!(stored.last_revision_seen, 50);
        assert_eq!(stored.cursor_token.as_deref(), Some("p9"));

        let stored = repo.advance(&watermark(t0() + Duration::days(3), 60, None)).await.unwrap();
        assert_eq!(stored.last_modified_seen, t0() + Duration::days(3));
        assert_eq!(stored.last_revision_seen, 60);
    }

    #[tokio::test]
    async fn test_reset_removes_only_that_partition() {
        let repo = repo().await;
        repo.advance(&watermark(t0(), 1, None)).await.unwrap();
        let mut stock = watermark(t0(), 1, None);
        stock.entity_type = "stock_item".into();
        repo.advance(&stock).await.unwrap();

        let ledger = PartitionKey::new("acme", "ledger");
        assert!(repo.reset(&ledger).await.unwrap());
        assert!(!repo.reset(&ledger).await.unwrap());
        assert!(repo.get(&ledger).await.unwrap().is_none());
        assert!(repo.get(&stock.partition()).await.unwrap().is_some());
    }
}
