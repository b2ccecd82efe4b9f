//! # Partition Lease Repository
//!
//! Keeps at most one cycle per (tenant, entity_type) in flight, across
//! processes sharing the database file.
//!
//! ## Lease Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  try_acquire(holder, ttl)                                              │
//! │     INSERT ... ON CONFLICT DO UPDATE ... WHERE expires_at_ms < now     │
//! │       ├── row written  ──► acquired (fresh, or taken over from a       │
//! │       │                    holder whose lease expired)                 │
//! │       └── 0 rows       ──► held by someone else: CONCURRENT_RUN        │
//! │                                                                         │
//! │  renew(holder, ttl)    between batches; false = lease lost             │
//! │  release(holder)       on every exit path                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//! The TTL bounds how long a crashed holder blocks its partition.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::to_millis;
use crate::error::DbResult;
use ledgersync_core::PartitionKey;

/// Repository for partition leases.
#[derive(Debug, Clone)]
pub struct LeaseRepository {
    pool: SqlitePool,
}

impl LeaseRepository {
    /// Creates a new LeaseRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LeaseRepository { pool }
    }

    /// Takes the partition lease if it is free or expired.
    ///
    /// ## Returns
    /// * `true` - `holder` now owns the lease until `now + ttl`
    /// * `false` - Another holder owns an unexpired lease (nothing written)
    pub async fn try_acquire(
        &self,
        partition: &PartitionKey,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let acquired = sqlx::query(
            r#"
            INSERT INTO sync_leases (tenant, entity_type, holder, acquired_at, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (tenant, entity_type) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at_ms = excluded.expires_at_ms
            WHERE sync_leases.expires_at_ms <= ?6
            "#,
        )
        .bind(&partition.tenant)
        .bind(&partition.entity_type)
        .bind(holder)
        .bind(now)
        .bind(to_millis(now + ttl))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        debug!(partition = %partition, holder, acquired, "Lease acquire attempt");
        Ok(acquired)
    }

    /// Extends a lease still owned by `holder`.
    ///
    /// ## Returns
    /// `false` if the lease expired and was taken over by another holder.
    pub async fn renew(
        &self,
        partition: &PartitionKey,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let renewed = sqlx::query(
            r#"
            UPDATE sync_leases SET expires_at_ms = ?4
            WHERE tenant = ?1 AND entity_type = ?2 AND holder = ?3
            "#,
        )
        .bind(&partition.tenant)
        .bind(&partition.entity_type)
        .bind(holder)
        .bind(to_millis(now + ttl))
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        Ok(renewed)
    }

    /// Drops the lease if `holder` still owns it.
    pub async fn release(&self, partition: &PartitionKey, holder: &str) -> DbResult<bool> {
        let released = sqlx::query(
            "DELETE FROM sync_leases WHERE tenant = ?1 AND entity_type = ?2 AND holder = ?3",
        )
        .bind(&partition.tenant)
        .bind(&partition.entity_type)
        .bind(holder)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        debug!(partition = %partition, holder, released, "Lease released");
        Ok(released)
    }

    /// Returns the current holder, if the lease is held and unexpired.
    pub async fn holder(
        &self,
        partition: &PartitionKey,
        now: DateTime<Utc>,
    ) -> DbResult<Option<String>> {
        let holder = sqlx::query_scalar::<_, String>(
            r#"
            SELECT holder FROM sync_leases
            WHERE tenant = ?1 AND entity_type = ?2 AND expires_at_ms > ?3
            "#,
        )
        .bind(&partition.tenant)
        .bind(&partition.entity_type)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(holder)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
