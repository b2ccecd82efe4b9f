//! # Repository Module
//!
//! Database repository implementations for the replica.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repositories and Their Tables                        │
//! │                                                                         │
//! │  Engine                                                                │
//! │       │  db.replicas().compare_and_set(&change, now)                   │
//! │       ▼                                                                 │
//! │  ReplicaRepository    ──► replica_records                              │
//! │  WatermarkRepository  ──► sync_watermarks                              │
//! │  SyncRunRepository    ──► sync_runs                                    │
//! │  LeaseRepository      ──► sync_leases                                  │
//! │                                                                         │
//! │  Every guard that matters under concurrency (revision CAS,             │
//! │  monotonic watermark, one-shot finalize, lease expiry) lives in        │
//! │  the SQL WHERE clause, not in a read-then-write.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`replica::ReplicaRepository`] - Replica rows, insert-or-update, CAS, soft delete
//! - [`watermark::WatermarkRepository`] - Per-partition progress cursor
//! - [`sync_run::SyncRunRepository`] - Run audit trail
//! - [`lease::LeaseRepository`] - Per-partition exclusivity

pub mod lease;
pub mod replica;
pub mod sync_run;
pub mod watermark;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{DbError, DbResult};

// =============================================================================
// Column Conversions
// =============================================================================
// SQLite INTEGER is i64. Revisions and counts are u64 in the domain.

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DbResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DbError::Serialization(format!("timestamp out of range: {ms}")))
}

pub(crate) fn to_i64(value: u64) -> DbResult<i64> {
    i64::try_from(value)
        .map_err(|_| DbError::Serialization(format!("integer out of range: {value}")))
}

pub(crate) fn to_u64(value: i64) -> DbResult<u64> {
    u64::try_from(value)
        .map_err(|_| DbError::Serialization(format!("negative integer column: {value}")))
}
