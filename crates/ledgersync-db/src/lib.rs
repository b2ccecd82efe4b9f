//! # ledgersync-db: Database Layer for Ledgersync
//!
//! SQLite persistence for the replica, its watermarks, the sync run audit
//! trail and partition leases, using sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Ledgersync Data Flow                             │
//! │                                                                         │
//! │  ledgersync-engine (Orchestrator, Applier, Recorder)                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  ledgersync-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │  │   │
//! │  │   │               │    │ ReplicaRepo    │   │              │  │   │
//! │  │   │ SqlitePool    │◄───│ WatermarkRepo  │   │ 001_replica_ │  │   │
//! │  │   │ WAL + busy    │    │ SyncRunRepo    │   │   schema.sql │  │   │
//! │  │   │ timeout       │    │ LeaseRepo      │   │              │  │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (replica.db)                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types and transient classification
//! - [`repository`] - Replica, watermark, sync run and lease repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ledgersync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("./replica.db")).await?;
//!
//! let partition = PartitionKey::new("acme", "ledger");
//! let counts = db.replicas().count(&partition).await?;
//! let latest = db.runs().latest(&partition).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::lease::LeaseRepository;
pub use repository::replica::{ReplicaCounts, ReplicaRepository};
pub use repository::sync_run::SyncRunRepository;
pub use repository::watermark::WatermarkRepository;
