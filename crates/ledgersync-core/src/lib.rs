//! # ledgersync-core: Pure Reconciliation Logic
//!
//! This crate holds the decision-making half of the replication engine as
//! pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Ledgersync Data Flow                             │
//! │                                                                         │
//! │  Extractor (raw source records, external)                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              ★ ledgersync-core (THIS CRATE) ★                   │   │
//! │  │                                                                 │   │
//! │  │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌───────────┐ │   │
//! │  │  │ normalizer │─►│   batch    │─►│  resolver  │  │   types   │ │   │
//! │  │  │ raw → Chg  │  │ de-dup,    │  │ Chg + Rep  │  │ Watermark │ │   │
//! │  │  │            │  │ watermark  │  │  → Action  │  │ SyncRun   │ │   │
//! │  │  └────────────┘  └────────────┘  └────────────┘  └───────────┘ │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ledgersync-engine (Applier, Orchestrator) → ledgersync-db (SQLite)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Data model (ChangeRecord, ReplicaRecord, Watermark, SyncRun)
//! - [`resolver`] - Decides INSERT / UPDATE / DELETE / SKIP per record
//! - [`normalizer`] - Maps raw source records to canonical change records
//! - [`batch`] - Per-batch de-duplication and watermark advancement
//! - [`validation`] - Partition key and identity checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use ledgersync_core::{resolve, Action, ChangeRecord, PartitionKey};
//!
//! let partition = PartitionKey::new("acme", "ledger");
//! let modified = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
//! let change = ChangeRecord::new(&partition, "A", 1, modified, false);
//!
//! // Nothing in the replica yet
//! assert_eq!(resolve(&change, None), Action::Insert);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod batch;
pub mod error;
pub mod normalizer;
pub mod resolver;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use batch::{advance_watermark, dedupe, DedupOutcome};
pub use error::{CoreError, CoreResult, ValidationError};
pub use normalizer::{FieldMapping, Normalizer, RawRecord};
pub use resolver::resolve;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum length of a source identity (GUID).
pub const MAX_IDENTITY_LEN: usize = 255;

/// Maximum length of a tenant key (company name at the source).
pub const MAX_TENANT_LEN: usize = 255;

/// Maximum length of an entity type key ("ledger", "stock_item", ...).
pub const MAX_ENTITY_TYPE_LEN: usize = 50;

/// Maximum length of a persisted run error summary.
pub const MAX_ERROR_SUMMARY_LEN: usize = 1000;
