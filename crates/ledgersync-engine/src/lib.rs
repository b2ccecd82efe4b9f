//! # ledgersync-engine: Reconciliation Engine
//!
//! Replicates master data (ledgers, stock items, ...) from an accounting
//! source into the local replica, one (tenant, entity type) partition at a
//! time.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Reconciliation Cycle                             │
//! │                                                                         │
//! │   ┌─────────────┐   RawBatch    ┌──────────────┐  ChangeRecord          │
//! │   │  Extractor  │──────────────►│  Normalizer  │──────────┐             │
//! │   │  (source)   │               │  (core)      │          │             │
//! │   └─────────────┘               └──────────────┘          ▼             │
//! │                                                   ┌──────────────┐      │
//! │   ┌─────────────┐   existing    ┌──────────────┐  │   dedupe     │      │
//! │   │  Replica    │──────────────►│  Resolver    │◄─│   (core)     │      │
//! │   │  (db)       │               │  (core)      │  └──────────────┘      │
//! │   └─────▲───────┘               └──────┬───────┘                        │
//! │         │            Action            │                                │
//! │         └───────── Applier ◄───────────┘                                │
//! │                                                                         │
//! │   Orchestrator: lease, SyncRun, watermark, retries, cancellation        │
//! │   Scheduler:    many partitions, bounded parallelism                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - TOML + environment configuration
//! - [`error`] - `SyncError` and the Transient / Data / Fatal taxonomy
//! - [`extractor`] - Extractor trait and the JSON export replayer
//! - [`retry`] - Bounded exponential backoff
//! - [`applier`] - Action execution against the replica
//! - [`recorder`] - SyncRun lifecycle
//! - [`orchestrator`] - One cycle for one partition
//! - [`scheduler`] - Cycles for many partitions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ledgersync_engine::{EngineConfig, JsonFileExtractor, Orchestrator};
//!
//! let config = EngineConfig::load(None)?;
//! let db = Arc::new(Database::new(config.db_config()).await?);
//! let extractor = Arc::new(JsonFileExtractor::new(&config.source.export_dir, normalizer));
//!
//! let orchestrator = Orchestrator::new(db, extractor, &config);
//! let run = orchestrator.run_cycle("Acme Traders", "ledger").await?;
//! println!("{} {:?}", run.status, run.counts);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod applier;
pub mod config;
pub mod error;
pub mod extractor;
pub mod orchestrator;
pub mod recorder;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use applier::{changed_fields, Applier, ApplyResult, ReplicaStore};
pub use config::{DatabaseSettings, EngineConfig, PartitionConfig, SourceSettings, SyncSettings};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use extractor::{
    BatchStream, ExtractError, ExtractRequest, Extractor, JsonFileExtractor, RawBatch,
};
pub use orchestrator::Orchestrator;
pub use recorder::RunRecorder;
pub use retry::RetryPolicy;
pub use scheduler::{run_all, CycleReport};
