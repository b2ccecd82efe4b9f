//! # Sync Error Types
//!
//! Error types for sync cycles and their classification.
//!
//! ## Error Taxonomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Classes                                │
//! │                                                                         │
//! │  ┌─────────────────────┐ ┌─────────────────────┐ ┌───────────────────┐ │
//! │  │     TRANSIENT       │ │        DATA         │ │      FATAL        │ │
//! │  │                     │ │                     │ │                   │ │
//! │  │ SQLite busy/locked  │ │ Malformed record    │ │ Extractor auth    │ │
//! │  │ Pool exhausted      │ │ Missing field       │ │ Protocol error    │ │
//! │  │ Connection lost     │ │ Constraint failure  │ │ Lease conflict    │ │
//! │  │ Extractor network   │ │                     │ │ Cancel / timeout  │ │
//! │  │                     │ │                     │ │ Config errors     │ │
//! │  ├─────────────────────┤ ├─────────────────────┤ ├───────────────────┤ │
//! │  │ retried with backoff│ │ record counted      │ │ cycle aborted,    │ │
//! │  │ for the one record  │ │ failed, cycle goes  │ │ run `failed`,     │ │
//! │  │                     │ │ on                  │ │ watermark kept    │ │
//! │  └─────────────────────┘ └─────────────────────┘ └───────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use thiserror::Error;

use ledgersync_core::{CoreError, ValidationError};
use ledgersync_db::DbError;

use crate::extractor::ExtractError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying the same record or batch.
    Transient,
    /// The record is bad; count it failed and move on.
    Data,
    /// The cycle cannot continue.
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Data => write!(f, "data"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Sync error type covering all cycle failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Cycle Errors
    // =========================================================================
    /// Another cycle holds the partition lease.
    #[error("CONCURRENT_RUN: a cycle for {partition} is already in progress")]
    ConcurrentRun { partition: String },

    /// The partition lease expired and was taken by another holder.
    #[error("Lease for {partition} was lost")]
    LeaseLost { partition: String },

    /// Operator abort.
    #[error("Cycle cancelled")]
    Cancelled,

    /// The cycle ran past its configured timeout.
    #[error("Cycle timed out after {0} ms")]
    Timeout(u64),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Extractor failure.
    #[error("Extractor error: {0}")]
    Extract(#[from] ExtractError),

    /// Store failure.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Record failed normalization.
    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] ValidationError),

    /// Domain rule violated.
    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Maps the error onto the Transient / Data / Fatal taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Database(e) if e.is_transient() => ErrorClass::Transient,
            SyncError::Database(DbError::ConstraintViolation { .. })
            | SyncError::Database(DbError::Serialization(_)) => ErrorClass::Data,
            SyncError::Extract(e) if e.is_transient() => ErrorClass::Transient,
            SyncError::InvalidRecord(_) => ErrorClass::Data,
            _ => ErrorClass::Fatal,
        }
    }

    /// Returns true if retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
