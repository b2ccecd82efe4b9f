//! # Error Types
//!
//! Domain-specific error types for ledgersync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  ledgersync-core errors (this file)                                    │
//! │  ├── CoreError        - Domain rule violations                         │
//! │  └── ValidationError  - Malformed source records (Data errors)         │
//! │                                                                         │
//! │  ledgersync-db errors (separate crate)                                 │
//! │  └── DbError          - Store failures (transient or fatal)            │
//! │                                                                         │
//! │  ledgersync-engine errors                                              │
//! │  └── SyncError        - Cycle-level failures reported on the SyncRun   │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → SyncRun.errorSummary  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::RunStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A SyncRun was asked to leave a terminal state.
    ///
    /// ## When This Occurs
    /// - Finalizing a run twice
    /// - Moving a run back to `in_progress`
    #[error("SyncRun cannot move from {from} to {to}")]
    InvalidRunTransition { from: RunStatus, to: RunStatus },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Source record validation errors.
///
/// Every variant is a **Data** error: the record is counted as failed and
/// excluded from its batch, the cycle continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (non-numeric revision, unparseable date, ...).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages() {
        assert_eq!(ValidationError::required("guid").to_string(), "guid is required");

        let err = ValidationError::invalid("alter_id", "not a number: 'x'");
        assert_eq!(err.to_string(), "alter_id has invalid format: not a number: 'x'");
    }

    #[test]
    fn test_transition_error_message() {
        let err = CoreError::InvalidRunTransition {
            from: RunStatus::Success,
            to: RunStatus::Failed,
        };
        assert_eq!(err.to_string(), "SyncRun cannot move from success to failed");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let core_err: CoreError = ValidationError::required("guid").into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
