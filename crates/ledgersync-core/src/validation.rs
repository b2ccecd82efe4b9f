//! # Validation Module
//!
//! Key validation shared by the normalizer and configuration loading.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Extractor                                                    │
//! │  └── Protocol / markup parsing (external)                              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Normalizer (Rust)                                            │
//! │  ├── Canonical field presence and format                               │
//! │  └── THIS MODULE: key length and emptiness rules                       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── NOT NULL constraints                                              │
//! │  └── PRIMARY KEY (tenant, entity_type, identity)                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::PartitionKey;
use crate::{MAX_ENTITY_TYPE_LEN, MAX_IDENTITY_LEN, MAX_TENANT_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a non-empty key of bounded length and returns it trimmed.
fn validate_key<'a>(field: &str, value: &'a str, max: usize) -> ValidationResult<&'a str> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::required(field));
    }

    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(value)
}

/// Validates a source identity (GUID).
///
/// ## Example
/// ```rust
/// use ledgersync_core::validation::validate_identity;
///
/// assert_eq!(validate_identity(" 9a1c-0001 ").unwrap(), "9a1c-0001");
/// assert!(validate_identity("   ").is_err());
/// ```
pub fn validate_identity(identity: &str) -> ValidationResult<&str> {
    validate_key("identity", identity, MAX_IDENTITY_LEN)
}

/// Validates both halves of a partition key.
pub fn validate_partition(partition: &PartitionKey) -> ValidationResult<()> {
    validate_key("tenant", &partition.tenant, MAX_TENANT_LEN)?;
    validate_key("entity_type", &partition.entity_type, MAX_ENTITY_TYPE_LEN)?;
    Ok(())
}
