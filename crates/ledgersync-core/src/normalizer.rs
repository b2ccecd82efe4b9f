//! # Record Normalizer
//!
//! Maps a raw source record (field name → JSON value) into a canonical
//! [`ChangeRecord`].
//!
//! ## Field Mapping
//! ```text
//!  raw record (source export)          ChangeRecord
//!  ──────────────────────────          ────────────
//!  guid          "9a1c-0001"     ──►   identity
//!  alter_id      "742"           ──►   revision      742
//!  last_modified "1-Apr-2024"    ──►   modified_at   2024-04-01T00:00:00Z
//!  is_deleted    "No"            ──►   deleted       false
//!  name          "Cash"          ──►   payload.name
//!  parent        "Cash-in-Hand"  ──►   payload.parent
//! ```
//!
//! Entity-specific field names live here, never in the resolver, applier or
//! orchestrator. Every failure is a data error for that one record.
//!
//! Modification times are kept at millisecond precision, the resolution the
//! replica stores them at.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::types::{ChangeRecord, PartitionKey};
use crate::validation::{validate_identity, validate_partition, ValidationResult};

/// A record as produced by the extractor.
pub type RawRecord = Map<String, Value>;

/// Date-only formats accepted for the modification time.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d", "%d-%b-%Y"];

/// Date-time formats (without offset, read as UTC).
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

// =============================================================================
// Field Mapping
// =============================================================================

/// Names of the raw fields carrying the canonical values.
///
/// Defaults match the source accounting system's export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(default = "default_identity_field")]
    pub identity: String,

    #[serde(default = "default_revision_field")]
    pub revision: String,

    #[serde(default = "default_modified_at_field")]
    pub modified_at: String,

    #[serde(default = "default_deleted_field")]
    pub deleted: String,
}

fn default_identity_field() -> String {
    "guid".to_string()
}

fn default_revision_field() -> String {
    "alter_id".to_string()
}

fn default_modified_at_field() -> String {
    "last_modified".to_string()
}

fn default_deleted_field() -> String {
    "is_deleted".to_string()
}

impl Default for FieldMapping {
    fn default() -> Self {
        FieldMapping {
            identity: default_identity_field(),
            revision: default_revision_field(),
            modified_at: default_modified_at_field(),
            deleted: default_deleted_field(),
        }
    }
}

impl FieldMapping {
    fn is_canonical(&self, field: &str) -> bool {
        field == self.identity
            || field == self.revision
            || field == self.modified_at
            || field == self.deleted
    }
}

// =============================================================================
// Normalizer
// =============================================================================

/// Converts raw records into change records for one field mapping.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    mapping: FieldMapping,
}

impl Normalizer {
    pub fn new(mapping: FieldMapping) -> Self {
        Normalizer { mapping }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Normalizes one raw record for `partition`.
    ///
    /// Canonical fields are moved out of the record; everything else becomes
    /// the payload.
    pub fn normalize(
        &self,
        partition: &PartitionKey,
        mut raw: RawRecord,
    ) -> ValidationResult<ChangeRecord> {
        validate_partition(partition)?;

        let identity = self.identity_of(&raw)?;
        let revision = parse_revision(&self.mapping.revision, raw.get(&self.mapping.revision))?;
        let modified_at =
            parse_modified_at(&self.mapping.modified_at, raw.get(&self.mapping.modified_at))?;
        let deleted = parse_deleted(&self.mapping.deleted, raw.get(&self.mapping.deleted))?;

        raw.retain(|field, _| !self.mapping.is_canonical(field));

        Ok(ChangeRecord {
            tenant: partition.tenant.trim().to_string(),
            entity_type: partition.entity_type.trim().to_string(),
            identity,
            revision,
            modified_at,
            deleted,
            payload: raw,
        })
    }

    /// Extracts and validates the identity without consuming the record.
    ///
    /// Used for logging records that fail normalization.
    pub fn identity_of(&self, raw: &RawRecord) -> ValidationResult<String> {
        let field = &self.mapping.identity;
        let text = match raw.get(field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Null) | None => return Err(ValidationError::required(field.as_str())),
            Some(other) => {
                return Err(ValidationError::invalid(
                    field.as_str(),
                    format!("expected a string, got {other}"),
                ))
            }
        };

        validate_identity(&text)
            .map(str::to_string)
            .map_err(|err| rename_field(err, field))
    }

    /// Extracts the modification time without consuming the record.
    pub fn modified_at_of(&self, raw: &RawRecord) -> ValidationResult<DateTime<Utc>> {
        parse_modified_at(&self.mapping.modified_at, raw.get(&self.mapping.modified_at))
    }
}

/// Reports key errors under the source field name rather than "identity".
fn rename_field(err: ValidationError, field: &str) -> ValidationError {
    match err {
        ValidationError::Required { .. } => ValidationError::required(field),
        ValidationError::TooLong { max, .. } => ValidationError::TooLong {
            field: field.to_string(),
            max,
        },
        other => other,
    }
}

// =============================================================================
// Field Parsers
// =============================================================================

fn parse_revision(field: &str, value: Option<&Value>) -> ValidationResult<u64> {
    let revision = parse_unsigned(field, value)?;
    if revision > i64::MAX as u64 {
        return Err(ValidationError::invalid(field, format!("out of range: {revision}")));
    }
    Ok(revision)
}

fn parse_unsigned(field: &str, value: Option<&Value>) -> ValidationResult<u64> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                return Ok(v);
            }
            match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
                _ => Err(ValidationError::invalid(
                    field,
                    format!("not a non-negative integer: {n}"),
                )),
            }
        }
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(0);
            }
            s.parse::<u64>().map_err(|_| {
                ValidationError::invalid(field, format!("not a non-negative integer: '{s}'"))
            })
        }
        Some(other) => Err(ValidationError::invalid(
            field,
            format!("expected a number, got {other}"),
        )),
    }
}

fn parse_modified_at(field: &str, value: Option<&Value>) -> ValidationResult<DateTime<Utc>> {
    match value {
        None | Some(Value::Null) => Err(ValidationError::required(field)),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| ValidationError::invalid(field, format!("bad epoch millis: {n}"))),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Err(ValidationError::required(field));
            }
            parse_timestamp(s)
                .map(|dt| dt.trunc_subsecs(3))
                .ok_or_else(|| ValidationError::invalid(field, format!("unrecognized date: '{s}'")))
        }
        Some(other) => Err(ValidationError::invalid(
            field,
            format!("expected a date string, got {other}"),
        )),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_deleted(field: &str, value: Option<&Value>) -> ValidationResult<bool> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(ValidationError::invalid(field, format!("expected 0 or 1, got {n}"))),
        },
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "1" => Ok(true),
            "no" | "false" | "0" | "" => Ok(false),
            other => Err(ValidationError::invalid(
                field,
                format!("expected Yes/No, got '{other}'"),
            )),
        },
        Some(other) => Err(ValidationError::invalid(
            field,
            format!("expected a flag, got {other}"),
        )),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
