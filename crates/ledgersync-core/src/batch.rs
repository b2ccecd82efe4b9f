//! # Batch Arithmetic
//!
//! De-duplication of one extractor batch and the watermark it produces.
//!
//! ## De-duplication
//! ```text
//!  batch from extractor            after dedupe
//!  ────────────────────            ────────────
//!  B  rev 1                        B  rev 3
//!  C  rev 4                        C  rev 4
//!  B  rev 3   ──── folded ────►
//!  B  rev 2
//! ```
//! Exactly one record per identity reaches the resolver, so intra-batch
//! ordering cannot lose an update. First-seen order of identities is kept.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::types::{ChangeRecord, PartitionKey, Watermark};

/// Result of [`dedupe`].
#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    /// One record per identity, in first-seen order.
    pub records: Vec<ChangeRecord>,

    /// Number of superseded deliveries dropped.
    pub folded: usize,
}

/// Keeps only the newest delivery of each identity.
///
/// Newest = highest revision, then latest `modified_at`. On a full tie a
/// deletion wins, otherwise the later delivery.
pub fn dedupe(records: Vec<ChangeRecord>) -> DedupOutcome {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut kept: Vec<ChangeRecord> = Vec::with_capacity(records.len());
    let mut folded = 0;

    for record in records {
        match slots.get(&record.identity) {
            Some(&slot) => {
                folded += 1;
                if supersedes(&record, &kept[slot]) {
                    kept[slot] = record;
                }
            }
            None => {
                slots.insert(record.identity.clone(), kept.len());
                kept.push(record);
            }
        }
    }

    DedupOutcome {
        records: kept,
        folded,
    }
}

fn supersedes(candidate: &ChangeRecord, current: &ChangeRecord) -> bool {
    match candidate.ordering_key().cmp(&current.ordering_key()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.deleted || !current.deleted,
    }
}

/// Computes the watermark after a batch was fully applied.
///
/// Never moves backwards: each component is the max of the previous value
/// and the batch. Returns `None` only when there is neither a previous
/// watermark nor any record to derive one from.
pub fn advance_watermark(
    previous: Option<&Watermark>,
    partition: &PartitionKey,
    batch: &[ChangeRecord],
    cursor: Option<String>,
    now: DateTime<Utc>,
) -> Option<Watermark> {
    let batch_modified = batch.iter().map(|r| r.modified_at).max();
    let batch_revision = batch.iter().map(|r| r.revision).max().unwrap_or(0);

    let last_modified_seen = match (previous.map(|w| w.last_modified_seen), batch_modified) {
        (Some(prev), Some(seen)) => prev.max(seen),
        (Some(prev), None) => prev,
        (None, Some(seen)) => seen,
        (None, None) => return None,
    };

    let last_revision_seen = previous
        .map(|w| w.last_revision_seen)
        .unwrap_or(0)
        .max(batch_revision);

    Some(Watermark {
        tenant: partition.tenant.clone(),
        entity_type: partition.entity_type.clone(),
        last_modified_seen,
        last_revision_seen,
        cursor_token: cursor.or_else(|| previous.and_then(|w| w.cursor_token.clone())),
        updated_at: now,
    })
}
