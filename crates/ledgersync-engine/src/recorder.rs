//! # Sync Run Recorder
//!
//! Owns the [`SyncRun`] row of one cycle: inserted at start, counts
//! flushed after every batch, finalized exactly once.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use ledgersync_core::{
    ApplyOutcome, PartitionKey, RunStatus, SyncMode, SyncRun, MAX_ERROR_SUMMARY_LEN,
};
use ledgersync_db::Database;

use crate::error::SyncResult;

/// Failure reasons kept for the run summary.
const MAX_REASONS: usize = 5;

/// Tracks one in-progress run.
#[derive(Debug)]
pub struct RunRecorder {
    db: Arc<Database>,
    run: SyncRun,
    reasons: Vec<String>,
    unreported: u64,
}

impl RunRecorder {
    /// Inserts a new `in_progress` run for `partition`.
    pub async fn start(
        db: Arc<Database>,
        partition: &PartitionKey,
        mode: SyncMode,
    ) -> SyncResult<Self> {
        let run = SyncRun::start(Uuid::new_v4().to_string(), partition, mode, Utc::now());
        db.runs().create(&run).await?;

        info!(run_id = %run.run_id, partition = %partition, mode = %mode, "Sync run started");

        Ok(RunRecorder {
            db,
            run,
            reasons: Vec::new(),
            unreported: 0,
        })
    }

    pub fn run(&self) -> &SyncRun {
        &self.run
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    /// Counts records received from the extractor.
    pub fn seen(&mut self, records: usize) {
        self.run.counts.seen += records as u64;
    }

    pub fn record(&mut self, outcome: ApplyOutcome) {
        self.run.counts.record(outcome);
    }

    /// Counts `n` records folded away by de-duplication.
    pub fn record_folded(&mut self, n: usize) {
        self.run.counts.skipped += n as u64;
    }

    /// Counts a failed record and keeps its reason for the summary.
    pub fn record_failure(&mut self, identity: Option<&str>, reason: &str) {
        self.run.counts.failed += 1;

        if self.reasons.len() < MAX_REASONS {
            self.reasons.push(match identity {
                Some(id) => format!("{id}: {reason}"),
                None => reason.to_string(),
            });
        } else {
            self.unreported += 1;
        }
    }

    /// Persists the current counts.
    pub async fn flush(&self) -> SyncResult<()> {
        self.db.runs().update_counts(&self.run.run_id, &self.run.counts).await?;
        Ok(())
    }

    /// Finalizes the run.
    ///
    /// `abort_reason` leads the summary of an aborted run. The returned run
    /// is the final state even if persisting it failed.
    pub async fn finish(mut self, status: RunStatus, abort_reason: Option<String>) -> SyncRun {
        let summary = self.summary(abort_reason);

        if let Err(e) = self.run.finalize(status, summary, Utc::now()) {
            error!(run_id = %self.run.run_id, error = %e, "Cannot finalize run");
            return self.run;
        }

        if let Err(e) = self.db.runs().finalize(&self.run).await {
            error!(run_id = %self.run.run_id, error = %e, "Failed to persist finalized run");
        }

        let counts = &self.run.counts;
        match self.run.status {
            RunStatus::Success => info!(
                run_id = %self.run.run_id,
                seen = counts.seen,
                inserted = counts.inserted,
                updated = counts.updated,
                deleted = counts.deleted,
                skipped = counts.skipped,
                "Sync run succeeded"
            ),
            _ => warn!(
                run_id = %self.run.run_id,
                status = %self.run.status,
                failed = counts.failed,
                summary = self.run.error_summary.as_deref().unwrap_or(""),
                "Sync run finished with errors"
            ),
        }

        self.run
    }

    fn summary(&self, abort_reason: Option<String>) -> Option<String> {
        let mut parts: Vec<String> = abort_reason.into_iter().collect();

        if !self.reasons.is_empty() {
            let mut failures = format!(
                "{} record(s) failed: {}",
                self.run.counts.failed,
                self.reasons.join("; ")
            );
            if self.unreported > 0 {
                failures.push_str(&format!(" (+{} more)", self.unreported));
            }
            parts.push(failures);
        }

        if parts.is_empty() {
            return None;
        }

        Some(truncate(parts.join(" | "), MAX_ERROR_SUMMARY_LEN))
    }
}

/// Cuts `text` to at most `max` characters.
fn truncate(mut text: String, max: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(max) {
        text.truncate(idx);
    }
    text
}

// =============================================================================
// Unit Tests
// =============================================================================
