//! # Scheduler
//!
//! Fans cycles out over many partitions.
//!
//! ```text
//!   partitions ──► spawn one task each ──► Semaphore(max_parallel_cycles)
//!                                               │
//!                                               ▼
//!                                   Orchestrator::run_cycle_with
//!                                               │
//!   reports (input order) ◄── join handles ◄────┘
//! ```
//!
//! Partitions are independent: a failed or refused cycle never stops the
//! others.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ledgersync_core::{PartitionKey, SyncRun};

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::Orchestrator;

/// Result of one partition's cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub partition: PartitionKey,
    pub result: SyncResult<SyncRun>,
}

/// Runs one cycle per partition, at most `max_parallel_cycles` at a time.
///
/// ## Returns
/// One report per partition, in input order.
pub async fn run_all(
    orchestrator: &Arc<Orchestrator>,
    partitions: &[PartitionKey],
    cancel: &CancellationToken,
) -> Vec<CycleReport> {
    let limit = orchestrator.settings().max_parallel_cycles.max(1);
    let permits = Arc::new(Semaphore::new(limit));

    info!(partitions = partitions.len(), limit, "Starting sync cycles");

    let handles: Vec<_> = partitions
        .iter()
        .cloned()
        .map(|partition| {
            let orchestrator = orchestrator.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();

            let handle = tokio::spawn({
                let partition = partition.clone();
                async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| SyncError::Internal(e.to_string()))?;

                    if cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }

                    orchestrator.run_cycle_with(&partition, cancel).await
                }
            });

            (partition, handle)
        })
        .collect();

    let mut reports = Vec::with_capacity(handles.len());
    for (partition, handle) in handles {
        let result = handle.await.unwrap_or_else(|e| {
            error!(partition = %partition, error = %e, "Cycle task panicked");
            Err(SyncError::Internal(format!("cycle task failed: {e}")))
        });
        reports.push(CycleReport { partition, result });
    }

    reports
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::{raw, StaticExtractor};
    use ledgersync_core::RunStatus;
    use ledgersync_db::{Database, DbConfig};

    async fn setup(max_parallel: usize) -> (Arc<Orchestrator>, Arc<Database>) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let extractor = Arc::new(StaticExtractor::batch(vec![
            raw("A", 1, "2024-04-01", false),
            raw("B", 1, "2024-04-01", false),
        ]));

        let mut config = EngineConfig::default();
        config.sync.max_parallel_cycles = max_parallel;

        (Arc::new(Orchestrator::new(db.clone(), extractor, &config)), db)
    }

    #[tokio::test]
    async fn test_runs_every_partition() {
        let (orchestrator, db) = setup(2).await;
        let partitions = vec![
            PartitionKey::new("acme", "ledger"),
            PartitionKey::new("acme", "stock_item"),
            PartitionKey::new("beta", "ledger"),
        ];

        let reports = run_all(&orchestrator, &partitions, &CancellationToken::new()).await;

        assert_eq!(reports.len(), 3);
        for (report, partition) in reports.iter().zip(&partitions) {
            assert_eq!(&report.partition, partition);
            let run = report.result.as_ref().unwrap();
            assert_eq!(run.status, RunStatus::Success);
            assert_eq!(run.counts.inserted, 2);
            assert_eq!(db.replicas().count(partition).await.unwrap().active, 2);
        }
    }

    #[tokio::test]
    async fn test_busy_partition_does_not_stop_others() {
        let (orchestrator, db) = setup(4).await;
        let busy = PartitionKey::new("acme", "ledger");
        db.leases()
            .try_acquire(&busy, "other-host", chrono::Duration::seconds(60), chrono::Utc::now())
            .await
            .unwrap();

        let partitions = vec![busy.clone(), PartitionKey::new("acme", "stock_item")];
        let reports = run_all(&orchestrator, &partitions, &CancellationToken::new()).await;

        assert!(matches!(reports[0].result, Err(SyncError::ConcurrentRun { .. })));
        assert!(reports[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (orchestrator, db) = setup(1).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let partitions = vec![PartitionKey::new("acme", "ledger")];
        let reports = run_all(&orchestrator, &partitions, &cancel).await;

        assert!(matches!(reports[0].result, Err(SyncError::Cancelled)));
        assert!(db.runs().list(&partitions[0], 10).await.unwrap().is_empty());
    }
}
