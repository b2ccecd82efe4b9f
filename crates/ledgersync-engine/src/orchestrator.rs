//! # Orchestrator
//!
//! Drives one sync cycle for one (tenant, entity type) partition.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           run_cycle(partition)                          │
//! │                                                                         │
//! │  acquire lease ──✗──► Err(ConcurrentRun)      (no run row, no writes)  │
//! │       │                                                                 │
//! │       ├──► heartbeat task: renew every ttl/3; lost lease aborts cycle  │
//! │       ▼                                                                 │
//! │  close abandoned runs, read watermark, start SyncRun (full/incremental) │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────────── for each batch from the extractor ───────────────┐  │
//! │  │  normalize ─► dedupe ─► per record: get ─► resolve ─► apply       │  │
//! │  │                                  (transient errors retried)       │  │
//! │  │  batch clean? ─► advance watermark                                │  │
//! │  │  flush counts ─► cancelled / timed out? ─► abort                  │  │
//! │  └────────────────────────────────────────────────────────────────────┘  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  finalize SyncRun: success | partial_failure | failed                  │
//! │  release lease (every exit path)                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Counting
//! Every record the extractor delivers is counted once: for a completed run
//! `seen == inserted + updated + deleted + skipped + failed`. Deliveries
//! folded away by de-duplication count as skipped.
//!
//! ## Watermark
//! Advanced only after a whole batch is applied. A record that still fails
//! with a transient error after all retries freezes the watermark for the
//! rest of the cycle, so the next cycle asks for it again. Records rejected
//! as bad data do not freeze it; redelivering them would fail the same way.

use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ledgersync_core::validation::validate_partition;
use ledgersync_core::{
    advance_watermark, dedupe, resolve, Action, ApplyOutcome, ChangeRecord, DedupOutcome,
    Normalizer, PartitionKey, RawRecord, RunStatus, SyncMode, SyncRun, Watermark,
};
use ledgersync_db::Database;

use crate::applier::{changed_fields, Applier, ReplicaStore};
use crate::config::{EngineConfig, SyncSettings};
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::extractor::{ExtractRequest, Extractor, RawBatch};
use crate::recorder::RunRecorder;
use crate::retry::RetryPolicy;

/// Summary written on runs whose holder died before finalizing them.
const ABANDONED_SUMMARY: &str = "abandoned: previous holder exited without finalizing";

/// Runs sync cycles against one replica database.
pub struct Orchestrator {
    db: Arc<Database>,
    extractor: Arc<dyn Extractor>,
    normalizer: Normalizer,
    store: Arc<dyn ReplicaStore>,
    policy: RetryPolicy,
    settings: SyncSettings,
    cycle_timeout: Option<Duration>,
    holder_prefix: String,
}

impl Orchestrator {
    /// Creates an orchestrator from engine configuration.
    pub fn new(db: Arc<Database>, extractor: Arc<dyn Extractor>, config: &EngineConfig) -> Self {
        Orchestrator {
            store: Arc::new(Applier::new(db.clone())),
            db,
            extractor,
            normalizer: Normalizer::new(config.mapping.clone()),
            policy: RetryPolicy::from_settings(&config.sync),
            settings: config.sync.clone(),
            cycle_timeout: config.sync.cycle_timeout(),
            holder_prefix: format!("pid-{}", std::process::id()),
        }
    }

    /// Overrides the configured cycle timeout.
    pub fn with_cycle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    /// Replaces the replica store records are applied through.
    pub fn with_store(mut self, store: Arc<dyn ReplicaStore>) -> Self {
        self.store = store;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Runs one cycle for (tenant, entity type).
    ///
    /// ## Returns
    /// * `Ok(run)` - The finalized run, whatever its status
    /// * `Err(ConcurrentRun)` - Another cycle holds the partition
    /// * `Err(_)` - The cycle failed before its run row existed
    pub async fn run_cycle(&self, tenant: &str, entity_type: &str) -> SyncResult<SyncRun> {
        self.run_cycle_with(&PartitionKey::new(tenant, entity_type), CancellationToken::new())
            .await
    }

    /// Runs one cycle that stops between batches once `cancel` fires.
    pub async fn run_cycle_with(
        &self,
        partition: &PartitionKey,
        cancel: CancellationToken,
    ) -> SyncResult<SyncRun> {
        validate_partition(partition)
            .map_err(|e| SyncError::InvalidConfig(format!("partition '{partition}': {e}")))?;

        let holder = format!("{}/{}", self.holder_prefix, Uuid::new_v4());
        self.acquire(partition, &holder).await?;

        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let heartbeat = stop.clone().drop_guard();
        self.spawn_heartbeat(partition.clone(), holder.clone(), stop, lost.clone());

        let result = self.run_leased(partition, &cancel, &lost).await;

        drop(heartbeat);
        self.release(partition, &holder).await;

        result
    }

    /// Removes the partition's watermark so the next cycle runs in full mode.
    ///
    /// Refused with `ConcurrentRun` while a cycle holds the partition.
    pub async fn reset_watermark(&self, partition: &PartitionKey) -> SyncResult<bool> {
        let holder = format!("{}/reset-{}", self.holder_prefix, Uuid::new_v4());
        self.acquire(partition, &holder).await?;

        let removed = self.db.watermarks().reset(partition).await;
        self.release(partition, &holder).await;

        let removed = removed?;
        info!(partition = %partition, removed, "Watermark reset, next cycle runs in full mode");
        Ok(removed)
    }

    // =========================================================================
    // Lease Handling
    // =========================================================================

    async fn acquire(&self, partition: &PartitionKey, holder: &str) -> SyncResult<()> {
        let acquired = self
            .db
            .leases()
            .try_acquire(partition, holder, self.settings.lease_ttl(), Utc::now())
            .await?;

        if !acquired {
            warn!(partition = %partition, "Partition is busy, refusing concurrent cycle");
            return Err(SyncError::ConcurrentRun {
                partition: partition.to_string(),
            });
        }

        Ok(())
    }

    /// Renews the lease every third of its TTL until `stop` fires.
    ///
    /// Cancels `lost` once the lease is gone or cannot be renewed.
    fn spawn_heartbeat(
        &self,
        partition: PartitionKey,
        holder: String,
        stop: CancellationToken,
        lost: CancellationToken,
    ) {
        let db = self.db.clone();
        let ttl = self.settings.lease_ttl();
        let every = self.settings.lease_renew_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match db.leases().renew(&partition, &holder, ttl, Utc::now()).await {
                    Ok(true) => debug!(partition = %partition, "Lease renewed"),
                    Ok(false) if stop.is_cancelled() => return,
                    Ok(false) => {
                        warn!(
                            partition = %partition,
                            holder = %holder,
                            "Lease taken over, aborting cycle"
                        );
                        lost.cancel();
                        return;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(partition = %partition, error = %e, "Lease renewal failed, retrying");
                    }
                    Err(e) => {
                        error!(
                            partition = %partition,
                            error = %e,
                            "Lease renewal failed, aborting cycle"
                        );
                        lost.cancel();
                        return;
                    }
                }
            }
        });
    }

    async fn release(&self, partition: &PartitionKey, holder: &str) {
        match self.db.leases().release(partition, holder).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(partition = %partition, holder, "Lease was no longer ours on release")
            }
            Err(e) => warn!(partition = %partition, error = %e, "Failed to release lease"),
        }
    }

    // =========================================================================
    // Cycle Body
    // =========================================================================

    async fn run_leased(
        &self,
        partition: &PartitionKey,
        cancel: &CancellationToken,
        lost: &CancellationToken,
    ) -> SyncResult<SyncRun> {
        self.db
            .runs()
            .abandon_in_progress(partition, ABANDONED_SUMMARY, Utc::now())
            .await?;

        let watermark = self.db.watermarks().get(partition).await?;
        let mode = if watermark.is_some() {
            SyncMode::Incremental
        } else {
            SyncMode::Full
        };

        let mut recorder = RunRecorder::start(self.db.clone(), partition, mode).await?;

        let driven = tokio::select! {
            biased;
            _ = lost.cancelled() => Err(SyncError::LeaseLost {
                partition: partition.to_string(),
            }),
            driven = self.drive(partition, mode, watermark, cancel, &mut recorder) => driven,
        };

        let run = match driven {
            Ok(()) => {
                let status = recorder.run().completion_status();
                recorder.finish(status, None).await
            }
            Err(err) => {
                error!(
                    partition = %partition,
                    run_id = %recorder.run_id(),
                    class = %err.class(),
                    error = %err,
                    "Sync cycle aborted"
                );
                recorder.finish(RunStatus::Failed, Some(err.to_string())).await
            }
        };

        Ok(run)
    }

    /// Consumes the extractor stream batch by batch.
    ///
    /// `Err` aborts the cycle; the caller finalizes the run `failed`.
    async fn drive(
        &self,
        partition: &PartitionKey,
        mode: SyncMode,
        mut watermark: Option<Watermark>,
        cancel: &CancellationToken,
        recorder: &mut RunRecorder,
    ) -> SyncResult<()> {
        let deadline = self.cycle_timeout.map(|timeout| Instant::now() + timeout);

        let mut batches = self.extractor.fetch(ExtractRequest {
            partition: partition.clone(),
            mode,
            since: watermark.clone(),
            batch_size: self.settings.batch_size,
        });

        let mut frozen = false;
        let mut batch_no = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = expire(deadline) => return Err(self.timeout_error()),
                next = batches.next() => next,
            };

            let Some(batch) = next else { break };
            let RawBatch { records, cursor } = batch?;
            batch_no += 1;

            debug!(partition = %partition, batch_no, records = records.len(), "Applying batch");

            let (applied, unrecovered) =
                self.apply_batch(partition, records, cancel, recorder).await?;

            if unrecovered && !frozen {
                frozen = true;
                warn!(
                    partition = %partition,
                    batch_no,
                    "Batch had unrecovered failures, watermark frozen for this cycle"
                );
            }

            if !frozen {
                if let Some(next) =
                    advance_watermark(watermark.as_ref(), partition, &applied, cursor, Utc::now())
                {
                    let next = &next;
                    let stored = self
                        .policy
                        .run(cancel, move || async move {
                            Ok(self.db.watermarks().advance(next).await?)
                        })
                        .await?;
                    watermark = Some(stored);
                }
            }

            recorder.flush().await?;
        }

        info!(partition = %partition, batches = batch_no, frozen, "Extractor stream complete");
        Ok(())
    }

    /// Normalizes, de-duplicates and applies one batch.
    ///
    /// ## Returns
    /// The de-duplicated changes, and whether any of them still failed
    /// transiently after all retries.
    async fn apply_batch(
        &self,
        partition: &PartitionKey,
        records: Vec<RawRecord>,
        cancel: &CancellationToken,
        recorder: &mut RunRecorder,
    ) -> SyncResult<(Vec<ChangeRecord>, bool)> {
        recorder.seen(records.len());

        let mut changes = Vec::with_capacity(records.len());
        for raw in records {
            let identity = self.normalizer.identity_of(&raw).ok();
            match self.normalizer.normalize(partition, raw) {
                Ok(change) => changes.push(change),
                Err(e) => {
                    warn!(
                        partition = %partition,
                        identity = identity.as_deref().unwrap_or("<unknown>"),
                        reason = %e,
                        "Rejected malformed record"
                    );
                    recorder.record_failure(identity.as_deref(), &e.to_string());
                }
            }
        }

        let DedupOutcome { records, folded } = dedupe(changes);
        if folded > 0 {
            debug!(partition = %partition, folded, "Folded duplicate deliveries");
            recorder.record_folded(folded);
        }

        let mut unrecovered = false;
        for change in &records {
            match self.policy.run(cancel, move || self.apply_one(change)).await {
                Ok(outcome) => recorder.record(outcome),
                Err(err) => match err.class() {
                    ErrorClass::Fatal => return Err(err),
                    class => {
                        unrecovered |= class == ErrorClass::Transient;
                        warn!(
                            partition = %partition,
                            identity = %change.identity,
                            class = %class,
                            error = %err,
                            "Record failed"
                        );
                        recorder.record_failure(Some(&change.identity), &err.to_string());
                    }
                },
            }
        }

        Ok((records, unrecovered))
    }

    /// Looks up, resolves and applies one change.
    async fn apply_one(&self, change: &ChangeRecord) -> SyncResult<ApplyOutcome> {
        let existing = self.store.current(change).await?;
        let action = resolve(change, existing.as_ref());

        if let (Action::Update, Some(existing)) = (action, &existing) {
            let fields = changed_fields(existing, change);
            if !fields.is_empty() {
                debug!(
                    identity = %change.identity,
                    from = existing.revision,
                    to = change.revision,
                    ?fields,
                    "Fields changed"
                );
            }
        }

        self.store.apply(action, change).await.into_result()
    }

    fn timeout_error(&self) -> SyncError {
        let millis = self
            .cycle_timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        SyncError::Timeout(millis)
    }
}

/// Completes at `deadline`, or never without one.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
