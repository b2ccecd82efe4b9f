//! Test doubles shared by the engine's unit tests.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ledgersync_core::{Action, ChangeRecord, RawRecord, ReplicaRecord};
use ledgersync_db::{Database, DbError, DbResult};

use crate::applier::{Applier, ApplyResult, ReplicaStore};
use crate::extractor::{BatchStream, ExtractError, ExtractRequest, Extractor, RawBatch};

/// Replays the same scripted batches on every fetch.
#[derive(Debug, Default)]
pub struct StaticExtractor {
    script: Vec<Result<RawBatch, ExtractError>>,
    hang: bool,
    requests: Mutex<Vec<ExtractRequest>>,
}

impl StaticExtractor {
    pub fn new(script: Vec<Result<RawBatch, ExtractError>>) -> Self {
        StaticExtractor {
            script,
            ..Default::default()
        }
    }

    /// One successful batch.
    pub fn batch(records: Vec<RawRecord>) -> Self {
        Self::new(vec![Ok(RawBatch::new(records))])
    }

    /// After the scripted items the stream never ends.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn requests(&self) -> Vec<ExtractRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Extractor for StaticExtractor {
    fn fetch(&self, request: ExtractRequest) -> BatchStream {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let scripted = stream::iter(self.script.clone());
        if self.hang {
            scripted.chain(stream::pending()).boxed()
        } else {
            scripted.boxed()
        }
    }
}

/// Raw ledger record in the default field mapping.
pub fn raw(guid: &str, alter_id: u64, last_modified: &str, deleted: bool) -> RawRecord {
    let value = json!({
        "guid": guid,
        "alter_id": alter_id,
        "last_modified": last_modified,
        "is_deleted": if deleted { "Yes" } else { "No" },
        "name": format!("Ledger {guid}"),
    });

    match value {
        serde_json::Value::Object(map) => map,
        _ => RawRecord::new(),
    }
}

/// Store failure injected for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `database is locked` for the next `n` applies, then success.
    Busy(u32),
    /// `database is locked` on every apply.
    AlwaysBusy,
    /// CHECK constraint failure.
    Constraint,
    /// Non-retryable query failure.
    Broken,
}

/// SQLite store that fails applies for chosen identities.
pub struct FaultyStore {
    inner: Applier,
    faults: Mutex<HashMap<String, Fault>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FaultyStore {
    pub fn new(db: Arc<Database>) -> Self {
        FaultyStore {
            inner: Applier::new(db),
            faults: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail(self, identity: &str, fault: Fault) -> Self {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(identity.to_string(), fault);
        }
        self
    }

    /// Apply calls seen for `identity`, failed ones included.
    pub fn attempts(&self, identity: &str) -> u32 {
        self.attempts
            .lock()
            .map(|a| a.get(identity).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn next_error(&self, identity: &str) -> Option<DbError> {
        let mut faults = self.faults.lock().ok()?;
        let locked = || DbError::Busy("database is locked".into());

        match faults.get(identity).copied()? {
            Fault::Busy(0) => None,
            Fault::Busy(n) => {
                faults.insert(identity.to_string(), Fault::Busy(n - 1));
                Some(locked())
            }
            Fault::AlwaysBusy => Some(locked()),
            Fault::Constraint => Some(DbError::ConstraintViolation {
                message: "CHECK constraint failed: revision >= 0".into(),
            }),
            Fault::Broken => Some(DbError::QueryFailed("disk image is malformed".into())),
        }
    }
}

#[async_trait]
impl ReplicaStore for FaultyStore {
    async fn current(&self, change: &ChangeRecord) -> DbResult<Option<ReplicaRecord>> {
        self.inner.current(change).await
    }

    async fn apply(&self, action: Action, change: &ChangeRecord) -> ApplyResult {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts.entry(change.identity.clone()).or_default() += 1;
        }

        match self.next_error(&change.identity) {
            Some(err) => ApplyResult {
                action,
                outcome: Err(err),
            },
            None => self.inner.apply(action, change).await,
        }
    }
}
