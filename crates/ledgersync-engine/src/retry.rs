//! # Retry Policy
//!
//! Bounded retries for a single record's store operations.
//!
//! ```text
//! attempt 1 ──► Transient? ──► sleep(backoff) ──► attempt 2 ──► ... ──► attempt N
//!                   │                  │                                   │
//!                   │ Data / Fatal     │ cancelled                         │ still failing
//!                   ▼                  ▼                                   ▼
//!              returned as-is     last error returned              last error returned
//! ```
//!
//! Backoff is exponential with jitter (`backoff` crate), capped at
//! `max_backoff`. Only [`ErrorClass::Transient`] errors are retried.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SyncSettings;
use crate::error::{ErrorClass, SyncResult};

/// Attempt budget and backoff bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. At least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Runs `op` until it succeeds, fails non-transiently, runs out of
    /// attempts or `cancel` fires during a backoff wait.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 1u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.class() != ErrorClass::Transient {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                warn!(attempt, error = %err, "Retry attempts exhausted");
                return Err(err);
            }

            let Some(delay) = backoff.next_backoff() else {
                return Err(err);
            };

            debug!(attempt, ?delay, error = %err, "Transient failure, retrying");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    debug!("Cancelled during retry backoff");
                    return Err(err);
                }
            }

            attempt += 1;
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
