//! Expiry & cleanup reconciler.
//!
//! A sweep first flips overdue live transfers to `EXPIRED`, then purges the
//! backing objects of expired or deleted records. Each record is claimed as
//! `DELETED` before its object is removed, and its key is cleared only after
//! the delete succeeded; a failed delete keeps the key for the next sweep.

use super::object_gateway::{ObjectGateway, with_timeout};
use super::transfer_store::TransferStore;
use crate::models::transfer::Transition;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Live records flipped to `EXPIRED` by this sweep.
    pub expired: u64,
    pub candidates: usize,
    pub purged: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("cleanup sweep timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct CleanupReconciler {
    store: TransferStore,
    gateway: Arc<dyn ObjectGateway>,
    batch: i64,
    run_timeout: Duration,
    object_timeout: Duration,
}

impl CleanupReconciler {
    pub fn new(
        store: TransferStore,
        gateway: Arc<dyn ObjectGateway>,
        batch: i64,
        run_timeout: Duration,
        object_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            batch: batch.max(1),
            run_timeout,
            object_timeout,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let mut report = SweepReport {
            expired: self.store.expire_overdue(now).await?,
            ..Default::default()
        };

        let candidates = self.store.purge_candidates(self.batch).await?;
        report.candidates = candidates.len();

        for candidate in candidates {
            let Ok(claimed) = candidate.status.apply(Transition::Purge) else {
                continue;
            };
            if !self.store.claim_purge(&candidate, claimed).await? {
                // Revived or re-keyed since it was selected; its object
                // stays.
                debug!(transfer_id = %candidate.id, "record changed before purge, skipped");
                continue;
            }

            let deleted = with_timeout(
                self.object_timeout,
                self.gateway.delete(&candidate.object_key),
            )
            .await;
            if let Err(err) = deleted {
                report.failed += 1;
                warn!(
                    transfer_id = %candidate.id,
                    object_key = %candidate.object_key,
                    error = %err,
                    "object purge failed, will retry next sweep"
                );
                continue;
            }

            if self.store.finalize_purge(&candidate, claimed).await? {
                report.purged += 1;
                debug!(transfer_id = %candidate.id, "transfer purged");
            } else {
                warn!(
                    transfer_id = %candidate.id,
                    object_key = %candidate.object_key,
                    "purged record was finalized elsewhere"
                );
            }
        }

        Ok(report)
    }

    /// One sweep bounded by the run timeout.
    pub async fn run_once(&self) -> Result<SweepReport, SweepError> {
        tokio::time::timeout(self.run_timeout, self.sweep(Utc::now()))
            .await
            .map_err(|_| SweepError::TimedOut(self.run_timeout))?
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "cleanup reconciler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_once().await {
                Ok(report) if report == SweepReport::default() => debug!("cleanup sweep found nothing"),
                Ok(report) => info!(
                    expired = report.expired,
                    candidates = report.candidates,
                    purged = report.purged,
                    failed = report.failed,
                    "cleanup sweep finished"
                ),
                Err(err) => error!(error = %err, "cleanup sweep failed"),
            }
        }
        info!("cleanup reconciler stopped");
    }
}
