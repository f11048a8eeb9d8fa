//! Lazy expiry: every read goes through here so the deadline wins over a
//! stale `status` column.

use super::error::{TransferError, TransferResult};
use super::transfer_store::TransferStore;
use crate::models::transfer::{Transfer, Transition};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ExpiryGuard {
    store: TransferStore,
}

impl ExpiryGuard {
    pub fn new(store: TransferStore) -> Self {
        Self { store }
    }

    /// Fetch a transfer with its status corrected for `now`.
    pub async fn load(&self, id: Uuid, now: DateTime<Utc>) -> TransferResult<Transfer> {
        let transfer = self
            .store
            .fetch(id)
            .await?
            .ok_or(TransferError::NotFound(id))?;
        Ok(self.observe(transfer, now).await)
    }

    /// Correct the status of an already-read record, persisting the flip to
    /// `EXPIRED` when possible. A failed write is logged and the corrected
    /// record is returned anyway.
    pub async fn observe(&self, mut transfer: Transfer, now: DateTime<Utc>) -> Transfer {
        if transfer.effective_status(now) == transfer.status {
            return transfer;
        }
        let Ok(next) = transfer.status.apply(Transition::Expire) else {
            return transfer;
        };

        match self
            .store
            .mark_expired(transfer.id, transfer.status, next, transfer.expires_at)
            .await
        {
            Ok(true) => debug!(transfer_id = %transfer.id, from = %transfer.status, "transfer expired"),
            Ok(false) => debug!(
                transfer_id = %transfer.id,
                "expiry not persisted, record changed concurrently"
            ),
            Err(err) => warn!(transfer_id = %transfer.id, error = %err, "failed to persist expiry"),
        }
        transfer.status = next;
        transfer
    }
}
