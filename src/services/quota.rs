//! Download admission.
//!
//! A download is granted only by the conditional increment in
//! [`TransferStore::admit_download`]; nothing here reads the counter before
//! writing it. The follow-up read after a refusal only decides which error to
//! report.

use super::error::{TransferError, TransferResult};
use super::transfer_store::{DownloadCounter, TransferStore};
use crate::models::transfer::TransferStatus;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct DownloadQuota {
    store: TransferStore,
}

impl DownloadQuota {
    pub fn new(store: TransferStore) -> Self {
        Self { store }
    }

    pub async fn admit(&self, id: Uuid, now: DateTime<Utc>) -> TransferResult<DownloadCounter> {
        if let Some(counter) = self.store.admit_download(id, now).await? {
            debug!(
                transfer_id = %id,
                download_count = counter.download_count,
                max_downloads = counter.max_downloads,
                "download admitted"
            );
            return Ok(counter);
        }

        let transfer = self
            .store
            .fetch(id)
            .await?
            .ok_or(TransferError::NotFound(id))?;
        Err(match transfer.effective_status(now) {
            TransferStatus::Expired => TransferError::Expired(id),
            TransferStatus::Ready => TransferError::QuotaExceeded(id),
            status => TransferError::InvalidState {
                id,
                status,
                operation: "download",
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_transfer, test_pool};
    use chrono::TimeDelta;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_admissions_respect_limit() {
        let store = TransferStore::new(test_pool().await);
        let id = seed_transfer(&store, TransferStatus::Ready, Some("k"), 3, 1, None).await;
        let quota = Arc::new(DownloadQuota::new(store.clone()));

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let quota = quota.clone();
                tokio::spawn(async move { quota.admit(id, Utc::now()).await })
            })
            .collect();

        let mut admitted = 0;
        let mut exhausted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(TransferError::QuotaExceeded(_)) => exhausted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(exhausted, 6);

        let stored = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(stored.download_count, 3);
    }

    #[tokio::test]
    async fn test_refusal_is_classified() {
        let store = TransferStore::new(test_pool().await);
        let quota = DownloadQuota::new(store.clone());
        let past = Some(Utc::now() - TimeDelta::minutes(1));

        let overdue = seed_transfer(&store, TransferStatus::Ready, Some("k"), 5, 0, past).await;
        assert!(matches!(
            quota.admit(overdue, Utc::now()).await,
            Err(TransferError::Expired(_))
        ));

        let pending = seed_transfer(&store, TransferStatus::Init, None, 5, 0, None).await;
        assert!(matches!(
            quota.admit(pending, Utc::now()).await,
            Err(TransferError::InvalidState {
                status: TransferStatus::Init,
                ..
            })
        ));

        assert!(matches!(
            quota.admit(Uuid::new_v4(), Utc::now()).await,
            Err(TransferError::NotFound(_))
        ));

        let stored = store.fetch(overdue).await.unwrap().unwrap();
        assert_eq!(stored.download_count, 0);
    }
}
