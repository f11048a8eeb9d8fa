//! src/services/transfer_service.rs
//!
//! TransferService: the transfer lifecycle. Each operation validates input,
//! reads the record through the expiry guard, checks the requested move
//! against [`TransferStatus::apply`], then commits it with one conditional
//! write. Losing that write is reported as `Conflict`; it is never retried
//! here.

use super::background::BackgroundTasks;
use super::error::{TransferError, TransferResult};
use super::expiry::ExpiryGuard;
use super::notifier::NotificationPublisher;
use super::object_gateway::{GatewayError, ObjectGateway, with_timeout};
use super::quota::DownloadQuota;
use super::transfer_store::{TransferChanges, TransferStore};
use crate::config::TransferPolicy;
use crate::models::notification::ShareEvent;
use crate::models::transfer::{
    ListQuery, Transfer, TransferPage, TransferStatus, Transition, UploadedFile,
    filename_from_key, object_key_for, validate_filename,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub expires_at: DateTime<Utc>,
    pub max_downloads: Option<i64>,
}

/// Administrative changes; absent fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct TransferPatch {
    pub expires_at: Option<DateTime<Utc>>,
    pub max_downloads: Option<i64>,
    pub status: Option<TransferStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    pub upload_url: String,
    pub object_key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadTicket {
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub download_count: i64,
    pub max_downloads: i64,
}

#[derive(Clone)]
pub struct TransferService {
    store: TransferStore,
    expiry: ExpiryGuard,
    quota: DownloadQuota,
    gateway: Arc<dyn ObjectGateway>,
    policy: TransferPolicy,
    publisher: Option<Arc<dyn NotificationPublisher>>,
    tasks: BackgroundTasks,
}

impl TransferService {
    pub fn new(
        store: TransferStore,
        gateway: Arc<dyn ObjectGateway>,
        policy: TransferPolicy,
        publisher: Option<Arc<dyn NotificationPublisher>>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            expiry: ExpiryGuard::new(store.clone()),
            quota: DownloadQuota::new(store.clone()),
            store,
            gateway,
            policy,
            publisher,
            tasks,
        }
    }

    pub async fn create(&self, req: NewTransfer) -> TransferResult<Transfer> {
        let now = Utc::now();
        if req.expires_at <= now {
            return Err(TransferError::invalid_argument(
                "expires_at must be in the future",
            ));
        }
        let max_downloads = req.max_downloads.unwrap_or(1);
        if max_downloads < 1 {
            return Err(TransferError::invalid_argument(
                "max_downloads must be at least 1",
            ));
        }

        let transfer = Transfer::pending(req.expires_at, max_downloads, now);
        self.store.insert(&transfer).await?;
        info!(transfer_id = %transfer.id, max_downloads, "transfer created");
        Ok(transfer)
    }

    pub async fn get(&self, id: Uuid) -> TransferResult<Transfer> {
        self.expiry.load(id, Utc::now()).await
    }

    pub async fn list(&self, query: ListQuery) -> TransferResult<TransferPage> {
        if !(1..=MAX_PAGE_SIZE).contains(&query.limit) {
            return Err(TransferError::invalid_argument(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if query.offset < 0 {
            return Err(TransferError::invalid_argument("offset must not be negative"));
        }

        let (rows, total_count) = self.store.list(&query).await?;
        let now = Utc::now();
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(self.expiry.observe(row, now).await);
        }
        Ok(TransferPage {
            items,
            limit: query.limit,
            offset: query.offset,
            total_count,
        })
    }

    /// Issue an upload URL and remember the key it targets. Re-issuing with
    /// another filename replaces the stored key; the earlier object, if one
    /// was uploaded, is not removed.
    pub async fn issue_upload_url(
        &self,
        id: Uuid,
        filename: &str,
        content_type: Option<&str>,
    ) -> TransferResult<UploadTicket> {
        validate_filename(filename).map_err(TransferError::invalid_argument)?;
        let content_type = content_type
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);

        let transfer = self.load_usable(id, "upload to").await?;
        if transfer.status != TransferStatus::Init {
            return Err(TransferError::InvalidState {
                id,
                status: transfer.status,
                operation: "upload to",
            });
        }

        let object_key = object_key_for(id, filename);
        let presigned = with_timeout(
            self.policy.upstream_timeout,
            self.gateway
                .presign_put(&object_key, content_type, self.policy.upload_url_ttl),
        )
        .await
        .map_err(|err| gateway_failure("presign upload", err))?;

        if !self.store.attach_object_key(id, &object_key).await? {
            return Err(TransferError::Conflict(id));
        }
        if let Some(previous) = transfer.current_object_key().filter(|k| *k != object_key) {
            warn!(
                transfer_id = %id,
                previous = %previous,
                object_key = %object_key,
                "upload key replaced"
            );
        }
        info!(transfer_id = %id, object_key = %object_key, "upload url issued");

        Ok(UploadTicket {
            upload_url: presigned.url,
            object_key,
            expires_at: presigned.expires_at,
        })
    }

    /// `INIT -> READY`, only after the object store confirms the object.
    pub async fn complete(&self, id: Uuid) -> TransferResult<Transfer> {
        let mut transfer = self.load_usable(id, "complete").await?;
        let next = transfer
            .status
            .apply(Transition::Complete)
            .map_err(|err| TransferError::invalid_transition(id, err, "complete"))?;
        let object_key = transfer
            .current_object_key()
            .map(str::to_string)
            .ok_or(TransferError::InvalidState {
                id,
                status: transfer.status,
                operation: "complete without an upload",
            })?;

        let head = with_timeout(self.policy.upstream_timeout, self.gateway.head(&object_key))
            .await
            .map_err(|err| TransferError::upstream("verify upload", err))?;

        let file = UploadedFile {
            filename: filename_from_key(&object_key).to_string(),
            file_type: head.content_type,
            file_size: head.size,
            uploaded_at: Utc::now(),
        };
        if !self.store.mark_ready(id, &object_key, &file).await? {
            return Err(TransferError::Conflict(id));
        }
        info!(transfer_id = %id, file_size = file.file_size, "transfer ready");

        transfer.status = next;
        transfer.filename = Some(file.filename);
        transfer.file_type = Some(file.file_type);
        transfer.file_size = Some(file.file_size);
        transfer.uploaded_at = Some(file.uploaded_at);
        Ok(transfer)
    }

    /// Presign a download and consume one unit of quota.
    ///
    /// The URL is presigned before the counter moves, so an object-store
    /// failure does not burn a download.
    pub async fn issue_download_url(
        &self,
        id: Uuid,
        expiry_minutes: Option<u64>,
    ) -> TransferResult<DownloadTicket> {
        let (transfer, object_key) = self.load_ready(id, "download").await?;
        if transfer.downloads_remaining() == 0 {
            return Err(TransferError::QuotaExceeded(id));
        }

        let presigned = with_timeout(
            self.policy.upstream_timeout,
            self.gateway
                .presign_get(&object_key, self.policy.download_ttl(expiry_minutes)),
        )
        .await
        .map_err(|err| gateway_failure("presign download", err))?;

        let admitted = self.quota.admit(id, Utc::now()).await?;
        Ok(DownloadTicket {
            download_url: presigned.url,
            expires_at: presigned.expires_at,
            download_count: admitted.download_count,
            max_downloads: admitted.max_downloads,
        })
    }

    pub async fn update(&self, id: Uuid, patch: TransferPatch) -> TransferResult<Transfer> {
        let now = Utc::now();
        if patch.expires_at.is_some_and(|at| at <= now) {
            return Err(TransferError::invalid_argument(
                "expires_at must be in the future",
            ));
        }
        if patch.max_downloads.is_some_and(|max| max < 1) {
            return Err(TransferError::invalid_argument(
                "max_downloads must be at least 1",
            ));
        }
        if patch.status.is_some_and(|status| !status.is_override_target()) {
            return Err(TransferError::invalid_argument(
                "status may only be set to READY or EXPIRED",
            ));
        }

        let transfer = self.expiry.load(id, now).await?;
        let current = transfer.status;
        if !current.accepts_updates() {
            return Err(TransferError::InvalidState {
                id,
                status: current,
                operation: "update",
            });
        }
        if patch
            .max_downloads
            .is_some_and(|max| max < transfer.download_count)
        {
            return Err(TransferError::invalid_argument(format!(
                "max_downloads cannot be below the {} downloads already issued",
                transfer.download_count
            )));
        }

        // A new deadline on an expired transfer revives it, whatever status
        // was asked for.
        let transition = match (current, patch.expires_at, patch.status) {
            (TransferStatus::Expired, Some(_), _) => Some(Transition::Revive),
            (_, _, Some(target)) => Some(Transition::Override(target)),
            _ => None,
        };
        let status = transition
            .map(|t| current.apply(t))
            .transpose()
            .map_err(|err| TransferError::invalid_transition(id, err, "update"))?;
        if transition == Some(Transition::Revive) {
            self.confirm_object(&transfer).await?;
        }

        let changes = TransferChanges {
            expires_at: patch.expires_at,
            max_downloads: patch.max_downloads,
            status: status.filter(|next| *next != current),
        };
        if changes.is_empty() {
            return Ok(transfer);
        }
        if !self.store.apply_changes(id, current, &changes).await? {
            return Err(TransferError::Conflict(id));
        }
        info!(transfer_id = %id, from = %current, ?changes, "transfer updated");

        self.store
            .fetch(id)
            .await?
            .ok_or(TransferError::NotFound(id))
    }

    /// Remove the backing object, then mark the record `DELETED`. A failed
    /// object delete still marks the record but keeps its key, so the
    /// cleanup sweep retries the purge.
    pub async fn delete(&self, id: Uuid) -> TransferResult<()> {
        let transfer = self
            .store
            .fetch(id)
            .await?
            .ok_or(TransferError::NotFound(id))?;

        if transfer.status == TransferStatus::Deleted {
            // Already terminal. Any leftover object belongs to the sweep.
            return Ok(());
        }
        transfer
            .status
            .apply(Transition::Delete)
            .map_err(|err| TransferError::invalid_transition(id, err, "delete"))?;

        let purged = match transfer.current_object_key() {
            None => true,
            Some(key) => {
                match with_timeout(self.policy.upstream_timeout, self.gateway.delete(key)).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(
                            transfer_id = %id,
                            object_key = %key,
                            error = %err,
                            "object delete failed, leaving it to cleanup"
                        );
                        false
                    }
                }
            }
        };

        if !self
            .store
            .mark_deleted(id, transfer.status, purged)
            .await?
        {
            return Err(TransferError::Conflict(id));
        }
        info!(transfer_id = %id, purged, "transfer deleted");
        Ok(())
    }

    /// Publish a share event carrying a fresh download link. Publishing runs
    /// in the background; this returns once it is scheduled.
    pub async fn share(&self, id: Uuid, emails: Vec<String>) -> TransferResult<()> {
        let publisher = self
            .publisher
            .clone()
            .ok_or(TransferError::FeatureDisabled("email notifications"))?;

        let emails: Vec<String> = emails.into_iter().map(|e| e.trim().to_string()).collect();
        if emails.is_empty() {
            return Err(TransferError::invalid_argument(
                "at least one email is required",
            ));
        }
        if let Some(bad) = emails.iter().find(|e| !looks_like_email(e)) {
            return Err(TransferError::invalid_argument(format!(
                "invalid email address `{}`",
                bad
            )));
        }

        let (transfer, object_key) = self.load_ready(id, "share").await?;
        let presigned = with_timeout(
            self.policy.upstream_timeout,
            self.gateway
                .presign_get(&object_key, self.policy.share_url_ttl),
        )
        .await
        .map_err(|err| gateway_failure("presign share link", err))?;

        let event =
            ShareEvent::transfer_shared(&transfer, emails, presigned.url, presigned.expires_at);
        self.tasks
            .spawn("publish_share", id.to_string(), async move {
                publisher.publish(&event).await.map(|_| ())
            });
        info!(transfer_id = %id, "share accepted");
        Ok(())
    }

    /// A transfer may only come back to `READY` if its upload was completed
    /// and the object store still has the object.
    async fn confirm_object(&self, transfer: &Transfer) -> TransferResult<()> {
        let key = match (transfer.uploaded_at, transfer.current_object_key()) {
            (Some(_), Some(key)) => key,
            _ => {
                return Err(TransferError::InvalidState {
                    id: transfer.id,
                    status: transfer.status,
                    operation: "revive without a completed upload",
                });
            }
        };
        match with_timeout(self.policy.upstream_timeout, self.gateway.head(key)).await {
            Ok(_) => Ok(()),
            Err(GatewayError::NotFound(_)) => Err(TransferError::InvalidState {
                id: transfer.id,
                status: transfer.status,
                operation: "revive after its object was removed",
            }),
            Err(err) => Err(TransferError::upstream("verify object before revive", err)),
        }
    }

    /// Load with lazy expiry, rejecting expired and deleted transfers.
    async fn load_usable(&self, id: Uuid, operation: &'static str) -> TransferResult<Transfer> {
        let transfer = self.expiry.load(id, Utc::now()).await?;
        match transfer.status {
            TransferStatus::Expired => Err(TransferError::Expired(id)),
            TransferStatus::Deleted => Err(TransferError::InvalidState {
                id,
                status: TransferStatus::Deleted,
                operation,
            }),
            _ => Ok(transfer),
        }
    }

    /// A usable `READY` transfer and its object key.
    async fn load_ready(
        &self,
        id: Uuid,
        operation: &'static str,
    ) -> TransferResult<(Transfer, String)> {
        let transfer = self.load_usable(id, operation).await?;
        if transfer.status != TransferStatus::Ready {
            return Err(TransferError::InvalidState {
                id,
                status: transfer.status,
                operation,
            });
        }
        let key = transfer
            .current_object_key()
            .map(str::to_string)
            .ok_or(TransferError::InvalidState {
                id,
                status: transfer.status,
                operation,
            })?;
        Ok((transfer, key))
    }
}

/// Invalid keys are a client fault; everything else is upstream trouble.
fn gateway_failure(context: &str, err: GatewayError) -> TransferError {
    match err {
        GatewayError::InvalidKey(reason) => TransferError::InvalidArgument(reason),
        other => TransferError::upstream(context, other),
    }
}

fn looks_like_email(candidate: &str) -> bool {
    candidate.contains('@') && candidate.contains('.') && !candidate.contains(char::is_whitespace)
}
