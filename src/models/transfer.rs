//! The transfer record and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix under which every uploaded object lives in the object store.
pub const UPLOAD_PREFIX: &str = "uploads";

/// Lifecycle state of a transfer.
///
/// Stored as upper-case text. Transitions between states go exclusively
/// through [`TransferStatus::apply`], which is the only place that knows which
/// moves are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum TransferStatus {
    /// Created, waiting for the upload to be confirmed.
    Init,
    /// Upload confirmed; downloads allowed.
    Ready,
    /// Past its deadline or expired by an administrator.
    Expired,
    /// Terminal. The backing object is gone or queued for purge.
    Deleted,
}

/// A requested lifecycle move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The object store confirmed the upload.
    Complete,
    /// The deadline passed.
    Expire,
    /// A new deadline was supplied while expired.
    Revive,
    /// Administrative status override.
    Override(TransferStatus),
    /// Explicit delete request.
    Delete,
    /// The cleanup sweep removed the backing object.
    Purge,
}

/// Rejected lifecycle move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TransferStatus,
    pub transition: Transition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not allowed from {}", self.transition, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

impl TransferStatus {
    pub const ALL: [TransferStatus; 4] = [
        TransferStatus::Init,
        TransferStatus::Ready,
        TransferStatus::Expired,
        TransferStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Init => "INIT",
            TransferStatus::Ready => "READY",
            TransferStatus::Expired => "EXPIRED",
            TransferStatus::Deleted => "DELETED",
        }
    }

    /// Compute the state reached by `transition`, rejecting every move not
    /// listed here.
    pub fn apply(self, transition: Transition) -> Result<TransferStatus, InvalidTransition> {
        use TransferStatus::*;

        let next = match (self, transition) {
            (Init, Transition::Complete) => Ready,
            (Init | Ready, Transition::Expire) => Expired,
            (Expired, Transition::Revive) => Ready,
            (Ready, Transition::Override(Ready)) => Ready,
            (Ready | Expired, Transition::Override(Expired)) => Expired,
            (Init | Ready | Expired, Transition::Delete) => Deleted,
            (Expired | Deleted, Transition::Purge) => Deleted,
            _ => {
                return Err(InvalidTransition {
                    from: self,
                    transition,
                });
            }
        };
        Ok(next)
    }

    /// Whether administrative updates are accepted in this state.
    pub fn accepts_updates(self) -> bool {
        matches!(self, TransferStatus::Ready | TransferStatus::Expired)
    }

    /// States an administrator may request explicitly.
    pub fn is_override_target(self) -> bool {
        matches!(self, TransferStatus::Ready | TransferStatus::Expired)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INIT" => Ok(TransferStatus::Init),
            "READY" => Ok(TransferStatus::Ready),
            "EXPIRED" => Ok(TransferStatus::Expired),
            "DELETED" => Ok(TransferStatus::Deleted),
            other => Err(format!("unknown transfer status `{}`", other)),
        }
    }
}

/// A single file-sharing session.
///
/// `object_key` is never serialized: it is an internal reference into the
/// object store, not something clients address directly.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq)]
pub struct Transfer {
    pub id: Uuid,
    pub status: TransferStatus,
    /// `None` means the transfer never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub download_count: i64,
    pub max_downloads: i64,
    #[serde(skip_serializing)]
    pub object_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub filename: Option<String>,
    pub file_type: Option<String>,
    pub file_size: Option<i64>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl Transfer {
    /// A fresh `INIT` record.
    pub fn pending(expires_at: DateTime<Utc>, max_downloads: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TransferStatus::Init,
            expires_at: Some(expires_at),
            download_count: 0,
            max_downloads,
            object_key: None,
            created_at: now,
            filename: None,
            file_type: None,
            file_size: None,
            uploaded_at: None,
        }
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }

    /// Status after accounting for the deadline, regardless of what the
    /// stored column says.
    pub fn effective_status(&self, now: DateTime<Utc>) -> TransferStatus {
        match self.status {
            TransferStatus::Init | TransferStatus::Ready if self.is_past_deadline(now) => {
                TransferStatus::Expired
            }
            status => status,
        }
    }

    /// The stored object key, if one has been issued and not purged.
    pub fn current_object_key(&self) -> Option<&str> {
        self.object_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn downloads_remaining(&self) -> i64 {
        (self.max_downloads - self.download_count).max(0)
    }
}

/// Authoritative file metadata captured when a transfer becomes `READY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub uploaded_at: DateTime<Utc>,
}

/// Reject filenames that could escape the transfer's key namespace.
pub fn validate_filename(filename: &str) -> Result<(), &'static str> {
    if filename.trim().is_empty() {
        return Err("filename must not be empty");
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err("filename must not contain path separators");
    }
    if filename.contains("..") {
        return Err("filename must not contain `..`");
    }
    if filename.chars().any(char::is_control) {
        return Err("filename must not contain control characters");
    }
    Ok(())
}

/// Deterministic object key for a transfer's upload.
pub fn object_key_for(id: Uuid, filename: &str) -> String {
    format!("{}/{}/{}", UPLOAD_PREFIX, id, filename)
}

/// Final path segment of an object key.
pub fn filename_from_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Columns a listing may be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    CreatedAt,
    ExpiresAt,
    MaxDownloads,
    FileSize,
}

impl SortKey {
    pub fn column(&self) -> &'static str {
        match self {
            SortKey::CreatedAt => "created_at",
            SortKey::ExpiresAt => "expires_at",
            SortKey::MaxDownloads => "max_downloads",
            SortKey::FileSize => "file_size",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filters, ordering and paging for a transfer listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub status: Option<TransferStatus>,
    pub sort_by: SortKey,
    pub order: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            sort_by: SortKey::default(),
            order: SortOrder::default(),
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct TransferPage {
    pub items: Vec<Transfer>,
    pub limit: i64,
    pub offset: i64,
    pub total_count: i64,
}
