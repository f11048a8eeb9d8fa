//! Metadata for a payload held by the local blob store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A stored blob, addressed by its object key.
///
/// Only metadata lives here; the bytes are on disk beneath the blob root.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq)]
pub struct BlobRecord {
    /// Object key (path-like, e.g. `uploads/{transfer}/{filename}`).
    pub key: String,

    /// Content type recorded from the upload request.
    pub content_type: String,

    /// Size in bytes, measured while streaming to disk.
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: String,

    pub last_modified: DateTime<Utc>,
}

impl BlobRecord {
    /// Final path segment of the key.
    pub fn filename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}
