//! LocalBlobStore: the production `ObjectGateway`. Payloads live on local
//! disk sharded beneath `base_path/{shard}/{shard}/{key}`; metadata lives in
//! the `blobs` table. Clients never talk to this store without a presigned
//! URL: every URL carries the operation, an expiry and an Ed25519 signature
//! over both, which the blob handlers check with [`LocalBlobStore::authorize`].

use super::object_gateway::{GatewayError, ObjectGateway, ObjectHead, PresignedUrl};
use crate::models::blob::BlobRecord;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Longest validity a presigned URL may carry.
pub const MAX_PRESIGN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The operation a presigned URL grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobOp {
    Put,
    Get,
}

impl BlobOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobOp::Put => "PUT",
            BlobOp::Get => "GET",
        }
    }
}

/// Query parameters carried by a presigned URL.
#[derive(Debug, Clone, Deserialize)]
pub struct PresignedQuery {
    #[serde(rename = "X-Op")]
    pub op: String,
    #[serde(rename = "X-Expires")]
    pub expires: i64,
    #[serde(rename = "X-Content-Type", default)]
    pub content_type: String,
    #[serde(rename = "X-Signature")]
    pub signature: String,
}

#[derive(Debug, Error)]
pub enum BlobAccessError {
    #[error("url is not valid for {0}")]
    WrongOperation(&'static str),
    #[error("url has expired")]
    UrlExpired,
    #[error("signature does not match")]
    BadSignature,
    #[error("content type does not match the signed value")]
    ContentTypeMismatch,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Signs and verifies presigned URL parameters.
pub struct UrlSigner {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl UrlSigner {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// A process-local key. URLs stop verifying after a restart.
    pub fn random() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    fn message(op: BlobOp, key: &str, expires: i64, content_type: &str) -> String {
        format!("{}\n{}\n{}\n{}", op.as_str(), key, expires, content_type)
    }

    pub fn sign(&self, op: BlobOp, key: &str, expires: i64, content_type: &str) -> String {
        let msg = Self::message(op, key, expires, content_type);
        URL_SAFE_NO_PAD.encode(self.signing.sign(msg.as_bytes()).to_bytes())
    }

    pub fn verify(
        &self,
        op: BlobOp,
        key: &str,
        expires: i64,
        content_type: &str,
        signature: &str,
    ) -> bool {
        let Ok(raw) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(raw.as_slice()) else {
            return false;
        };
        let msg = Self::message(op, key, expires, content_type);
        self.verifying
            .verify(msg.as_bytes(), &Signature::from_bytes(&bytes))
            .is_ok()
    }
}

#[derive(Clone)]
pub struct LocalBlobStore {
    db: SqlitePool,
    base_path: PathBuf,
    public_url: String,
    signer: Arc<UrlSigner>,
}

impl LocalBlobStore {
    pub fn new(
        db: SqlitePool,
        base_path: impl Into<PathBuf>,
        public_url: impl Into<String>,
        signer: UrlSigner,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            signer: Arc::new(signer),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects keys that begin with `/`, contain `..`, backslashes or
    /// control characters, or exceed 1024 bytes.
    fn ensure_key_safe(key: &str) -> Result<(), GatewayError> {
        let reason = if key.is_empty() {
            "empty key"
        } else if key.len() > MAX_OBJECT_KEY_LEN {
            "key too long"
        } else if key.starts_with('/') || key.contains("..") {
            "path traversal"
        } else if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            "illegal character"
        } else {
            return Ok(());
        };
        Err(GatewayError::InvalidKey(format!("{}: {}", reason, key)))
    }

    /// Two-level shard identifiers from MD5(key).
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn url_for(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string())
            .collect();
        format!("{}/blobs/{}", self.public_url, encoded.join("/"))
    }

    fn presign(
        &self,
        op: BlobOp,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, GatewayError> {
        Self::ensure_key_safe(key)?;
        if ttl.is_zero() || ttl > MAX_PRESIGN_TTL {
            return Err(GatewayError::InvalidTtl(ttl));
        }
        let delta = TimeDelta::from_std(ttl).map_err(|_| GatewayError::InvalidTtl(ttl))?;
        let deadline = Utc::now() + delta;
        let expires = deadline.timestamp();
        let signature = self.signer.sign(op, key, expires, content_type);

        let url = format!(
            "{}?X-Op={}&X-Expires={}&X-Content-Type={}&X-Signature={}",
            self.url_for(key),
            op.as_str(),
            expires,
            utf8_percent_encode(content_type, NON_ALPHANUMERIC),
            signature
        );
        Ok(PresignedUrl {
            url,
            expires_at: DateTime::from_timestamp(expires, 0).unwrap_or(deadline),
        })
    }

    /// Check a presigned request. `request_content_type` is only consulted
    /// for uploads.
    pub fn authorize(
        &self,
        op: BlobOp,
        key: &str,
        query: &PresignedQuery,
        request_content_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), BlobAccessError> {
        Self::ensure_key_safe(key)?;
        if query.op != op.as_str() {
            return Err(BlobAccessError::WrongOperation(op.as_str()));
        }
        if now.timestamp() > query.expires {
            return Err(BlobAccessError::UrlExpired);
        }
        if !self.signer.verify(
            op,
            key,
            query.expires,
            &query.content_type,
            &query.signature,
        ) {
            return Err(BlobAccessError::BadSignature);
        }
        if op == BlobOp::Put && request_content_type.unwrap_or_default() != query.content_type {
            return Err(BlobAccessError::ContentTypeMismatch);
        }
        Ok(())
    }

    pub async fn fetch_record(&self, key: &str) -> Result<BlobRecord, GatewayError> {
        Self::ensure_key_safe(key)?;
        sqlx::query_as::<_, BlobRecord>(
            "SELECT key, content_type, size_bytes, etag, last_modified
             FROM blobs WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| GatewayError::NotFound(key.to_string()))
    }

    /// Stream a payload to disk and upsert its metadata.
    ///
    /// Bytes go to a temporary file that is fsynced and renamed into place,
    /// so readers never observe a partial object.
    pub async fn write_stream<S>(
        &self,
        key: &str,
        content_type: &str,
        stream: S,
    ) -> Result<BlobRecord, GatewayError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => {
                    size_bytes += chunk.len() as i64;
                    digest.consume(&chunk);
                    file.write_all(&chunk).await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
        if let Err(err) = finish(&mut file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        let inserted = sqlx::query_as::<_, BlobRecord>(
            r#"
            INSERT INTO blobs (key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(key)
        .bind(content_type)
        .bind(size_bytes)
        .bind(format!("{:x}", digest.compute()))
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await;

        match inserted {
            Ok(record) => {
                debug!(object_key = %key, size_bytes, "stored blob");
                Ok(record)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(err.into())
            }
        }
    }

    /// Metadata plus an open handle for streaming the payload out.
    pub async fn open(&self, key: &str) -> Result<(BlobRecord, File), GatewayError> {
        let record = self.fetch_record(key).await?;
        let file = File::open(self.object_path(key))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => GatewayError::NotFound(key.to_string()),
                _ => GatewayError::Io(err),
            })?;
        Ok((record, file))
    }

    /// Remove metadata and payload. Missing keys are not an error.
    pub async fn remove(&self, key: &str) -> Result<(), GatewayError> {
        Self::ensure_key_safe(key)?;
        sqlx::query("DELETE FROM blobs WHERE key = ?")
            .bind(key)
            .execute(&self.db)
            .await?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    /// Walk upwards from `start` removing empty directories, stopping at
    /// `stop` or the first directory that still has entries.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

async fn finish(file: &mut File) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

#[async_trait]
impl ObjectGateway for LocalBlobStore {
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, GatewayError> {
        self.presign(BlobOp::Put, key, content_type, ttl)
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, GatewayError> {
        self.presign(BlobOp::Get, key, "", ttl)
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, GatewayError> {
        let record = self.fetch_record(key).await?;
        Ok(ObjectHead {
            size: record.size_bytes,
            content_type: record.content_type,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        self.remove(key).await
    }
}
