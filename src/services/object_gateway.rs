//! The object-store capability the transfer lifecycle depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Authoritative metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: i64,
    pub content_type: String,
}

/// A time-boxed URL permitting one operation on one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("object `{0}` not found")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),

    #[error("presign ttl out of range: {0:?}")]
    InvalidTtl(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ObjectGateway: Send + Sync {
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, GatewayError>;

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, GatewayError>;

    async fn head(&self, key: &str) -> Result<ObjectHead, GatewayError>;

    /// Removing a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<(), GatewayError>;
}

/// Bound a gateway call with its own deadline.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Unavailable(format!(
            "timed out after {:?}",
            limit
        ))),
    }
}
