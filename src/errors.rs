use crate::services::{
    blob_store::BlobAccessError, cleanup::SweepError, error::TransferError,
    object_gateway::GatewayError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        if err.is_gone() {
            tracing::debug!(error = %err, "transfer unusable");
        }
        match &err {
            TransferError::InvalidArgument(msg) => AppError::bad_request(msg.clone()),
            TransferError::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, err.to_string()),
            TransferError::Expired(_) => AppError::new(StatusCode::GONE, "transfer_expired"),
            TransferError::QuotaExceeded(_) => {
                AppError::new(StatusCode::GONE, "transfer_limit_reached")
            }
            TransferError::InvalidState { .. } | TransferError::Conflict(_) => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            TransferError::UpstreamUnavailable(_) => {
                tracing::warn!(error = %err, "upstream failure");
                AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            TransferError::FeatureDisabled(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            TransferError::Database(db) => {
                tracing::error!(error = %db, "database error");
                AppError::internal("internal database error")
            }
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(key) => {
                AppError::new(StatusCode::NOT_FOUND, format!("object `{}` not found", key))
            }
            GatewayError::InvalidKey(_) | GatewayError::InvalidTtl(_) => {
                AppError::bad_request(err.to_string())
            }
            GatewayError::Unavailable(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            GatewayError::Io(_) | GatewayError::Database(_) => {
                tracing::error!(error = %err, "blob store failure");
                AppError::internal("internal storage error")
            }
        }
    }
}

impl From<BlobAccessError> for AppError {
    fn from(err: BlobAccessError) -> Self {
        match err {
            BlobAccessError::Gateway(inner) => inner.into(),
            denied => AppError::forbidden(denied.to_string()),
        }
    }
}

impl From<SweepError> for AppError {
    fn from(err: SweepError) -> Self {
        match err {
            SweepError::TimedOut(_) => AppError::new(StatusCode::GATEWAY_TIMEOUT, err.to_string()),
            SweepError::Database(db) => {
                tracing::error!(error = %db, "database error during cleanup");
                AppError::internal("internal database error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transfer::TransferStatus;
    use uuid::Uuid;

    #[test]
    fn test_transfer_error_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (TransferError::invalid_argument("bad"), StatusCode::BAD_REQUEST),
            (TransferError::NotFound(id), StatusCode::NOT_FOUND),
            (TransferError::Expired(id), StatusCode::GONE),
            (TransferError::QuotaExceeded(id), StatusCode::GONE),
            (
                TransferError::InvalidState {
                    id,
                    status: TransferStatus::Deleted,
                    operation: "download",
                },
                StatusCode::CONFLICT,
            ),
            (TransferError::Conflict(id), StatusCode::CONFLICT),
            (
                TransferError::UpstreamUnavailable("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                TransferError::FeatureDisabled("email notifications"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn test_gone_errors_use_stable_codes() {
        let id = Uuid::new_v4();
        assert_eq!(AppError::from(TransferError::Expired(id)).message, "transfer_expired");
        assert_eq!(
            AppError::from(TransferError::QuotaExceeded(id)).message,
            "transfer_limit_reached"
        );
    }

    #[test]
    fn test_blob_access_denial_is_forbidden() {
        assert_eq!(
            AppError::from(BlobAccessError::BadSignature).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(BlobAccessError::Gateway(GatewayError::NotFound("k".into()))).status,
            StatusCode::NOT_FOUND
        );
    }
}
