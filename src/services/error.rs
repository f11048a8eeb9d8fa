//! Error taxonomy shared by the transfer lifecycle services.

use super::object_gateway::GatewayError;
use crate::models::transfer::{InvalidTransition, TransferStatus};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed or out-of-range input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transfer `{0}` not found")]
    NotFound(Uuid),

    #[error("transfer `{0}` has expired")]
    Expired(Uuid),

    #[error("transfer `{0}` has reached its download limit")]
    QuotaExceeded(Uuid),

    #[error("cannot {operation} transfer `{id}` in state {status}")]
    InvalidState {
        id: Uuid,
        status: TransferStatus,
        operation: &'static str,
    },

    /// Another writer changed the record first.
    #[error("transfer `{0}` was modified concurrently")]
    Conflict(Uuid),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("{0} is not configured")]
    FeatureDisabled(&'static str),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl TransferError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        TransferError::InvalidArgument(msg.into())
    }

    pub fn invalid_transition(id: Uuid, err: InvalidTransition, operation: &'static str) -> Self {
        TransferError::InvalidState {
            id,
            status: err.from,
            operation,
        }
    }

    pub fn upstream(context: &str, err: GatewayError) -> Self {
        TransferError::UpstreamUnavailable(format!("{}: {}", context, err))
    }

    /// Terminal, gone-like outcomes that are not the caller's fault.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            TransferError::Expired(_) | TransferError::QuotaExceeded(_)
        )
    }
}
