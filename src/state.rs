use crate::services::{
    blob_store::LocalBlobStore, cleanup::CleanupReconciler, transfer_service::TransferService,
};
use sqlx::SqlitePool;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub transfers: TransferService,
    pub cleanup: CleanupReconciler,
    pub blobs: LocalBlobStore,
    pub db: SqlitePool,
}
