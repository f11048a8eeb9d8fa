//! Defines routes for the transfer API and presigned blob access.
//!
//! ## Structure
//! - **Transfers**
//!   - `POST   /transfers`: create
//!   - `GET    /transfers`: list (status, sort_by, order, limit, offset)
//!   - `GET|PATCH|DELETE /transfers/{id}`
//!   - `POST   /transfers/{id}/upload-url`
//!   - `POST   /transfers/{id}/complete`
//!   - `GET    /transfers/{id}/download-url`
//!   - `POST   /transfers/{id}/share-download`
//!
//! - **Blobs** (presigned URLs only)
//!   - `PUT|GET|HEAD /blobs/{*key}`
//!
//! - **Admin**
//!   - `POST   /admin/cleanup`: run one cleanup sweep

use crate::{
    handlers::{
        blob_handlers::{get_blob, head_blob, put_blob},
        health_handlers::{healthz, readyz},
        transfer_handlers::{
            complete_transfer, create_transfer, delete_transfer, get_transfer, issue_download_url,
            issue_upload_url, list_transfers, share_download, trigger_cleanup, update_transfer,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

/// Build the router. State is attached by the caller with `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/transfers", post(create_transfer).get(list_transfers))
        .route(
            "/transfers/{id}",
            get(get_transfer)
                .patch(update_transfer)
                .delete(delete_transfer),
        )
        .route("/transfers/{id}/upload-url", post(issue_upload_url))
        .route("/transfers/{id}/complete", post(complete_transfer))
        .route("/transfers/{id}/download-url", get(issue_download_url))
        .route("/transfers/{id}/share-download", post(share_download))
        .route("/admin/cleanup", post(trigger_cleanup))
        .route("/blobs/{*key}", put(put_blob).get(get_blob).head(head_blob))
        .layer(TraceLayer::new_for_http())
}
