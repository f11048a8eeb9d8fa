//! HTTP handlers for the transfer lifecycle.
//! Each handler parses its input, calls into `TransferService` and renders
//! the result; lifecycle rules live in the service.

use crate::{
    errors::AppError,
    models::transfer::{ListQuery, SortKey, SortOrder, Transfer, TransferPage, TransferStatus},
    services::{
        cleanup::SweepReport,
        transfer_service::{DownloadTicket, NewTransfer, TransferPatch, UploadTicket},
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    pub expires_at: DateTime<Utc>,
    pub max_downloads: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateTransferResponse {
    pub id: Uuid,
    pub status: TransferStatus,
}

/// Query params accepted by `GET /transfers`.
#[derive(Debug, Default, Deserialize)]
pub struct ListTransfersQuery {
    pub status: Option<String>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTransferRequest {
    pub expires_at: Option<DateTime<Utc>>,
    pub max_downloads: Option<i64>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadUrlRequest {
    pub filename: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub id: Uuid,
    pub status: TransferStatus,
    pub filename: Option<String>,
    pub file_type: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadUrlQuery {
    pub expiry_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    #[serde(default)]
    pub emails: Vec<String>,
}

fn transfer_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, AppError> {
    path.map(|Path(id)| id)
        .map_err(|_| AppError::bad_request("invalid transfer id"))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

fn parse_status(raw: &str) -> Result<TransferStatus, AppError> {
    raw.parse::<TransferStatus>().map_err(AppError::bad_request)
}

fn parse_sort_key(raw: &str) -> Result<SortKey, AppError> {
    match raw {
        "created_at" => Ok(SortKey::CreatedAt),
        "expires_at" => Ok(SortKey::ExpiresAt),
        "max_downloads" => Ok(SortKey::MaxDownloads),
        "file_size" => Ok(SortKey::FileSize),
        other => Err(AppError::bad_request(format!(
            "unsupported sort_by `{}`",
            other
        ))),
    }
}

fn parse_order(raw: &str) -> Result<SortOrder, AppError> {
    match raw.to_ascii_lowercase().as_str() {
        "asc" => Ok(SortOrder::Asc),
        "desc" => Ok(SortOrder::Desc),
        other => Err(AppError::bad_request(format!("unsupported order `{}`", other))),
    }
}

impl ListTransfersQuery {
    fn into_list_query(self) -> Result<ListQuery, AppError> {
        let defaults = ListQuery::default();
        Ok(ListQuery {
            status: self.status.as_deref().map(parse_status).transpose()?,
            sort_by: match self.sort_by.as_deref() {
                Some(raw) => parse_sort_key(raw)?,
                None => defaults.sort_by,
            },
            order: match self.order.as_deref() {
                Some(raw) => parse_order(raw)?,
                None => defaults.order,
            },
            limit: self.limit.unwrap_or(defaults.limit),
            offset: self.offset.unwrap_or(defaults.offset),
        })
    }
}

/// POST `/transfers`
pub async fn create_transfer(
    State(state): State<AppState>,
    body: Result<Json<CreateTransferRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let req = json_body(body)?;
    let transfer = state
        .transfers
        .create(NewTransfer {
            expires_at: req.expires_at,
            max_downloads: req.max_downloads,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTransferResponse {
            id: transfer.id,
            status: transfer.status,
        }),
    ))
}

/// GET `/transfers`: supports ?status=&sort_by=&order=&limit=&offset=
pub async fn list_transfers(
    State(state): State<AppState>,
    query: Result<Query<ListTransfersQuery>, QueryRejection>,
) -> Result<Json<TransferPage>, AppError> {
    let Query(params) = query.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let page = state.transfers.list(params.into_list_query()?).await?;
    Ok(Json(page))
}

/// GET `/transfers/{id}`
pub async fn get_transfer(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Transfer>, AppError> {
    let transfer = state.transfers.get(transfer_id(id)?).await?;
    Ok(Json(transfer))
}

/// PATCH `/transfers/{id}`
pub async fn update_transfer(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<UpdateTransferRequest>, JsonRejection>,
) -> Result<Json<Transfer>, AppError> {
    let id = transfer_id(id)?;
    let req = json_body(body)?;
    let patch = TransferPatch {
        expires_at: req.expires_at,
        max_downloads: req.max_downloads,
        status: req.status.as_deref().map(parse_status).transpose()?,
    };
    let transfer = state.transfers.update(id, patch).await?;
    Ok(Json(transfer))
}

/// DELETE `/transfers/{id}`
pub async fn delete_transfer(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode, AppError> {
    state.transfers.delete(transfer_id(id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/transfers/{id}/upload-url`
pub async fn issue_upload_url(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<UploadUrlRequest>, JsonRejection>,
) -> Result<Json<UploadTicket>, AppError> {
    let id = transfer_id(id)?;
    let req = json_body(body)?;
    let ticket = state
        .transfers
        .issue_upload_url(id, &req.filename, req.content_type.as_deref())
        .await?;
    Ok(Json(ticket))
}

/// POST `/transfers/{id}/complete`
pub async fn complete_transfer(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<CompleteResponse>, AppError> {
    let transfer = state.transfers.complete(transfer_id(id)?).await?;
    Ok(Json(CompleteResponse {
        id: transfer.id,
        status: transfer.status,
        filename: transfer.filename,
        file_type: transfer.file_type,
        file_size: transfer.file_size,
    }))
}

/// GET `/transfers/{id}/download-url?expiry_minutes=`
pub async fn issue_download_url(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<DownloadUrlQuery>, QueryRejection>,
) -> Result<Json<DownloadTicket>, AppError> {
    let id = transfer_id(id)?;
    let Query(params) = query.map_err(|_| AppError::bad_request("invalid expiry_minutes"))?;
    let ticket = state
        .transfers
        .issue_download_url(id, params.expiry_minutes)
        .await?;
    Ok(Json(ticket))
}

/// POST `/transfers/{id}/share-download`
pub async fn share_download(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<ShareRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let id = transfer_id(id)?;
    let req = json_body(body)?;
    state.transfers.share(id, req.emails).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

/// POST `/admin/cleanup`: run one sweep now.
pub async fn trigger_cleanup(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    let report = state.cleanup.run_once().await?;
    tracing::info!(
        expired = report.expired,
        purged = report.purged,
        failed = report.failed,
        "manual cleanup finished"
    );
    Ok(Json(report))
}
