//! Presigned blob access: `PUT|GET|HEAD /blobs/{*key}`.
//!
//! These are the URLs handed out by the transfer endpoints. Every request is
//! checked against the signature in its query string before the blob store
//! is touched; bodies are streamed in both directions.

use crate::{
    errors::AppError,
    models::blob::BlobRecord,
    services::blob_store::{BlobOp, PresignedQuery},
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use futures::StreamExt;
use std::io;
use tokio_util::io::ReaderStream;

/// A presigned request missing its signature fields is denied, not malformed.
fn presigned(query: Result<Query<PresignedQuery>, QueryRejection>) -> Result<PresignedQuery, AppError> {
    query
        .map(|Query(q)| q)
        .map_err(|_| AppError::forbidden("missing or malformed signature parameters"))
}

/// Upload a payload to a presigned PUT URL.
pub async fn put_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    query: Result<Query<PresignedQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let query = presigned(query)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    state
        .blobs
        .authorize(BlobOp::Put, &key, &query, content_type, Utc::now())?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let record = state
        .blobs
        .write_stream(&key, content_type.unwrap_or_default(), stream)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", record.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// Stream a payload from a presigned GET URL.
pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    query: Result<Query<PresignedQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let query = presigned(query)?;
    state
        .blobs
        .authorize(BlobOp::Get, &key, &query, None, Utc::now())?;

    let (record, file) = state.blobs.open(&key).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_blob_headers(response.headers_mut(), &record);
    Ok(response)
}

/// HEAD with a GET signature: same headers, no body.
pub async fn head_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    query: Result<Query<PresignedQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let query = presigned(query)?;
    state
        .blobs
        .authorize(BlobOp::Get, &key, &query, None, Utc::now())?;

    let record = state.blobs.fetch_record(&key).await?;
    let mut response = Response::new(Body::empty());
    set_blob_headers(response.headers_mut(), &record);
    Ok(response)
}

fn set_blob_headers(headers: &mut HeaderMap, record: &BlobRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size_bytes.max(0)));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", record.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    let disposition = format!(
        "attachment; filename=\"{}\"",
        record.filename().replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
