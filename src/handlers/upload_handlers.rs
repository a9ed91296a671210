//! HTTP handlers for upload sessions.
//! Thin adapters: decode the request, call `UploadCoordinator`, encode the
//! result. Chunk bodies arrive as raw bytes.

use crate::{
    errors::AppError,
    models::{
        progress::{ChunkReceipt, FinalizedUpload, ResumeInfo, UploadProgress},
        upload_session::UploadStatus,
    },
    services::upload_coordinator::{InitUpload, UploadCoordinator},
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State, rejection::PathRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Body of `POST /uploads`.
#[derive(Debug, Deserialize)]
pub struct InitUploadReq {
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: Option<u64>,
    pub mime_type: Option<String>,
    pub owner_reference: Option<String>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct InitUploadResp {
    pub upload_id: Uuid,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    pub owner_reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResp {
    pub upload_id: Uuid,
    pub status: UploadStatus,
}

fn path_error(rejection: PathRejection) -> AppError {
    AppError::bad_request(rejection.body_text())
}

/// `POST /uploads`
pub async fn init_upload(
    State(coordinator): State<UploadCoordinator>,
    Json(req): Json<InitUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let session = coordinator
        .init(InitUpload {
            filename: req.filename,
            total_size: req.total_size,
            chunk_size: req.chunk_size,
            mime_type: req.mime_type,
            owner_reference: req.owner_reference,
            ttl: req.ttl_seconds.map(Duration::from_secs),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(InitUploadResp {
            upload_id: session.id,
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
            expires_at: session.expires_at,
        }),
    ))
}

/// `POST /uploads/{id}/chunks/{n}`
pub async fn upload_chunk(
    State(coordinator): State<UploadCoordinator>,
    path: Result<Path<(Uuid, u32)>, PathRejection>,
    body: Bytes,
) -> Result<Json<ChunkReceipt>, AppError> {
    let Path((id, chunk_number)) = path.map_err(path_error)?;
    let receipt = coordinator.accept_chunk(id, chunk_number, body).await?;
    Ok(Json(receipt))
}

/// `GET /uploads/{id}`
pub async fn get_progress(
    State(coordinator): State<UploadCoordinator>,
    path: Result<Path<Uuid>, PathRejection>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<UploadProgress>, AppError> {
    let Path(id) = path.map_err(path_error)?;
    let progress = coordinator
        .progress(id, query.owner_reference.as_deref())
        .await?;
    Ok(Json(progress))
}

/// `GET /uploads/{id}/resume`
pub async fn resume_upload(
    State(coordinator): State<UploadCoordinator>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ResumeInfo>, AppError> {
    let Path(id) = path.map_err(path_error)?;
    Ok(Json(coordinator.resume(id).await?))
}

/// `POST /uploads/{id}/finalize`
pub async fn finalize_upload(
    State(coordinator): State<UploadCoordinator>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<FinalizedUpload>, AppError> {
    let Path(id) = path.map_err(path_error)?;
    Ok(Json(coordinator.finalize(id).await?))
}

/// `DELETE /uploads/{id}`
pub async fn cancel_upload(
    State(coordinator): State<UploadCoordinator>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<CancelResp>, AppError> {
    let Path(id) = path.map_err(path_error)?;
    let status = coordinator.cancel(id).await?;
    Ok(Json(CancelResp {
        upload_id: id,
        status,
    }))
}
