//! Read-only views of an upload session returned to callers.

use crate::models::upload_session::{CompletedPart, UploadStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Snapshot returned by the progress query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub upload_id: Uuid,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub chunks_completed: u32,
    pub total_chunks: u32,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Where a client that lost its local state should continue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeInfo {
    pub upload_id: Uuid,
    pub next_expected_chunk: u32,
    pub uploaded_chunks: u32,
    pub completed_parts: Vec<CompletedPart>,
    pub remaining_chunks: u32,
    #[serde(rename = "progress_percentage")]
    pub percentage: f64,
    pub status: UploadStatus,
}

/// Response to an accepted (or replayed) chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkReceipt {
    pub upload_id: Uuid,
    pub chunk_number: u32,
    pub uploaded_size: u64,
    pub total_size: u64,
    pub progress_percentage: f64,
    pub remaining_chunks: u32,
}

/// Outcome of a successful finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizedUpload {
    pub upload_id: Uuid,
    pub object_id: String,
    pub final_size: u64,
}
