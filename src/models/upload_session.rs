//! Upload session entity and its transition rules.
//!
//! Every transition is a pure function from the current snapshot to the next
//! one (or a typed rejection). Nothing here performs I/O, which keeps the
//! sequencing and status rules testable without a database or remote store.

use crate::{
    errors::{UploadError, UploadResult},
    models::progress::{ChunkReceipt, ResumeInfo, UploadProgress},
    services::integrity,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle status of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Initiated,
    Uploading,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown upload status `{other}`")),
        }
    }
}

/// One accepted chunk, durably stored remotely as a part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number (1-based).
    pub chunk_number: u32,
    /// Lowercase hex SHA-1 of the chunk bytes.
    pub content_sha1: String,
    /// Size in bytes.
    pub size: u64,
}

/// Parameters validated by the coordinator before a session is created.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub owner_reference: Option<String>,
    pub ttl: Duration,
}

/// What the coordinator should do with an incoming chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// New chunk: send it to the remote store tagged with this digest.
    Upload { content_sha1: String },
    /// Identical resubmission of an already accepted chunk.
    Replay(CompletedPart),
}

/// All state for one upload attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub owner_reference: Option<String>,
    pub remote_handle: String,
    pub next_expected_chunk: u32,
    pub completed_parts: Vec<CompletedPart>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub remote_object_id: Option<String>,
    pub final_size: Option<u64>,
    /// Optimistic-concurrency counter, bumped by every successful save.
    #[serde(skip)]
    pub version: i64,
}

/// Number of chunks needed to cover `total_size` bytes.
pub fn total_chunks_for(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Byte length chunk `chunk_number` must have: `chunk_size` for every chunk
/// but the last, which carries the remainder.
pub fn expected_chunk_len(total_size: u64, chunk_size: u64, chunk_number: u32) -> u64 {
    let offset = u64::from(chunk_number.saturating_sub(1)) * chunk_size;
    total_size.saturating_sub(offset).min(chunk_size)
}

impl UploadSession {
    /// Build a freshly initiated session around a remote handle.
    pub fn new(params: NewSession, remote_handle: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: params.filename,
            mime_type: params.mime_type,
            total_size: params.total_size,
            chunk_size: params.chunk_size,
            total_chunks: params.total_chunks,
            owner_reference: params.owner_reference,
            remote_handle,
            next_expected_chunk: 1,
            completed_parts: Vec::new(),
            status: UploadStatus::Initiated,
            created_at: now,
            expires_at: now
                .checked_add_signed(params.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            completed_at: None,
            failed_at: None,
            error_message: None,
            remote_object_id: None,
            final_size: None,
            version: 0,
        }
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.completed_parts.iter().map(|p| p.size).sum()
    }

    pub fn chunks_completed(&self) -> u32 {
        self.completed_parts.len() as u32
    }

    pub fn remaining_chunks(&self) -> u32 {
        self.total_chunks.saturating_sub(self.chunks_completed())
    }

    pub fn is_fully_uploaded(&self) -> bool {
        self.chunks_completed() >= self.total_chunks
    }

    /// Uploaded share of the asset in percent, rounded to one decimal. Stays
    /// below 100.0 until every byte is in.
    pub fn progress_percentage(&self) -> f64 {
        self.percentage_of(self.uploaded_bytes())
    }

    fn percentage_of(&self, bytes: u64) -> f64 {
        if bytes >= self.total_size {
            return 100.0;
        }
        let ratio = bytes as f64 / self.total_size as f64;
        ((ratio * 1000.0).round() / 10.0).min(99.9)
    }

    /// Guards shared by every operation that needs a live session.
    fn ensure_live(&self, now: DateTime<Utc>, operation: &'static str) -> UploadResult<()> {
        if self.status == UploadStatus::Expired {
            return Err(UploadError::Expired(self.id));
        }
        if self.status.is_terminal() {
            return Err(UploadError::InvalidState {
                status: self.status,
                operation,
            });
        }
        if self.is_past_expiry(now) {
            return Err(UploadError::Expired(self.id));
        }
        Ok(())
    }

    /// Decide how to handle `bytes` submitted as `chunk_number` without
    /// changing the session.
    pub fn check_chunk(
        &self,
        chunk_number: u32,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> UploadResult<ChunkDisposition> {
        self.ensure_live(now, "accept a chunk for")?;

        if (1..self.next_expected_chunk).contains(&chunk_number) {
            let recorded = self.completed_parts.get((chunk_number - 1) as usize);
            if let Some(recorded) = recorded {
                if integrity::verify_chunk(&recorded.content_sha1, bytes) {
                    return Ok(ChunkDisposition::Replay(recorded.clone()));
                }
            }
        }

        // Anything but the next chunk, including numbers past the last one.
        if chunk_number != self.next_expected_chunk || chunk_number > self.total_chunks {
            return Err(UploadError::OutOfSequence {
                expected: self.next_expected_chunk,
                received: chunk_number,
            });
        }

        self.ensure_chunk_len(chunk_number, bytes.len() as u64)?;

        Ok(ChunkDisposition::Upload {
            content_sha1: integrity::hash_chunk(bytes),
        })
    }

    fn ensure_chunk_len(&self, chunk_number: u32, len: u64) -> UploadResult<()> {
        let expected = expected_chunk_len(self.total_size, self.chunk_size, chunk_number);
        if len != expected {
            return Err(UploadError::InvalidRequest(format!(
                "chunk {chunk_number} must be {expected} bytes, got {len}"
            )));
        }
        Ok(())
    }

    /// Record a chunk the remote store has acknowledged.
    pub fn accept_chunk(&self, part: CompletedPart, now: DateTime<Utc>) -> UploadResult<Self> {
        self.ensure_live(now, "accept a chunk for")?;
        if part.chunk_number != self.next_expected_chunk || part.chunk_number > self.total_chunks {
            return Err(UploadError::OutOfSequence {
                expected: self.next_expected_chunk,
                received: part.chunk_number,
            });
        }
        self.ensure_chunk_len(part.chunk_number, part.size)?;

        let mut next = self.clone();
        next.completed_parts.push(part);
        next.next_expected_chunk += 1;
        next.status = UploadStatus::Uploading;
        Ok(next)
    }

    /// Check that finalization may be attempted.
    pub fn ensure_finalizable(&self, now: DateTime<Utc>) -> UploadResult<()> {
        self.ensure_live(now, "finalize")?;
        if !self.is_fully_uploaded() {
            return Err(UploadError::Incomplete {
                completed: self.chunks_completed(),
                total: self.total_chunks,
            });
        }
        Ok(())
    }

    pub fn finalize(
        &self,
        remote_object_id: String,
        final_size: u64,
        now: DateTime<Utc>,
    ) -> UploadResult<Self> {
        self.ensure_finalizable(now)?;
        let mut next = self.clone();
        next.status = UploadStatus::Completed;
        next.completed_at = Some(now);
        next.remote_object_id = Some(remote_object_id);
        next.final_size = Some(final_size);
        Ok(next)
    }

    pub fn cancel(&self) -> UploadResult<Self> {
        if self.status.is_terminal() {
            return Err(UploadError::InvalidState {
                status: self.status,
                operation: "cancel",
            });
        }
        let mut next = self.clone();
        next.status = UploadStatus::Cancelled;
        Ok(next)
    }

    /// Move a non-terminal session whose TTL has elapsed to `expired`.
    pub fn expire(&self, now: DateTime<Utc>) -> UploadResult<Self> {
        if self.status.is_terminal() || !self.is_past_expiry(now) {
            return Err(UploadError::InvalidState {
                status: self.status,
                operation: "expire",
            });
        }
        let mut next = self.clone();
        next.status = UploadStatus::Expired;
        Ok(next)
    }

    /// Verify the structural invariants of a loaded record.
    pub fn check_integrity(&self) -> Result<(), String> {
        if self.completed_parts.len() as u64 + 1 != u64::from(self.next_expected_chunk) {
            return Err(format!(
                "{} parts recorded but next expected chunk is {}",
                self.completed_parts.len(),
                self.next_expected_chunk
            ));
        }
        if self.completed_parts.len() as u64 > u64::from(self.total_chunks) {
            return Err(format!(
                "{} parts recorded for {} chunks",
                self.completed_parts.len(),
                self.total_chunks
            ));
        }
        for (idx, part) in self.completed_parts.iter().enumerate() {
            if part.chunk_number as usize != idx + 1 {
                return Err(format!(
                    "part at position {} has chunk number {}",
                    idx + 1,
                    part.chunk_number
                ));
            }
        }
        Ok(())
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            upload_id: self.id,
            uploaded_bytes: self.uploaded_bytes(),
            total_bytes: self.total_size,
            percentage: self.progress_percentage(),
            chunks_completed: self.chunks_completed(),
            total_chunks: self.total_chunks,
            status: self.status,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    /// Where to continue. Expired sessions still report their last known
    /// progress; completed, cancelled and failed ones have nothing to resume.
    pub fn resume_info(&self) -> UploadResult<ResumeInfo> {
        if self.status.is_terminal() && self.status != UploadStatus::Expired {
            return Err(UploadError::InvalidState {
                status: self.status,
                operation: "resume",
            });
        }
        Ok(ResumeInfo {
            upload_id: self.id,
            next_expected_chunk: self.next_expected_chunk,
            uploaded_chunks: self.chunks_completed(),
            completed_parts: self.completed_parts.clone(),
            remaining_chunks: self.remaining_chunks(),
            percentage: self.progress_percentage(),
            status: self.status,
        })
    }

    /// The response for chunk `chunk_number` as it looked when that chunk was
    /// accepted, so replays answer exactly like the original call.
    pub fn chunk_receipt(&self, chunk_number: u32) -> ChunkReceipt {
        let uploaded_size = self
            .completed_parts
            .iter()
            .take(chunk_number as usize)
            .map(|p| p.size)
            .sum();
        ChunkReceipt {
            upload_id: self.id,
            chunk_number,
            uploaded_size,
            total_size: self.total_size,
            progress_percentage: self.percentage_of(uploaded_size),
            remaining_chunks: self.total_chunks.saturating_sub(chunk_number),
        }
    }
}
