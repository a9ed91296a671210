//! src/services/upload_coordinator.rs
//!
//! UploadCoordinator: drives upload sessions through their lifecycle:
//! init, accept-chunk, progress, resume, finalize, cancel and the expiry sweep.
//!
//! State-changing operations hold a per-session lock for their whole
//! read-modify-write and persist through the version-checked
//! `SessionStore::save`, so concurrent requests for one session serialize
//! while different sessions never contend. Local state only advances after
//! the remote store acknowledged the corresponding call; a failed or timed
//! out remote call leaves the persisted session exactly as it was.

use crate::{
    config::UploadLimits,
    errors::{UploadError, UploadResult},
    models::{
        multipart::FinishedLargeFile,
        progress::{ChunkReceipt, FinalizedUpload, ResumeInfo, UploadProgress},
        upload_session::{
            ChunkDisposition, CompletedPart, NewSession, UploadSession, UploadStatus,
            total_chunks_for,
        },
    },
    services::{session_store::SessionStore, storage_client::MultipartStorageClient},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{StreamExt, stream};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Content type that lets the remote store infer the type from the file name.
const AUTO_MIME_TYPE: &str = "b2/x-auto";
const SWEEP_BATCH: u32 = 500;
const SWEEP_CONCURRENCY: usize = 8;

/// Parameters accepted by [`UploadCoordinator::init`].
#[derive(Debug, Clone, Default)]
pub struct InitUpload {
    pub filename: String,
    pub total_size: u64,
    /// Falls back to the configured default.
    pub chunk_size: Option<u64>,
    pub mime_type: Option<String>,
    pub owner_reference: Option<String>,
    /// Falls back to the configured default TTL.
    pub ttl: Option<Duration>,
}

type LockTable = DashMap<Uuid, Arc<Mutex<()>>>;

/// Exclusive access to one session; the table entry is dropped with the
/// last holder.
struct SessionGuard {
    id: Uuid,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Clone)]
pub struct UploadCoordinator {
    store: SessionStore,
    storage: Arc<dyn MultipartStorageClient>,
    limits: UploadLimits,
    locks: Arc<LockTable>,
}

impl UploadCoordinator {
    pub fn new(
        store: SessionStore,
        storage: Arc<dyn MultipartStorageClient>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            store,
            storage,
            limits,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    async fn lock_session(&self, id: Uuid) -> SessionGuard {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        SessionGuard {
            id,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Bound a remote call by the configured deadline.
    async fn remote<T>(
        &self,
        operation: &str,
        call: impl Future<Output = UploadResult<T>>,
    ) -> UploadResult<T> {
        tokio::time::timeout(self.limits.remote_timeout, call)
            .await
            .map_err(|_| {
                UploadError::StorageUnavailable(format!(
                    "{operation} timed out after {:?}",
                    self.limits.remote_timeout
                ))
            })?
    }

    /// Load a session for a state-changing operation. A corrupted record is
    /// moved to `failed` and reported as an invalid state.
    async fn load_for_update(
        &self,
        id: Uuid,
        operation: &'static str,
    ) -> UploadResult<UploadSession> {
        match self.store.get(id).await {
            Err(UploadError::CorruptedSession(message)) => {
                error!(upload_id = %id, %message, "corrupted upload session, marking failed");
                self.store.mark_failed(id, &message, Utc::now()).await?;
                Err(UploadError::InvalidState {
                    status: UploadStatus::Failed,
                    operation,
                })
            }
            other => other,
        }
    }

    fn validate(&self, req: &InitUpload) -> UploadResult<NewSession> {
        let limits = &self.limits;
        let filename = req.filename.trim();
        if filename.is_empty() {
            return Err(UploadError::InvalidRequest("filename is required".into()));
        }
        if req.total_size == 0 {
            return Err(UploadError::InvalidRequest(
                "total_size must be greater than zero".into(),
            ));
        }

        let chunk_size = req.chunk_size.unwrap_or(limits.default_chunk_size);
        if chunk_size < limits.min_chunk_size || chunk_size > limits.max_chunk_size {
            return Err(UploadError::InvalidRequest(format!(
                "chunk_size {} outside [{}, {}]",
                chunk_size, limits.min_chunk_size, limits.max_chunk_size
            )));
        }

        let total_chunks = total_chunks_for(req.total_size, chunk_size);
        if total_chunks > u64::from(limits.max_chunks) {
            return Err(UploadError::InvalidRequest(format!(
                "{} chunks exceeds the maximum of {}",
                total_chunks, limits.max_chunks
            )));
        }

        let ttl = req.ttl.unwrap_or(limits.default_ttl);
        if ttl.is_zero() {
            return Err(UploadError::InvalidRequest("ttl must be positive".into()));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .ok()
            .filter(|ttl| Utc::now().checked_add_signed(*ttl).is_some())
            .ok_or_else(|| UploadError::InvalidRequest("ttl out of range".into()))?;

        Ok(NewSession {
            filename: filename.to_string(),
            mime_type: req
                .mime_type
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| AUTO_MIME_TYPE.to_string()),
            total_size: req.total_size,
            chunk_size,
            total_chunks: total_chunks as u32,
            owner_reference: req.owner_reference.clone(),
            ttl,
        })
    }

    /// Validate the request, open the remote multipart upload and persist a
    /// new `initiated` session.
    pub async fn init(&self, req: InitUpload) -> UploadResult<UploadSession> {
        let params = self.validate(&req)?;

        let remote_handle = self
            .remote(
                "start_large_file",
                self.storage
                    .start_large_file(&params.filename, &params.mime_type),
            )
            .await?;

        let session = UploadSession::new(params, remote_handle, Utc::now());
        if let Err(err) = self.store.create(&session).await {
            // Do not leave an unreachable multipart upload behind.
            if let Err(cancel_err) = self
                .remote(
                    "cancel_large_file",
                    self.storage.cancel_large_file(&session.remote_handle),
                )
                .await
            {
                warn!(
                    remote_handle = %session.remote_handle,
                    error = %cancel_err,
                    "failed to cancel remote upload after persist failure"
                );
            }
            return Err(err);
        }

        info!(
            upload_id = %session.id,
            remote_handle = %session.remote_handle,
            filename = %session.filename,
            total_size = session.total_size,
            total_chunks = session.total_chunks,
            "upload session initiated"
        );
        Ok(session)
    }

    /// Accept chunk `chunk_number`. Chunks must arrive strictly in order; an
    /// identical resubmission of an accepted chunk returns its original receipt.
    pub async fn accept_chunk(
        &self,
        id: Uuid,
        chunk_number: u32,
        bytes: Bytes,
    ) -> UploadResult<ChunkReceipt> {
        let _guard = self.lock_session(id).await;
        let session = self.load_for_update(id, "accept a chunk for").await?;
        let now = Utc::now();

        let content_sha1 = match session.check_chunk(chunk_number, &bytes, now)? {
            ChunkDisposition::Replay(part) => {
                debug!(upload_id = %id, chunk_number, "replayed chunk matches recorded digest");
                return Ok(session.chunk_receipt(part.chunk_number));
            }
            ChunkDisposition::Upload { content_sha1 } => content_sha1,
        };

        let size = bytes.len() as u64;
        let target = self
            .remote(
                "get_upload_part_url",
                self.storage.get_upload_part_url(&session.remote_handle),
            )
            .await?;
        self.remote(
            "upload_part",
            self.storage
                .upload_part(&target, chunk_number, bytes, &content_sha1),
        )
        .await?;

        let next = session.accept_chunk(
            CompletedPart {
                chunk_number,
                content_sha1,
                size,
            },
            now,
        )?;
        let saved = self.store.save(&next).await?;

        debug!(
            upload_id = %id,
            chunk_number,
            uploaded_bytes = saved.uploaded_bytes(),
            "chunk accepted"
        );
        Ok(saved.chunk_receipt(chunk_number))
    }

    /// Read-only progress. When `owner_reference` is given the session must
    /// belong to it, otherwise it is reported as not found.
    pub async fn progress(
        &self,
        id: Uuid,
        owner_reference: Option<&str>,
    ) -> UploadResult<UploadProgress> {
        let session = self.store.get(id).await?;
        if let Some(owner) = owner_reference {
            if session.owner_reference.as_deref() != Some(owner) {
                return Err(UploadError::NotFound(id));
            }
        }
        Ok(session.progress())
    }

    /// Where a client should continue. Expired sessions still report their
    /// last known progress.
    pub async fn resume(&self, id: Uuid) -> UploadResult<ResumeInfo> {
        self.store.get(id).await?.resume_info()
    }

    /// Assemble the remote object from every accepted part.
    pub async fn finalize(&self, id: Uuid) -> UploadResult<FinalizedUpload> {
        let _guard = self.lock_session(id).await;
        let session = self.load_for_update(id, "finalize").await?;
        let now = Utc::now();
        session.ensure_finalizable(now)?;

        let digests: Vec<String> = session
            .completed_parts
            .iter()
            .map(|p| p.content_sha1.clone())
            .collect();
        let finished = self
            .remote(
                "finish_large_file",
                self.storage
                    .finish_large_file(&session.remote_handle, &digests),
            )
            .await?;

        if finished.size != session.total_size {
            warn!(
                upload_id = %id,
                expected = session.total_size,
                reported = finished.size,
                "remote object size differs from declared size"
            );
        }

        let next = session.finalize(finished.object_id.clone(), finished.size, now)?;
        if let Err(err) = self.store.save(&next).await {
            // The remote object exists now; a later finish call would be refused.
            warn!(upload_id = %id, error = %err, "saving finalized session failed, retrying");
            if let Err(err) = self.persist_finalized(id, &finished, now).await {
                error!(
                    upload_id = %id,
                    object_id = %finished.object_id,
                    error = %err,
                    "remote object finished but session could not be saved"
                );
                return Err(err);
            }
        }

        info!(
            upload_id = %id,
            object_id = %finished.object_id,
            final_size = finished.size,
            "upload completed"
        );
        Ok(FinalizedUpload {
            upload_id: id,
            object_id: finished.object_id,
            final_size: finished.size,
        })
    }

    /// Re-read the session and record the finished remote object on the
    /// current version.
    async fn persist_finalized(
        &self,
        id: Uuid,
        finished: &FinishedLargeFile,
        now: DateTime<Utc>,
    ) -> UploadResult<()> {
        let fresh = self.store.get(id).await?;
        if fresh.status == UploadStatus::Completed
            && fresh.remote_object_id.as_deref() == Some(finished.object_id.as_str())
        {
            return Ok(());
        }
        let next = fresh.finalize(finished.object_id.clone(), finished.size, now)?;
        self.store.save(&next).await?;
        Ok(())
    }

    /// Cancel a live session. Remote cleanup is best-effort. Terminal sessions
    /// are left untouched and reported as-is.
    pub async fn cancel(&self, id: Uuid) -> UploadResult<UploadStatus> {
        let _guard = self.lock_session(id).await;
        let session = self.load_for_update(id, "cancel").await?;
        if session.status.is_terminal() {
            debug!(upload_id = %id, status = %session.status, "cancel on terminal session is a no-op");
            return Ok(session.status);
        }

        self.cancel_remote(&session).await;
        let next = session.cancel()?;
        self.store.save(&next).await?;

        info!(upload_id = %id, "upload cancelled");
        Ok(UploadStatus::Cancelled)
    }

    async fn cancel_remote(&self, session: &UploadSession) {
        if let Err(err) = self
            .remote(
                "cancel_large_file",
                self.storage.cancel_large_file(&session.remote_handle),
            )
            .await
        {
            warn!(
                upload_id = %session.id,
                remote_handle = %session.remote_handle,
                error = %err,
                "remote cancel failed, continuing with local transition"
            );
        }
    }

    /// Expire every live session whose TTL elapsed. Returns how many
    /// sessions were moved to `expired`.
    pub async fn sweep_expired(&self) -> UploadResult<usize> {
        let now = Utc::now();
        let ids = self.store.list_expirable(now, SWEEP_BATCH).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let expired = stream::iter(ids)
            .map(|id| self.expire_one(id, now))
            .buffer_unordered(SWEEP_CONCURRENCY)
            .filter(|done| futures::future::ready(*done))
            .count()
            .await;

        info!(expired, "expiry sweep finished");
        Ok(expired)
    }

    async fn expire_one(&self, id: Uuid, now: DateTime<Utc>) -> bool {
        let _guard = self.lock_session(id).await;
        let session = match self.load_for_update(id, "expire").await {
            Ok(session) => session,
            Err(err) => {
                warn!(upload_id = %id, error = %err, "skipping session during sweep");
                return false;
            }
        };
        // Re-checked under the lock: the session may have finished meanwhile.
        let Ok(next) = session.expire(now) else {
            return false;
        };

        self.cancel_remote(&session).await;
        match self.store.save(&next).await {
            Ok(_) => {
                info!(upload_id = %id, "upload session expired");
                true
            }
            Err(err) => {
                warn!(upload_id = %id, error = %err, "failed to persist expiry");
                false
            }
        }
    }
}
