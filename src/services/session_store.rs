//! src/services/session_store.rs
//!
//! SessionStore: durable upload-session records in SQLite. Each row carries a
//! `version` counter; `save` only succeeds when the caller read the current
//! version, so two writers racing on the same session cannot both win.

use crate::{
    errors::{UploadError, UploadResult},
    models::upload_session::{CompletedPart, UploadSession, UploadStatus},
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const SESSION_COLUMNS: &str = "id, filename, mime_type, total_size, chunk_size, total_chunks, \
     owner_reference, remote_handle, next_expected_chunk, completed_parts, status, created_at, \
     expires_at, completed_at, failed_at, error_message, remote_object_id, final_size, version";

/// Raw row as stored in `upload_sessions`.
#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    filename: String,
    mime_type: String,
    total_size: i64,
    chunk_size: i64,
    total_chunks: i64,
    owner_reference: Option<String>,
    remote_handle: String,
    next_expected_chunk: i64,
    completed_parts: String,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    remote_object_id: Option<String>,
    final_size: Option<i64>,
    version: i64,
}

fn corrupted(id: Uuid, what: impl std::fmt::Display) -> UploadError {
    UploadError::CorruptedSession(format!("session {id}: {what}"))
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = UploadError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let completed_parts: Vec<CompletedPart> = serde_json::from_str(&row.completed_parts)
            .map_err(|err| corrupted(id, format!("unreadable parts: {err}")))?;
        let status: UploadStatus = row.status.parse().map_err(|err| corrupted(id, err))?;

        let session = UploadSession {
            id,
            filename: row.filename,
            mime_type: row.mime_type,
            total_size: u64::try_from(row.total_size).map_err(|err| corrupted(id, err))?,
            chunk_size: u64::try_from(row.chunk_size).map_err(|err| corrupted(id, err))?,
            total_chunks: u32::try_from(row.total_chunks).map_err(|err| corrupted(id, err))?,
            owner_reference: row.owner_reference,
            remote_handle: row.remote_handle,
            next_expected_chunk: u32::try_from(row.next_expected_chunk)
                .map_err(|err| corrupted(id, err))?,
            completed_parts,
            status,
            created_at: row.created_at,
            expires_at: row.expires_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            error_message: row.error_message,
            remote_object_id: row.remote_object_id,
            final_size: row
                .final_size
                .map(u64::try_from)
                .transpose()
                .map_err(|err| corrupted(id, err))?,
            version: row.version,
        };
        session.check_integrity().map_err(|err| corrupted(id, err))?;
        Ok(session)
    }
}

fn to_i64(value: u64) -> UploadResult<i64> {
    i64::try_from(value)
        .map_err(|_| UploadError::InvalidRequest(format!("value {value} exceeds storage range")))
}

fn encode_parts(parts: &[CompletedPart]) -> UploadResult<String> {
    serde_json::to_string(parts)
        .map_err(|err| UploadError::CorruptedSession(format!("cannot encode parts: {err}")))
}

/// Persists and retrieves upload sessions.
#[derive(Clone)]
pub struct SessionStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl SessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> UploadResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Lightweight connectivity probe used by readiness checks.
    pub async fn ping(&self) -> UploadResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    /// Insert a brand-new session at version 0.
    pub async fn create(&self, session: &UploadSession) -> UploadResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, filename, mime_type, total_size, chunk_size, total_chunks,
                owner_reference, remote_handle, next_expected_chunk, completed_parts,
                status, created_at, expires_at, completed_at, failed_at, error_message,
                remote_object_id, final_size, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(session.id)
        .bind(&session.filename)
        .bind(&session.mime_type)
        .bind(to_i64(session.total_size)?)
        .bind(to_i64(session.chunk_size)?)
        .bind(i64::from(session.total_chunks))
        .bind(&session.owner_reference)
        .bind(&session.remote_handle)
        .bind(i64::from(session.next_expected_chunk))
        .bind(encode_parts(&session.completed_parts)?)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.completed_at)
        .bind(session.failed_at)
        .bind(&session.error_message)
        .bind(&session.remote_object_id)
        .bind(session.final_size.map(to_i64).transpose()?)
        .execute(&*self.db)
        .await?;

        debug!(upload_id = %session.id, "session created");
        Ok(())
    }

    /// Fetch a session by id.
    ///
    /// Returns NotFound if the row is missing and CorruptedSession if it
    /// cannot be decoded or breaks the part-sequencing invariant.
    pub async fn get(&self, id: Uuid) -> UploadResult<UploadSession> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?");
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(UploadError::NotFound(id))?;
        UploadSession::try_from(row)
    }

    /// Write the mutable fields of `session`, provided the stored version
    /// still equals `session.version`. Returns the session at its new version.
    pub async fn save(&self, session: &UploadSession) -> UploadResult<UploadSession> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions SET
                next_expected_chunk = ?,
                completed_parts = ?,
                status = ?,
                expires_at = ?,
                completed_at = ?,
                failed_at = ?,
                error_message = ?,
                remote_object_id = ?,
                final_size = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(i64::from(session.next_expected_chunk))
        .bind(encode_parts(&session.completed_parts)?)
        .bind(session.status.as_str())
        .bind(session.expires_at)
        .bind(session.completed_at)
        .bind(session.failed_at)
        .bind(&session.error_message)
        .bind(&session.remote_object_id)
        .bind(session.final_size.map(to_i64).transpose()?)
        .bind(session.id)
        .bind(session.version)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(if self.exists(session.id).await? {
                UploadError::Conflict(session.id)
            } else {
                UploadError::NotFound(session.id)
            });
        }

        let mut saved = session.clone();
        saved.version += 1;
        Ok(saved)
    }

    /// Force a non-terminal record into `failed`, without decoding it.
    /// Returns whether a row changed.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET status = 'failed', failed_at = ?, error_message = ?, version = version + 1
             WHERE id = ? AND status IN ('initiated', 'uploading')",
        )
        .bind(now)
        .bind(message)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: Uuid) -> UploadResult<()> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(UploadError::NotFound(id));
        }
        Ok(())
    }

    /// Ids of non-terminal sessions whose TTL elapsed before `now`, oldest first.
    pub async fn list_expirable(&self, now: DateTime<Utc>, limit: u32) -> UploadResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM upload_sessions
             WHERE status IN ('initiated', 'uploading') AND expires_at < ?
             ORDER BY expires_at ASC
             LIMIT ?",
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }

    async fn exists(&self, id: Uuid) -> UploadResult<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM upload_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(found.is_some())
    }
}

/// Single-connection in-memory store with the schema applied.
#[cfg(test)]
pub(crate) async fn memory_store() -> SessionStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    let store = SessionStore::new(Arc::new(pool));
    store.migrate().await.expect("apply schema");
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upload_session::{NewSession, total_chunks_for};
    use crate::services::integrity;
    use chrono::Duration;

    fn new_session(total_size: u64, chunk_size: u64) -> UploadSession {
        UploadSession::new(
            NewSession {
                filename: "trailer.mp4".into(),
                mime_type: "video/mp4".into(),
                total_size,
                chunk_size,
                total_chunks: total_chunks_for(total_size, chunk_size) as u32,
                owner_reference: Some("movie-42".into()),
                ttl: Duration::hours(2),
            },
            "4_zremote_handle".into(),
            Utc::now(),
        )
    }

    fn first_part(session: &UploadSession) -> CompletedPart {
        let bytes = vec![1u8; session.chunk_size as usize];
        CompletedPart {
            chunk_number: 1,
            content_sha1: integrity::hash_chunk(&bytes),
            size: session.chunk_size,
        }
    }

    #[tokio::test]
    async fn create_then_get_returns_same_session() {
        let store = memory_store().await;
        let session = new_session(30, 10);
        store.create(&session).await.unwrap();

        let loaded = store.get(session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.total_chunks, 3);
        assert_eq!(loaded.owner_reference.as_deref(), Some("movie-42"));
        assert_eq!(loaded.status, UploadStatus::Initiated);
        assert_eq!(loaded.version, 0);
        assert_eq!(
            loaded.expires_at.timestamp_millis(),
            session.expires_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn get_unknown_session_is_not_found() {
        let store = memory_store().await;
        let id = Uuid::new_v4();
        assert!(matches!(store.get(id).await, Err(UploadError::NotFound(got)) if got == id));
    }

    #[tokio::test]
    async fn save_bumps_version_and_persists_parts() {
        let store = memory_store().await;
        let session = new_session(30, 10);
        store.create(&session).await.unwrap();

        let loaded = store.get(session.id).await.unwrap();
        let next = loaded
            .accept_chunk(first_part(&loaded), Utc::now())
            .unwrap();
        let saved = store.save(&next).await.unwrap();
        assert_eq!(saved.version, 1);

        let reloaded = store.get(session.id).await.unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(reloaded.status, UploadStatus::Uploading);
        assert_eq!(reloaded.next_expected_chunk, 2);
        assert_eq!(reloaded.completed_parts, next.completed_parts);
    }

    #[tokio::test]
    async fn stale_save_is_a_conflict() {
        let store = memory_store().await;
        let session = new_session(30, 10);
        store.create(&session).await.unwrap();

        let reader_a = store.get(session.id).await.unwrap();
        let reader_b = store.get(session.id).await.unwrap();

        let a = reader_a
            .accept_chunk(first_part(&reader_a), Utc::now())
            .unwrap();
        store.save(&a).await.unwrap();

        let b = reader_b.cancel().unwrap();
        assert!(matches!(store.save(&b).await, Err(UploadError::Conflict(_))));
        assert_eq!(
            store.get(session.id).await.unwrap().status,
            UploadStatus::Uploading
        );
    }

    #[tokio::test]
    async fn save_of_deleted_session_is_not_found() {
        let store = memory_store().await;
        let session = new_session(30, 10);
        store.create(&session).await.unwrap();
        store.delete(session.id).await.unwrap();

        assert!(matches!(
            store.save(&session).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(session.id).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_expirable_skips_live_and_terminal_sessions() {
        let store = memory_store().await;
        let live = new_session(30, 10);
        let stale = new_session(30, 10);
        let stale_cancelled = new_session(30, 10);
        for s in [&live, &stale, &stale_cancelled] {
            store.create(s).await.unwrap();
        }

        let past = Utc::now() - Duration::minutes(5);
        for id in [stale.id, stale_cancelled.id] {
            sqlx::query("UPDATE upload_sessions SET expires_at = ? WHERE id = ?")
                .bind(past)
                .bind(id)
                .execute(&*store.db)
                .await
                .unwrap();
        }
        let cancelled = store.get(stale_cancelled.id).await.unwrap().cancel().unwrap();
        store.save(&cancelled).await.unwrap();

        let ids = store.list_expirable(Utc::now(), 100).await.unwrap();
        assert_eq!(ids, vec![stale.id]);
    }

    #[tokio::test]
    async fn unreadable_parts_are_reported_as_corruption() {
        let store = memory_store().await;
        let session = new_session(30, 10);
        store.create(&session).await.unwrap();

        sqlx::query("UPDATE upload_sessions SET completed_parts = 'not json' WHERE id = ?")
            .bind(session.id)
            .execute(&*store.db)
            .await
            .unwrap();

        assert!(matches!(
            store.get(session.id).await,
            Err(UploadError::CorruptedSession(_))
        ));
        assert!(
            store
                .mark_failed(session.id, "unreadable parts", Utc::now())
                .await
                .unwrap()
        );
        let status: String = sqlx::query_scalar("SELECT status FROM upload_sessions WHERE id = ?")
            .bind(session.id)
            .fetch_one(&*store.db)
            .await
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_pool() {
        let store = memory_store().await;
        store.ping().await.unwrap();
    }
}
