//! Defines routes for the upload session API.
//!
//! ## Structure
//! - `POST   /uploads`                    - open a session
//! - `GET    /uploads/{id}`               - progress (optional `?owner_reference=`)
//! - `DELETE /uploads/{id}`               - cancel (idempotent)
//! - `POST   /uploads/{id}/chunks/{n}`    - upload chunk `n` (raw body)
//! - `GET    /uploads/{id}/resume`        - where to continue
//! - `POST   /uploads/{id}/finalize`      - assemble the remote object
//!
//! Health probes are mounted at the root.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, finalize_upload, get_progress, init_upload, resume_upload,
            upload_chunk,
        },
    },
    services::upload_coordinator::UploadCoordinator,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. Chunk bodies may be up to `max_chunk_size` bytes.
pub fn routes(max_chunk_size: u64) -> Router<UploadCoordinator> {
    let chunk_limit = usize::try_from(max_chunk_size).unwrap_or(usize::MAX);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", post(init_upload))
        .route("/uploads/{id}", get(get_progress).delete(cancel_upload))
        .route(
            "/uploads/{id}/chunks/{n}",
            post(upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/uploads/{id}/resume", get(resume_upload))
        .route("/uploads/{id}/finalize", post(finalize_upload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::UploadLimits,
        services::{session_store::memory_store, storage_client::fake::FakeRemote},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;

    async fn app() -> Router {
        let limits = UploadLimits {
            default_chunk_size: 5,
            min_chunk_size: 5,
            max_chunk_size: 8,
            max_chunks: 100,
            default_ttl: Duration::from_secs(3600),
            remote_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(60),
        };
        let max_chunk_size = limits.max_chunk_size;
        let coordinator = UploadCoordinator::new(
            memory_store().await,
            Arc::new(FakeRemote::default()),
            limits,
        );
        routes(max_chunk_size).with_state(coordinator)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if uri == "/uploads" {
            req = req.header(header::CONTENT_TYPE, "application/json");
        }
        let resp = app
            .clone()
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn open(app: &Router, total_size: u64) -> String {
        let body = json!({
            "filename": "teaser.mp4",
            "total_size": total_size,
            "owner_reference": "movie-1",
        });
        let (status, value) = send(app, Method::POST, "/uploads", Body::from(body.to_string())).await;
        assert_eq!(status, StatusCode::CREATED);
        value["upload_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn upload_lifecycle_over_http() {
        let app = app().await;
        let body = json!({"filename": "teaser.mp4", "total_size": 12, "chunk_size": 5});
        let (status, created) =
            send(&app, Method::POST, "/uploads", Body::from(body.to_string())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["total_chunks"], 3);
        assert_eq!(created["chunk_size"], 5);
        let id = created["upload_id"].as_str().unwrap();

        let (status, receipt) = send(
            &app,
            Method::POST,
            &format!("/uploads/{id}/chunks/1"),
            Body::from("aaaaa"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["uploaded_size"], 5);
        assert_eq!(receipt["remaining_chunks"], 2);

        let (status, err) = send(
            &app,
            Method::POST,
            &format!("/uploads/{id}/chunks/3"),
            Body::from("cc"),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["code"], "out_of_sequence");

        let (status, resume) =
            send(&app, Method::GET, &format!("/uploads/{id}/resume"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resume["next_expected_chunk"], 2);
        assert_eq!(resume["uploaded_chunks"], 1);

        let (status, err) =
            send(&app, Method::POST, &format!("/uploads/{id}/finalize"), Body::empty()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["code"], "incomplete");

        for (n, chunk) in [(2, "bbbbb"), (3, "cc")] {
            let (status, _) = send(
                &app,
                Method::POST,
                &format!("/uploads/{id}/chunks/{n}"),
                Body::from(chunk),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, progress) =
            send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["percentage"], 100.0);
        assert_eq!(progress["status"], "uploading");

        let (status, done) =
            send(&app, Method::POST, &format!("/uploads/{id}/finalize"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["final_size"], 12);
        assert!(done["object_id"].is_string());

        let (status, cancelled) =
            send(&app, Method::DELETE, &format!("/uploads/{id}"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "completed");
    }

    #[tokio::test]
    async fn cancel_is_idempotent_over_http() {
        let app = app().await;
        let id = open(&app, 10).await;
        for _ in 0..2 {
            let (status, body) =
                send(&app, Method::DELETE, &format!("/uploads/{id}"), Body::empty()).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "cancelled");
        }
    }

    #[tokio::test]
    async fn progress_checks_owner_reference() {
        let app = app().await;
        let id = open(&app, 10).await;

        let (status, _) = send(
            &app,
            Method::GET,
            &format!("/uploads/{id}?owner_reference=movie-1"),
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, err) = send(
            &app,
            Method::GET,
            &format!("/uploads/{id}?owner_reference=movie-2"),
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["code"], "not_found");
    }

    #[tokio::test]
    async fn bad_identifiers_and_unknown_sessions() {
        let app = app().await;

        let (status, err) =
            send(&app, Method::GET, "/uploads/not-a-uuid", Body::empty()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "invalid_request");

        let unknown = uuid::Uuid::new_v4();
        let (status, err) = send(
            &app,
            Method::POST,
            &format!("/uploads/{unknown}/chunks/1"),
            Body::from("aaaaa"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["status"], 404);
    }

    #[tokio::test]
    async fn invalid_init_is_rejected() {
        let app = app().await;
        let body = json!({"filename": "teaser.mp4", "total_size": 0});
        let (status, err) =
            send(&app, Method::POST, "/uploads", Body::from(body.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "invalid_request");
    }

    #[tokio::test]
    async fn oversized_chunk_body_is_refused() {
        let app = app().await;
        let id = open(&app, 10).await;
        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/uploads/{id}/chunks/1"),
            Body::from(vec![0u8; 64]),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn health_probes_answer() {
        let app = app().await;
        let (status, body) = send(&app, Method::GET, "/healthz", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, Method::GET, "/readyz", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
    }
}
