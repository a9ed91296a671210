//! Remote multipart object store client.
//!
//! `MultipartStorageClient` is the narrow seam the coordinator talks to.
//! `B2Client` implements it over the Backblaze B2 native API (v2) with
//! `reqwest`. Remote HTTP failures and timeouts surface as
//! `StorageUnavailable`, unexpected bodies as `StorageProtocolError`.
//! Nothing in here retries: only the caller knows whether a retry means
//! re-reading the chunk from its source.

use crate::{
    config::RemoteStoreConfig,
    errors::{UploadError, UploadResult},
    models::multipart::{FinishedLargeFile, PartUploadTarget},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::{
    StatusCode,
    header::{AUTHORIZATION, CONTENT_LENGTH},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tracing::{debug, error};

#[async_trait]
pub trait MultipartStorageClient: Send + Sync {
    /// Open a multipart upload and return its remote handle.
    async fn start_large_file(&self, filename: &str, mime_type: &str) -> UploadResult<String>;

    /// Obtain a destination for one part upload.
    async fn get_upload_part_url(&self, remote_handle: &str) -> UploadResult<PartUploadTarget>;

    /// Send one part tagged with its number and SHA-1.
    async fn upload_part(
        &self,
        target: &PartUploadTarget,
        chunk_number: u32,
        bytes: Bytes,
        content_sha1: &str,
    ) -> UploadResult<()>;

    /// Assemble the parts; `part_sha1s[i]` is the digest of part `i + 1`.
    async fn finish_large_file(
        &self,
        remote_handle: &str,
        part_sha1s: &[String],
    ) -> UploadResult<FinishedLargeFile>;

    /// Abandon the multipart upload and discard its parts.
    async fn cancel_large_file(&self, remote_handle: &str) -> UploadResult<()>;
}

/// Account authorization returned by `b2_authorize_account`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Authorization {
    api_url: String,
    authorization_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileReq<'a> {
    bucket_id: &'a str,
    file_name: &'a str,
    content_type: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdReq<'a> {
    file_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileReq<'a> {
    file_id: &'a str,
    part_sha1_array: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileIdResp {
    file_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPartUrlResp {
    upload_url: String,
    authorization_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPartResp {
    part_number: u32,
    content_sha1: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileResp {
    file_id: String,
    content_length: u64,
}

/// B2 native API client.
pub struct B2Client {
    http: reqwest::Client,
    config: RemoteStoreConfig,
    auth: RwLock<Option<Authorization>>,
}

impl B2Client {
    pub fn new(config: RemoteStoreConfig) -> UploadResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| UploadError::StorageUnavailable(format!("http client: {err}")))?;
        Ok(Self {
            http,
            config,
            auth: RwLock::new(None),
        })
    }

    /// Cached account authorization, fetched on first use.
    async fn authorization(&self) -> UploadResult<Authorization> {
        if let Some(auth) = self.auth.read().await.as_ref() {
            return Ok(auth.clone());
        }

        let mut slot = self.auth.write().await;
        if let Some(auth) = slot.as_ref() {
            return Ok(auth.clone());
        }

        let credentials = general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.config.key_id, self.config.application_key
        ));
        let url = format!(
            "{}/b2api/v2/b2_authorize_account",
            self.config.auth_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, format!("Basic {credentials}"))
            .send()
            .await
            .map_err(|err| transport_error("b2_authorize_account", err))?;
        let auth: Authorization = decode("b2_authorize_account", resp).await?;
        debug!(api_url = %auth.api_url, "authorized against remote store");
        *slot = Some(auth.clone());
        Ok(auth)
    }

    /// POST a JSON body to a B2 API operation and decode the reply.
    async fn call<B, T>(&self, operation: &'static str, body: &B) -> UploadResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let auth = self.authorization().await?;
        let url = format!(
            "{}/b2api/v2/{}",
            auth.api_url.trim_end_matches('/'),
            operation
        );
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, &auth.authorization_token)
            .json(body)
            .send()
            .await
            .map_err(|err| transport_error(operation, err))?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            // Token expired: the next call authorizes again.
            self.auth.write().await.take();
        }
        decode(operation, resp).await
    }
}

#[async_trait]
impl MultipartStorageClient for B2Client {
    async fn start_large_file(&self, filename: &str, mime_type: &str) -> UploadResult<String> {
        let resp: FileIdResp = self
            .call(
                "b2_start_large_file",
                &StartLargeFileReq {
                    bucket_id: &self.config.bucket_id,
                    file_name: filename,
                    content_type: mime_type,
                },
            )
            .await?;
        Ok(resp.file_id)
    }

    async fn get_upload_part_url(&self, remote_handle: &str) -> UploadResult<PartUploadTarget> {
        let resp: UploadPartUrlResp = self
            .call(
                "b2_get_upload_part_url",
                &FileIdReq {
                    file_id: remote_handle,
                },
            )
            .await?;
        Ok(PartUploadTarget {
            url: resp.upload_url,
            auth_token: resp.authorization_token,
        })
    }

    async fn upload_part(
        &self,
        target: &PartUploadTarget,
        chunk_number: u32,
        bytes: Bytes,
        content_sha1: &str,
    ) -> UploadResult<()> {
        let resp = self
            .http
            .post(&target.url)
            .header(AUTHORIZATION, &target.auth_token)
            .header("X-Bz-Part-Number", chunk_number)
            .header("X-Bz-Content-Sha1", content_sha1)
            .header(CONTENT_LENGTH, bytes.len())
            .body(bytes)
            .send()
            .await
            .map_err(|err| transport_error("upload_part", err))?;
        let ack: UploadPartResp = decode("upload_part", resp).await?;

        if ack.part_number != chunk_number || !ack.content_sha1.eq_ignore_ascii_case(content_sha1)
        {
            error!(
                chunk_number,
                acked_part = ack.part_number,
                acked_sha1 = %ack.content_sha1,
                "remote store acknowledged a different part"
            );
            return Err(UploadError::StorageProtocolError(format!(
                "part {chunk_number} acknowledged as part {} with sha1 {}",
                ack.part_number, ack.content_sha1
            )));
        }
        Ok(())
    }

    async fn finish_large_file(
        &self,
        remote_handle: &str,
        part_sha1s: &[String],
    ) -> UploadResult<FinishedLargeFile> {
        let resp: FinishLargeFileResp = self
            .call(
                "b2_finish_large_file",
                &FinishLargeFileReq {
                    file_id: remote_handle,
                    part_sha1_array: part_sha1s,
                },
            )
            .await?;
        Ok(FinishedLargeFile {
            object_id: resp.file_id,
            size: resp.content_length,
        })
    }

    async fn cancel_large_file(&self, remote_handle: &str) -> UploadResult<()> {
        let _: FileIdResp = self
            .call(
                "b2_cancel_large_file",
                &FileIdReq {
                    file_id: remote_handle,
                },
            )
            .await?;
        Ok(())
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> UploadError {
    UploadError::StorageUnavailable(format!("{operation}: {err}"))
}

/// Map the HTTP status, then decode the JSON body.
async fn decode<T: DeserializeOwned>(operation: &str, resp: reqwest::Response) -> UploadResult<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(UploadError::StorageUnavailable(format!(
            "{operation} returned {}: {}",
            status.as_u16(),
            body
        )));
    }

    let body = resp
        .bytes()
        .await
        .map_err(|err| transport_error(operation, err))?;
    serde_json::from_slice(&body).map_err(|err| {
        error!(operation, error = %err, "malformed remote store response");
        UploadError::StorageProtocolError(format!("{operation}: {err}"))
    })
}
