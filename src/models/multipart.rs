//! Values exchanged with the remote multipart object store.

use serde::{Deserialize, Serialize};

/// Pre-authorized destination for a single part upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartUploadTarget {
    /// URL the part bytes are posted to.
    pub url: String,

    /// Token scoped to this URL.
    pub auth_token: String,
}

/// The assembled remote object, visible only after finish succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedLargeFile {
    /// Remote object identifier.
    pub object_id: String,

    /// Size in bytes as reported by the store.
    pub size: u64,
}
