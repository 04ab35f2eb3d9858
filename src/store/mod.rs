//! Object storage access.
//!
//! The pipeline only needs two operations from a store: the size of an
//! object, and a download of its bytes into a local file. [`BlobStore`]
//! captures exactly that so the orchestrator can be driven by a local
//! directory, an HTTP endpoint, or a test double.

mod http;
mod local;

pub use http::HttpBlobStore;
pub use local::LocalBlobStore;

use async_trait::async_trait;
use std::fmt;
use std::path::Path;

use crate::error::ExtractError;

/// Where an uploaded file lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocator {
    pub bucket: String,
    pub key: String,
}

impl SourceLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {0} does not exist")]
    NotFound(String),

    #[error("transfer of {0} timed out")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for ExtractError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ExtractError::NotFound(err.to_string()),
            StoreError::Timeout(_) => ExtractError::ClientTimeout(err.to_string()),
            StoreError::Other(e) => ExtractError::Internal(format!("{e:#}")),
        }
    }
}

/// Read-only access to stored objects.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Size of the object, without transferring its content.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError>;

    /// Copy the object's bytes into a new file at `destination`.
    async fn download_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), StoreError>;
}
