//! BlobStore port: the shared object store that input artifacts land in.
//!
//! Keys are flat strings; prefixes act as directories (`incoming/`,
//! `processing/`, `review/`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum BlobError {
    /// The key does not exist (or vanished mid-operation).
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("blob store I/O on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl BlobError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound(_))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BlobError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError>;

    /// Copy `src` to `dst`. Fails with [`BlobError::NotFound`] when `src` is gone.
    async fn copy(&self, src: &str, dst: &str) -> Result<(), BlobError>;

    /// Delete `key`. Fails with [`BlobError::NotFound`] when it is already gone.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}
