//! InMemoryBlobStore - object store for tests and simulated runs.
//!
//! Every operation takes the lock once, so a copy or delete observes a
//! single consistent state. Two workers racing on the same key see the same
//! `NotFound` behavior a shared bucket gives them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::ports::{BlobError, BlobStore, ObjectMeta};

#[derive(Debug, Clone)]
struct Object {
    bytes: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    objects: Arc<Mutex<BTreeMap<String, Object>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }
}

fn check_key(key: &str) -> Result<(), BlobError> {
    if key.is_empty() || key.ends_with('/') {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BlobError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectMeta {
                key: key.clone(),
                size: object.bytes.len() as u64,
                last_modified: Some(object.modified),
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let objects = self.objects.lock().await;
        objects
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        check_key(key)?;
        let mut objects = self.objects.lock().await;
        objects.insert(
            key.to_string(),
            Object {
                bytes,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BlobError> {
        check_key(dst)?;
        let mut objects = self.objects.lock().await;
        let bytes = objects
            .get(src)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| BlobError::NotFound(src.to_string()))?;
        objects.insert(
            dst.to_string(),
            Object {
                bytes,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let mut objects = self.objects.lock().await;
        objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }
}
