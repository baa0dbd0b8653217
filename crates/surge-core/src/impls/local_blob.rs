//! LocalBlobStore - object store backed by a directory tree.
//!
//! Keys are relative paths with `/` separators. Writes go to a temporary
//! sibling first and are renamed into place, so a reader never sees a half
//! written object. Deleting a missing file and copying from a missing file
//! both surface as [`BlobError::NotFound`], which is what the claim protocol
//! keys on when two workers share the same directory.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::ports::{BlobError, BlobStore, ObjectMeta};

const TMP_PREFIX: &str = ".surge-tmp-";

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let valid = !key.is_empty()
            && key
                .split('/')
                .all(|segment| !matches!(segment, "" | "." | "..") && !segment.contains('\\'));
        if !valid {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    async fn write_atomic(&self, key: &str, path: &Path, bytes: &[u8]) -> Result<(), BlobError> {
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).await.map_err(|e| io_error(key, e))?;

        let tmp = parent.join(format!("{TMP_PREFIX}{:016x}", rand::random::<u64>()));
        fs::write(&tmp, bytes).await.map_err(|e| io_error(key, e))?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(key, e));
        }
        Ok(())
    }
}

fn io_error(key: &str, source: io::Error) -> BlobError {
    if source.kind() == io::ErrorKind::NotFound {
        BlobError::NotFound(key.to_string())
    } else {
        BlobError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BlobError> {
        // Walk from the deepest directory the prefix names.
        let start = match prefix.rfind('/') {
            Some(i) => &prefix[..i],
            None => "",
        };
        let mut pending = vec![(self.root.join(start), start.to_string())];
        let mut found = Vec::new();

        while let Some((dir, key_dir)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&key_dir, e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&key_dir, e))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TMP_PREFIX) {
                    continue;
                }
                let key = if key_dir.is_empty() {
                    name
                } else {
                    format!("{key_dir}/{name}")
                };
                let meta = entry.metadata().await.map_err(|e| io_error(&key, e))?;
                if meta.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    found.push(ObjectMeta {
                        key,
                        size: meta.len(),
                        last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    });
                }
            }
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| io_error(key, e))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        self.write_atomic(key, &path, &bytes).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BlobError> {
        let from = self.path_for(src)?;
        let to = self.path_for(dst)?;
        let bytes = fs::read(&from).await.map_err(|e| io_error(src, e))?;
        self.write_atomic(dst, &to, &bytes).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        fs::remove_file(&path).await.map_err(|e| io_error(key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[tokio::test]
    async fn round_trips_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        store.put("incoming/2024/a.jsonl", b"line\n".to_vec()).await.unwrap();
        assert_eq!(store.get("incoming/2024/a.jsonl").await.unwrap(), b"line\n");
        assert!(dir.path().join("incoming/2024/a.jsonl").is_file());
    }

    #[tokio::test]
    async fn lists_recursively_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        for key in ["incoming/b.jsonl", "incoming/sub/a.jsonl", "review/c.jsonl"] {
            store.put(key, b"{}".to_vec()).await.unwrap();
        }

        let listed = store.list("incoming/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["incoming/b.jsonl", "incoming/sub/a.jsonl"]);
        assert_eq!(listed[0].size, 2);
        assert!(listed[0].last_modified.is_some());

        assert!(store.list("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        assert!(store.get("incoming/x").await.unwrap_err().is_not_found());
        assert!(store.copy("incoming/x", "processing/x").await.unwrap_err().is_not_found());
        assert!(store.delete("incoming/x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn copy_then_delete_moves_an_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.put("incoming/a", b"payload".to_vec()).await.unwrap();

        store.copy("incoming/a", "processing/w1/a").await.unwrap();
        store.delete("incoming/a").await.unwrap();

        assert_eq!(store.get("processing/w1/a").await.unwrap(), b"payload");
        assert!(store.list("incoming/").await.unwrap().is_empty());
    }

    #[rstest]
    #[case("")]
    #[case("../escape")]
    #[case("/etc/passwd")]
    #[case("incoming/")]
    #[case("incoming/./a")]
    #[tokio::test]
    async fn rejects_unsafe_keys(#[case] key: &str) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(matches!(
            store.put(key, vec![]).await,
            Err(BlobError::InvalidKey(_))
        ));
    }
}
