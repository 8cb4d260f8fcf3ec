//! Local filesystem object storage

use crate::object_storage::{ObjectReader, ObjectStorage};
use crate::{validate_key, StorageError, StorageResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Object storage rooted at a directory on the local filesystem
///
/// Keys map to relative paths under the root; `a/b/c` becomes `<root>/a/b/c`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn not_found(key: &str, err: std::io::Error) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::IoError(err)
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn store_file(&self, key: &str, data: &[u8]) -> StorageResult<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;

        debug!(path = %path.display(), bytes = data.len(), "Stored object");
        Ok(key.to_string())
    }

    async fn retrieve_file(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::not_found(key, e))
    }

    async fn open_file(&self, key: &str) -> StorageResult<ObjectReader> {
        let path = self.path_for(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(Box::new(file))
    }

    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete_file(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn get_file_size(&self, key: &str) -> StorageResult<u64> {
        let path = self.path_for(key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path());

        storage.store_file("T1/tracking", b"tracklets").await.unwrap();
        assert_eq!(storage.retrieve_file("T1/tracking").await.unwrap(), b"tracklets");
        assert_eq!(storage.get_file_size("T1/tracking").await.unwrap(), 9);
        assert!(dir.path().join("T1").join("tracking").exists());
    }

    #[tokio::test]
    async fn test_open_file_streams_contents() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path());
        storage.store_file("conf/tracker.yaml", b"min-size: 4").await.unwrap();

        let mut reader = storage.open_file("conf/tracker.yaml").await.unwrap();
        let mut contents = String::new();
        reader.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "min-size: 4");
    }

    #[tokio::test]
    async fn test_list_files_recursive_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path());
        storage.store_file("videos/cam1/clip2.mp4", b"2").await.unwrap();
        storage.store_file("videos/cam1/clip1.mp4", b"1").await.unwrap();
        storage.store_file("conf/reid.yaml", b"r").await.unwrap();

        let videos = storage.list_files("videos/").await.unwrap();
        assert_eq!(videos, vec!["videos/cam1/clip1.mp4", "videos/cam1/clip2.mp4"]);
        assert_eq!(storage.list_files("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path());

        let err = storage.retrieve_file("T9/none").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(key) if key == "T9/none"));
        assert!(!storage.file_exists("T9/none").await.unwrap());
        storage.delete_file("T9/none").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path());

        let err = storage.store_file("../outside", b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
