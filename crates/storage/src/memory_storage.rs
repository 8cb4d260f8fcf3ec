//! In-memory object storage

use crate::object_storage::ObjectStorage;
use crate::{validate_key, StorageError, StorageResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Object storage held in process memory
///
/// Shared between stages of one process by wrapping it in an `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    injected_read_failures: AtomicUsize,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `count` reads fail with a transient error
    pub fn inject_read_failures(&self, count: usize) {
        self.injected_read_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn poisoned() -> StorageError {
        StorageError::Other("in-memory storage lock poisoned".to_string())
    }
}

#[async_trait::async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn store_file(&self, key: &str, data: &[u8]) -> StorageResult<String> {
        validate_key(key)?;
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), data.to_vec());
        Ok(key.to_string())
    }

    async fn retrieve_file(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        if self.take_injected_failure() {
            return Err(StorageError::S3Error(format!("injected read timeout: {key}")));
        }
        self.objects
            .read()
            .map_err(|_| Self::poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete_file(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(key);
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self
            .objects
            .read()
            .map_err(|_| Self::poisoned())?
            .contains_key(key))
    }

    async fn get_file_size(&self, key: &str) -> StorageResult<u64> {
        validate_key(key)?;
        self.objects
            .read()
            .map_err(|_| Self::poisoned())?
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}
