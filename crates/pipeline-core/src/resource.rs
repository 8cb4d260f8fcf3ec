//! Shared worker resources
//!
//! - [`Singleton`]: a lazily built per-process value, constructed once even
//!   under concurrent first access
//! - [`ResourceRegistry`]: process-wide singletons keyed by name
//! - [`BroadcastPool`]: small read-only files built by a coordinator and
//!   distributed to every worker through the bulk store
//! - [`Broadcast`]: worker-side holder that loads a value once and rebuilds
//!   it only after [`Broadcast::invalidate`]

use crate::error::{PipelineError, ResourceError};
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info};
use video_pipeline_storage::{ObjectStorage, StorageError};

type Factory<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

/// Lazily constructed, process-local shared value
pub struct Singleton<T> {
    name: String,
    cell: OnceCell<Arc<T>>,
    factory: Factory<T>,
}

impl<T> Singleton<T> {
    /// Singleton built by an infallible factory
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::fallible(name, move || Ok(factory()))
    }

    /// Singleton whose factory may fail; failures are not cached
    pub fn fallible<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            cell: OnceCell::new(),
            factory: Box::new(factory),
        }
    }

    /// Shared instance, building it on first access
    pub fn get(&self) -> Result<Arc<T>, ResourceError> {
        self.cell
            .get_or_try_init(|| {
                debug!(resource = %self.name, "Initializing singleton");
                (self.factory)()
                    .map(Arc::new)
                    .map_err(|source| ResourceError::Init {
                        name: self.name.clone(),
                        source,
                    })
            })
            .cloned()
    }

    /// Instance if it has already been built
    #[must_use]
    pub fn get_if_initialized(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }
}

type Slot = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

/// Named singletons shared by everything in one worker process
#[derive(Default)]
pub struct ResourceRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

static GLOBAL_REGISTRY: Lazy<ResourceRegistry> = Lazy::new(ResourceRegistry::new);

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static ResourceRegistry {
        &GLOBAL_REGISTRY
    }

    /// Resource registered under `name`, built by `factory` on first access.
    ///
    /// Concurrent first callers for the same name block until one of them
    /// has built it; the factory runs at most once per successful build.
    pub fn get_or_init<T, F>(&self, name: &str, factory: F) -> Result<Arc<T>, ResourceError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(name.to_string()).or_default())
        };

        let value = slot.get_or_try_init(|| {
            info!(resource = name, "Initializing shared resource");
            factory()
                .map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
                .map_err(|source| ResourceError::Init {
                    name: name.to_string(),
                    source,
                })
        })?;

        Arc::clone(value)
            .downcast::<T>()
            .map_err(|_| ResourceError::TypeMismatch(name.to_string()))
    }

    /// Whether `name` has been built
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(|slot| slot.get().is_some())
    }

    /// Forget `name` so the next access rebuilds it
    pub fn invalidate(&self, name: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }
}

/// Read-only map of small files shared by every worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPool {
    entries: BTreeMap<String, Vec<u8>>,
}

impl BroadcastPool {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(name.into(), data.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Entry as UTF-8 text
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read every file under `prefix`, keyed by its name relative to the prefix
    pub async fn from_storage(
        storage: &dyn ObjectStorage,
        prefix: &str,
    ) -> Result<Self, StorageError> {
        let mut pool = Self::new();
        for key in storage.list_files(prefix).await? {
            let data = storage.retrieve_file(&key).await?;
            let name = key.strip_prefix(prefix).unwrap_or(&key).to_string();
            pool.entries.insert(name, data);
        }
        info!(prefix, entries = pool.len(), "Built broadcast pool");
        Ok(pool)
    }

    /// Write the whole pool as one blob under `key`
    pub async fn publish(&self, storage: &dyn ObjectStorage, key: &str) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec(self)?;
        storage.store_file(key, &bytes).await?;
        debug!(key, entries = self.len(), "Published broadcast pool");
        Ok(())
    }

    /// Read a pool previously written with [`BroadcastPool::publish`]
    pub async fn fetch(storage: &dyn ObjectStorage, key: &str) -> Result<Self, PipelineError> {
        let bytes = storage.retrieve_file(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Worker-side holder of a broadcast value
pub struct Broadcast<T> {
    current: RwLock<Option<Arc<T>>>,
    loads: AtomicU64,
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
            loads: AtomicU64::new(0),
        }
    }
}

impl<T> Broadcast<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, loading it with `load` if absent.
    ///
    /// Only one caller runs `load`; the others wait for its result.
    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<Arc<T>, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        if let Some(value) = self.current.read().await.as_ref() {
            return Ok(Arc::clone(value));
        }

        let mut guard = self.current.write().await;
        if let Some(value) = guard.as_ref() {
            return Ok(Arc::clone(value));
        }

        let value = Arc::new(load().await?);
        self.loads.fetch_add(1, Ordering::SeqCst);
        *guard = Some(Arc::clone(&value));
        Ok(value)
    }

    /// Value if loaded
    pub async fn get(&self) -> Option<Arc<T>> {
        self.current.read().await.clone()
    }

    /// Drop the value so the next access reloads it
    pub async fn invalidate(&self) {
        self.current.write().await.take();
    }

    /// Number of times a value has been loaded
    #[must_use]
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}
