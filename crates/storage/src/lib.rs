//! Bulk storage layer for the video pipeline
//!
//! Durable blob storage keyed by path. Used for two things:
//! - **Configuration distribution**: files read once by a coordinator and
//!   broadcast to every worker
//! - **Oversize payload spillover**: envelopes too large for the bus park
//!   their payload here and travel with a reference instead
//!
//! Backends:
//! - [`S3ObjectStorage`]: S3 or MinIO
//! - [`LocalObjectStorage`]: a directory on the local filesystem
//! - [`InMemoryObjectStorage`]: process memory, for tests and demos
//!
//! # Example
//!
//! ```rust,no_run
//! use video_pipeline_storage::{LocalObjectStorage, ObjectStorage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = LocalObjectStorage::new("/var/lib/video-pipeline");
//!
//!     storage.store_file("task-1/tracking", b"tracklet bytes").await?;
//!     let retrieved = storage.retrieve_file("task-1/tracking").await?;
//!     assert_eq!(retrieved, b"tracklet bytes");
//!
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub mod local_storage;
pub mod memory_storage;
pub mod object_storage;

pub use local_storage::LocalObjectStorage;
pub use memory_storage::InMemoryObjectStorage;
pub use object_storage::{ObjectStorage, S3Config, S3ObjectStorage};

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::S3Error(_) | Self::IoError(_) | Self::Other(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Which bulk store backend to use
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Keep everything in process memory
    #[default]
    Memory,

    /// Directory on the local filesystem
    Local { root: PathBuf },

    /// S3 or MinIO bucket
    S3(S3Config),
}

impl StorageConfig {
    /// Build the configured backend
    pub async fn build(&self) -> StorageResult<Arc<dyn ObjectStorage>> {
        let storage: Arc<dyn ObjectStorage> = match self {
            Self::Memory => Arc::new(InMemoryObjectStorage::new()),
            Self::Local { root } => Arc::new(LocalObjectStorage::new(root)),
            Self::S3(config) => {
                if config.bucket.is_empty() {
                    return Err(StorageError::InvalidConfig(
                        "S3 bucket name must not be empty".to_string(),
                    ));
                }
                Arc::new(S3ObjectStorage::new(config.clone()).await?)
            }
        };
        Ok(storage)
    }
}

/// Reject keys that could escape the storage root
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|segment| segment == ".." || segment == ".")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
