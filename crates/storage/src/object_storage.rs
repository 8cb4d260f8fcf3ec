//! Object storage trait and the S3/MinIO implementation
//!
//! Every bulk store backend implements [`ObjectStorage`]; the pipeline only
//! talks to the trait, so spilled payloads and broadcast configuration work
//! the same on S3, a local directory, or in memory.

use crate::{validate_key, StorageError, StorageResult};
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncRead;
use tracing::debug;

/// Readable stream over a stored object
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// S3/MinIO configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region (e.g., "us-west-2") or "us-east-1" for `MinIO`
    pub region: String,

    /// S3 endpoint (custom for `MinIO`, empty for AWS S3)
    pub endpoint: Option<String>,

    /// AWS access key ID
    #[serde(default)]
    pub access_key_id: String,

    /// AWS secret access key
    #[serde(default)]
    pub secret_access_key: String,

    /// Path prefix for all objects (e.g., "video-pipeline/")
    #[serde(default)]
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "video-pipeline".to_string(),
            region: "us-west-2".to_string(),
            endpoint: None,
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            prefix: String::new(),
        }
    }
}

/// Object storage trait
#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store a file from bytes, returning the full key written
    async fn store_file(&self, key: &str, data: &[u8]) -> StorageResult<String>;

    /// Store a file from local path
    async fn store_file_from_path(&self, key: &str, path: &Path) -> StorageResult<String> {
        let data = tokio::fs::read(path).await?;
        self.store_file(key, &data).await
    }

    /// Retrieve a file as bytes
    async fn retrieve_file(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Open a file for streaming reads
    async fn open_file(&self, key: &str) -> StorageResult<ObjectReader> {
        let data = self.retrieve_file(key).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    /// Retrieve a file and save to local path
    async fn retrieve_file_to_path(&self, key: &str, path: &Path) -> StorageResult<()> {
        let data = self.retrieve_file(key).await?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    /// List files whose key starts with `prefix`, sorted
    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Delete a file
    async fn delete_file(&self, key: &str) -> StorageResult<()>;

    /// Check if a file exists
    async fn file_exists(&self, key: &str) -> StorageResult<bool>;

    /// Get file size in bytes
    async fn get_file_size(&self, key: &str) -> StorageResult<u64>;
}

/// S3/MinIO object storage implementation
pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStorage {
    /// Create a new S3 object storage client
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "video-pipeline-storage",
        );

        let region = Region::new(config.region.clone());

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(region)
            .behavior_version_latest();

        // Custom endpoint means MinIO
        if let Some(endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    /// Combine prefix with key
    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Strip the storage prefix from a listed key
    fn relative_key<'a>(&self, full_key: &'a str) -> &'a str {
        full_key.strip_prefix(self.prefix.as_str()).unwrap_or(full_key)
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn store_file(&self, key: &str, data: &[u8]) -> StorageResult<String> {
        validate_key(key)?;
        let full_key = self.full_key(key);
        let byte_stream = ByteStream::from(data.to_vec());

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(byte_stream)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        debug!(key = %full_key, bytes = data.len(), "Stored object");
        Ok(full_key)
    }

    async fn retrieve_file(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        let full_key = self.full_key(key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    StorageError::NotFound(full_key.clone())
                } else {
                    StorageError::S3Error(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(bytes.to_vec())
    }

    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StorageError::S3Error(e.to_string()))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(|k| self.relative_key(k).to_string()),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete_file(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let full_key = self.full_key(key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(())
    }

    async fn file_exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let full_key = self.full_key(key);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.to_string().contains("NotFound") {
                    Ok(false)
                } else {
                    Err(StorageError::S3Error(e.to_string()))
                }
            }
        }
    }

    async fn get_file_size(&self, key: &str) -> StorageResult<u64> {
        validate_key(key)?;
        let full_key = self.full_key(key);

        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NotFound") {
                    StorageError::NotFound(full_key.clone())
                } else {
                    StorageError::S3Error(e.to_string())
                }
            })?;

        Ok(response.content_length().unwrap_or(0) as u64)
    }
}
