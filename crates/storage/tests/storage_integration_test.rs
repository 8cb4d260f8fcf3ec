//! Integration tests for storage backends
//!
//! The S3 tests require a live `MinIO` instance.
//! Start it with: `docker run -p 9000:9000 minio/minio server /data`
//!
//! Run tests with: `cargo test --package video-pipeline-storage --test storage_integration_test -- --ignored --nocapture`
//!
//! S3 tests are marked with #[ignore] to prevent running in CI without live services.

use std::sync::Arc;
use video_pipeline_storage::*;

/// Check if `MinIO` is available
async fn is_minio_available() -> bool {
    tokio::net::TcpStream::connect("127.0.0.1:9000")
        .await
        .is_ok()
}

fn minio_config() -> S3Config {
    S3Config {
        bucket: "video-pipeline".to_string(),
        region: "us-east-1".to_string(),
        endpoint: Some("http://localhost:9000".to_string()),
        access_key_id: "minioadmin".to_string(),
        secret_access_key: "minioadmin".to_string(),
        prefix: "test/".to_string(),
    }
}

/// Exercise a backend through the trait only
async fn exercise_backend(storage: Arc<dyn ObjectStorage>) {
    let payload = vec![42u8; 64 * 1024];

    storage
        .store_file("spill/T1/tracking", &payload)
        .await
        .expect("Failed to store file");
    storage
        .store_file("spill/T1/tracking/1", b"second")
        .await
        .expect("Failed to store file");

    assert_eq!(
        storage.retrieve_file("spill/T1/tracking").await.unwrap(),
        payload
    );
    assert_eq!(
        storage.get_file_size("spill/T1/tracking").await.unwrap(),
        payload.len() as u64
    );

    let listed = storage.list_files("spill/T1/").await.unwrap();
    assert_eq!(listed, vec!["spill/T1/tracking", "spill/T1/tracking/1"]);

    storage.delete_file("spill/T1/tracking").await.unwrap();
    assert!(!storage.file_exists("spill/T1/tracking").await.unwrap());
}

#[tokio::test]
async fn test_memory_backend() {
    let storage = StorageConfig::Memory.build().await.unwrap();
    exercise_backend(storage).await;
}

#[tokio::test]
async fn test_local_backend_path_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig::Local {
        root: dir.path().join("store"),
    }
    .build()
    .await
    .unwrap();

    let source = dir.path().join("clip.bin");
    std::fs::write(&source, b"frames").unwrap();
    storage
        .store_file_from_path("videos/cam1/clip.bin", &source)
        .await
        .unwrap();

    let target = dir.path().join("copy.bin");
    storage
        .retrieve_file_to_path("videos/cam1/clip.bin", &target)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"frames");
}

#[tokio::test]
async fn test_s3_rejects_empty_bucket() {
    let config = StorageConfig::S3(S3Config {
        bucket: String::new(),
        ..S3Config::default()
    });
    let err = config.build().await.err().expect("empty bucket must fail");
    assert!(matches!(err, StorageError::InvalidConfig(_)));
}

// ============================================================================
// MinIO Object Storage Integration Tests
// ============================================================================

#[tokio::test]
#[ignore] // Requires MinIO running on localhost:9000
async fn test_minio_backend() {
    if !is_minio_available().await {
        eprintln!("MinIO not available on 127.0.0.1:9000");
        eprintln!("Skipping test_minio_backend");
        return;
    }

    let storage = S3ObjectStorage::new(minio_config())
        .await
        .expect("Failed to create S3 storage client");

    let stored_key = storage.store_file("marker.txt", b"marker").await.unwrap();
    assert_eq!(stored_key, "test/marker.txt");

    exercise_backend(Arc::new(storage)).await;
}

#[tokio::test]
#[ignore] // Requires MinIO running on localhost:9000
async fn test_minio_missing_object() {
    if !is_minio_available().await {
        eprintln!("MinIO not available on 127.0.0.1:9000");
        eprintln!("Skipping test_minio_missing_object");
        return;
    }

    let storage = S3ObjectStorage::new(minio_config())
        .await
        .expect("Failed to create S3 storage client");

    assert!(!storage.file_exists("never/written").await.unwrap());
    assert!(storage.retrieve_file("never/written").await.is_err());
}
