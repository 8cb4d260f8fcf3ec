//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use video_pipeline::pipeline::{
    BackoffPolicy, InMemoryBus, Payload, RobustExecutor, Stage, StageContext, StageError,
    WorkerConfig, WorkerContext,
};
use video_pipeline::common::Port;
use video_pipeline::storage::{InMemoryObjectStorage, ObjectStorage};

/// Install a log subscriber honouring `RUST_LOG`, once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Worker over an in-memory bus and store, retrying without delay
pub fn worker(bus: Arc<InMemoryBus>, storage: Arc<dyn ObjectStorage>) -> WorkerContext {
    WorkerContext::new(bus, storage, &WorkerConfig::default())
        .with_executor(RobustExecutor::new(3, BackoffPolicy::none()))
}

pub fn memory_storage() -> Arc<dyn ObjectStorage> {
    Arc::new(InMemoryObjectStorage::new())
}

/// Stage returning a fixed result and counting its invocations
pub struct FixedStage {
    name: String,
    port: Port,
    result: Vec<Payload>,
    pub calls: AtomicUsize,
}

impl FixedStage {
    pub fn new(name: &str, port: Port, result: Vec<Payload>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            port,
            result,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FixedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_ports(&self) -> Vec<Port> {
        vec![self.port.clone()]
    }

    async fn process(&self, _ctx: &StageContext, _payload: &Payload) -> Result<Vec<Payload>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
