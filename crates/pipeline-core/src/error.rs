//! Error types for the pipeline substrate

use crate::plan::NodeId;
use crate::retry::Retryable;
use thiserror::Error;
use video_pipeline_common::Port;
use video_pipeline_storage::StorageError;

/// Malformed or inconsistent execution plans
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("No node declares input port {0}")]
    PortUnbound(Port),

    #[error("Port {port} is already bound to node {node}")]
    PortAlreadyBound { port: Port, node: NodeId },

    #[error("Unknown node id: {0}")]
    UnknownNode(NodeId),

    #[error("Plan contains a cycle through node {0}")]
    Cycle(NodeId),
}

/// Errors reported by the message bus
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Message of {size} bytes exceeds the bus limit of {limit} bytes")]
    SizeLimitExceeded { size: usize, limit: usize },

    #[error("Transient bus error: {0}")]
    Transient(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}

/// Errors returned by stage algorithms
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("Transient stage failure: {0}")]
    Transient(String),

    #[error("Stage execution failed: {0}")]
    Fatal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Any failure while moving an envelope through a worker
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Malformed plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
}

/// Failures while building a cached resource
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Failed to initialize resource '{name}': {source}")]
    Init {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Resource '{0}' was registered with a different type")]
    TypeMismatch(String),
}

impl Retryable for StageError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl Retryable for BusError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for PipelineError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Bus(e) => e.is_retryable(),
            Self::Stage(e) => e.is_retryable(),
            Self::Storage(e) => e.is_retryable(),
            Self::Plan(_) | Self::Serialization(_) | Self::Resource(_) => false,
        }
    }
}
