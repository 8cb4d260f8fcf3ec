//! Video Pipeline Core - distributed stage orchestration
//!
//! This crate provides the substrate shared by every worker of the video
//! analytics pipeline: execution plans carried inside task envelopes, the
//! message bus contract, retries, resource caches, oversize payload
//! offloading and the stage runtime that ties them together.

pub mod bus;
pub mod claim;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod offload;
pub mod payload;
pub mod plan;
pub mod resource;
pub mod retry;
pub mod runtime;
pub mod stage;

pub use bus::{BusMessage, InMemoryBus, MessageBus, Subscription};
pub use claim::{ClaimKey, ClaimStore, InMemoryClaimStore};
pub use config::{BusConfig, ConfigError, RetryConfig, WorkerConfig};
pub use context::{StageContext, TerminationSet, WorkerContext};
pub use envelope::TaskEnvelope;
pub use error::{BusError, PipelineError, PlanError, ResourceError, StageError};
pub use offload::{PayloadOffloader, PublishReport};
pub use payload::{Payload, PayloadRef, SpillFormat};
pub use plan::{Edge, ExecutionPlan, Node, NodeId};
pub use resource::{Broadcast, BroadcastPool, ResourceRegistry, Singleton};
pub use retry::{BackoffPolicy, Retryable, RobustExecutor};
pub use runtime::{
    send_termination, termination_envelope, Demultiplexer, HandleOutcome, StageRuntime,
    StatsSnapshot,
};
pub use stage::Stage;

pub use video_pipeline_common::{DataKind, Port};
