//! Execution contexts
//!
//! [`StageContext`] is what a stage algorithm sees about the invocation it is
//! serving. [`WorkerContext`] bundles the handles every stage runtime in one
//! worker shares.

use crate::bus::MessageBus;
use crate::claim::{ClaimStore, InMemoryClaimStore};
use crate::config::WorkerConfig;
use crate::offload::PayloadOffloader;
use crate::retry::RobustExecutor;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use video_pipeline_common::Port;
use video_pipeline_storage::ObjectStorage;

/// Context passed to stages during execution
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: String,

    /// Name of the plan node being executed
    pub node: String,

    /// Port the envelope arrived on
    pub port: Port,

    /// Parameter the planner attached to the node
    pub exec_param: Option<serde_json::Value>,

    /// Label threaded through the task
    pub tag: Option<String>,
}

impl StageContext {
    /// Exec parameter as a string, if it is one
    #[must_use]
    pub fn exec_param_str(&self) -> Option<&str> {
        self.exec_param.as_ref().and_then(serde_json::Value::as_str)
    }

    /// Integer field of an object exec parameter
    #[must_use]
    pub fn exec_param_u64(&self, field: &str) -> Option<u64> {
        self.exec_param
            .as_ref()
            .and_then(|p| p.get(field))
            .and_then(serde_json::Value::as_u64)
    }
}

/// Default number of terminated tasks a [`TerminationSet`] remembers
pub const DEFAULT_TERMINATED_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct TerminatedTasks {
    ids: HashSet<String>,
    /// Termination order, oldest first
    order: VecDeque<String>,
}

/// Tasks asked to stop through termination signals.
///
/// Enforcement is cooperative: runtimes consult the set before starting an
/// invocation and drop envelopes of listed tasks. Only the most recent
/// `capacity` terminations are remembered.
#[derive(Debug)]
pub struct TerminationSet {
    tasks: RwLock<TerminatedTasks>,
    capacity: usize,
}

impl Default for TerminationSet {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TERMINATED_CAPACITY)
    }
}

impl TerminationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tasks: RwLock::new(TerminatedTasks::default()),
            capacity: capacity.max(1),
        }
    }

    /// Returns `true` if the task was not already terminated
    pub fn terminate(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.ids.contains(task_id) {
            return false;
        }
        while tasks.ids.len() >= self.capacity {
            match tasks.order.pop_front() {
                Some(oldest) => {
                    tasks.ids.remove(&oldest);
                }
                None => break,
            }
        }
        tasks.ids.insert(task_id.to_string());
        tasks.order.push_back(task_id.to_string());
        true
    }

    #[must_use]
    pub fn is_terminated(&self, task_id: &str) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(task_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handles shared by every stage runtime of one worker
#[derive(Clone)]
pub struct WorkerContext {
    pub bus: Arc<dyn MessageBus>,
    pub offloader: Arc<PayloadOffloader>,
    pub claims: Arc<dyn ClaimStore>,
    pub executor: RobustExecutor,
    pub terminated: Arc<TerminationSet>,

    /// Envelopes handled concurrently
    pub concurrency: usize,
}

impl WorkerContext {
    /// Build from configuration with an in-memory claim store
    pub fn new(
        bus: Arc<dyn MessageBus>,
        storage: Arc<dyn ObjectStorage>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            bus,
            offloader: Arc::new(PayloadOffloader::new(storage, config.spill_prefix.clone())),
            claims: Arc::new(InMemoryClaimStore::with_capacity(config.claim_capacity)),
            executor: config.retry.executor(),
            terminated: Arc::new(TerminationSet::with_capacity(config.terminated_capacity)),
            concurrency: config.concurrency.max(1),
        }
    }

    #[must_use]
    pub fn with_claim_store(mut self, claims: Arc<dyn ClaimStore>) -> Self {
        self.claims = claims;
        self
    }

    #[must_use]
    pub fn with_executor(mut self, executor: RobustExecutor) -> Self {
        self.executor = executor;
        self
    }
}
