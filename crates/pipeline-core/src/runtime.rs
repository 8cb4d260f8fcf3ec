//! Stage runtime and demultiplexer
//!
//! A [`StageRuntime`] adapts one [`Stage`] to the bus: for each envelope
//! addressed to one of the stage's ports it resolves the plan node and any
//! spilled payload, claims the invocation, runs the algorithm through the worker's
//! [`RobustExecutor`](crate::RobustExecutor), then fans the results out over
//! the node's output edges, offloading payloads the bus refuses.
//!
//! A [`Demultiplexer`] hosts several runtimes in one worker behind a single
//! subscription to the union of their channels.
//!
//! Failures are scoped to one envelope: they are logged, counted and the
//! envelope is dropped. Nothing propagates out of the receive loop.

use crate::bus::{BusMessage, Subscription};
use crate::claim::ClaimKey;
use crate::context::{StageContext, WorkerContext};
use crate::envelope::TaskEnvelope;
use crate::error::PipelineError;
use crate::payload::Payload;
use crate::plan::ExecutionPlan;
use crate::stage::Stage;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};
use video_pipeline_common::{DataKind, Port, TermSignal};

/// What happened to one envelope at one port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The stage ran; `published` envelopes went out, `spilled` results were offloaded
    Completed { published: usize, spilled: usize },
    /// The invocation had already been claimed
    Duplicate,
    /// The task was terminated before the stage ran
    Terminated,
    /// The envelope was dropped after an error
    Failed(String),
}

#[derive(Debug, Default)]
struct StageStats {
    received: AtomicU64,
    completed: AtomicU64,
    duplicates: AtomicU64,
    terminated: AtomicU64,
    failed: AtomicU64,
    offloaded: AtomicU64,
}

/// Counters of one stage runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub duplicates: u64,
    pub terminated: u64,
    pub failed: u64,
    pub offloaded: u64,
}

/// Adapter between the bus and one stage
pub struct StageRuntime {
    stage: Arc<dyn Stage>,
    ports: Vec<Port>,
    worker: WorkerContext,
    stats: StageStats,
}

impl StageRuntime {
    pub fn new(stage: Arc<dyn Stage>, worker: WorkerContext) -> Self {
        let ports = stage.input_ports();
        Self {
            stage,
            ports,
            worker,
            stats: StageStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Channels this stage's ports receive on
    pub fn channels(&self) -> BTreeSet<&'static str> {
        self.ports.iter().map(Port::channel).collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.stats;
        StatsSnapshot {
            received: s.received.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            duplicates: s.duplicates.load(Ordering::Relaxed),
            terminated: s.terminated.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            offloaded: s.offloaded.load(Ordering::Relaxed),
        }
    }

    /// Destinations of `envelope` delivered on `channel` that this stage consumes
    pub fn matching_ports(&self, envelope: &TaskEnvelope, channel: &str) -> Vec<Port> {
        envelope
            .destinations
            .iter()
            .filter(|port| port.channel() == channel && self.ports.contains(port))
            .cloned()
            .collect()
    }

    /// Handle an envelope received on `channel`, once per matching port
    pub async fn handle(&self, envelope: &TaskEnvelope, channel: &str) -> Vec<HandleOutcome> {
        let mut outcomes = Vec::new();
        for port in self.matching_ports(envelope, channel) {
            outcomes.push(self.handle_port(envelope.clone(), port).await);
        }
        outcomes
    }

    /// Handle an envelope addressed to `port`; never fails
    pub async fn handle_port(&self, envelope: TaskEnvelope, port: Port) -> HandleOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let task_id = envelope.task_id.clone();

        let outcome = match self.process_port(envelope, &port).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    stage = self.name(),
                    task_id = %task_id,
                    port = %port,
                    error = %err,
                    "Dropping task after failure"
                );
                HandleOutcome::Failed(err.to_string())
            }
        };

        let counter = match &outcome {
            HandleOutcome::Completed { spilled, .. } => {
                self.stats
                    .offloaded
                    .fetch_add(*spilled as u64, Ordering::Relaxed);
                &self.stats.completed
            }
            HandleOutcome::Duplicate => &self.stats.duplicates,
            HandleOutcome::Terminated => &self.stats.terminated,
            HandleOutcome::Failed(_) => &self.stats.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn process_port(
        &self,
        mut envelope: TaskEnvelope,
        port: &Port,
    ) -> Result<HandleOutcome, PipelineError> {
        let task_id = envelope.task_id.clone();
        if self.worker.terminated.is_terminated(&task_id) {
            debug!(stage = self.name(), task_id = %task_id, "Skipping terminated task");
            return Ok(HandleOutcome::Terminated);
        }

        let node_id = envelope.plan.destination_node_id(port)?;
        if envelope.plan.node(node_id)?.executed() {
            return Ok(HandleOutcome::Duplicate);
        }

        // A failed fetch leaves the invocation unclaimed so a redelivery can run it
        let payload = self
            .worker
            .offloader
            .resolve(&self.worker.executor, envelope.payload.clone())
            .await?;

        // Claim before executing: a redelivered envelope must find the claim taken
        let key = ClaimKey::new(task_id.as_str(), node_id, envelope.lineage.as_str());
        if !self.worker.claims.claim(&key).await? {
            debug!(
                stage = self.name(),
                task_id = %task_id,
                node = node_id,
                "Invocation already claimed"
            );
            return Ok(HandleOutcome::Duplicate);
        }
        envelope.plan.mark_executed(node_id)?;

        let node = envelope.plan.node(node_id)?;
        let ctx = StageContext {
            task_id: task_id.clone(),
            node: node.name.clone(),
            port: port.clone(),
            exec_param: node.exec_param.clone(),
            tag: envelope.tag.clone(),
        };
        let stage = &self.stage;
        let results = self
            .worker
            .executor
            .execute(stage.name(), || stage.process(&ctx, &payload))
            .await?;

        debug!(
            stage = self.name(),
            task_id = %task_id,
            node = %node.name,
            results = results.len(),
            "Stage finished"
        );

        if node.is_sink() {
            return Ok(HandleOutcome::Completed {
                published: 0,
                spilled: 0,
            });
        }

        let offloader = &self.worker.offloader;
        let multiple = results.len() > 1;
        let mut published = 0;
        let mut spilled = 0;
        for (index, result) in results.iter().enumerate() {
            let copies = envelope.fan_out(node_id, index, result)?;
            let path = offloader.spill_path(
                &task_id,
                &node.name,
                &envelope.lineage,
                multiple.then_some(index),
            );
            let report = offloader
                .publish_all(
                    self.worker.bus.as_ref(),
                    &self.worker.executor,
                    copies,
                    &path,
                )
                .await?;
            published += report.published;
            if report.spilled_to.is_some() {
                spilled += 1;
            }
        }

        Ok(HandleOutcome::Completed { published, spilled })
    }

    /// Serve this stage alone until `shutdown` resolves
    pub async fn run<S>(self: Arc<Self>, shutdown: S) -> Result<(), PipelineError>
    where
        S: Future<Output = ()> + Send,
    {
        let demux = Demultiplexer {
            worker: self.worker.clone(),
            runtimes: vec![self],
        };
        Arc::new(demux).run(shutdown).await
    }
}

/// Envelope asking every worker to stop processing `task_id`
pub fn termination_envelope(task_id: impl Into<String>) -> TaskEnvelope {
    let task_id = task_id.into();
    TaskEnvelope {
        task_id: task_id.clone(),
        plan: ExecutionPlan::new(),
        destinations: Vec::new(),
        payload: Payload::Terminate(TermSignal { task_id }),
        tag: None,
        lineage: String::new(),
    }
}

/// Broadcast a termination signal on the termination channel
pub async fn send_termination(worker: &WorkerContext, task_id: &str) -> Result<(), PipelineError> {
    let bytes = termination_envelope(task_id).to_bytes()?;
    let bus = &worker.bus;
    worker
        .executor
        .execute("terminate", || {
            bus.publish(DataKind::TermSig.channel(), task_id, bytes.clone())
        })
        .await?;
    info!(task_id, "Sent termination signal");
    Ok(())
}

/// Several stage runtimes sharing one subscription
pub struct Demultiplexer {
    worker: WorkerContext,
    runtimes: Vec<Arc<StageRuntime>>,
}

impl Demultiplexer {
    pub fn new(worker: WorkerContext) -> Self {
        Self {
            worker,
            runtimes: Vec::new(),
        }
    }

    /// Host `stage` in this worker
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> Arc<StageRuntime> {
        let runtime = Arc::new(StageRuntime::new(stage, self.worker.clone()));
        self.runtimes.push(Arc::clone(&runtime));
        runtime
    }

    #[must_use]
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.add_stage(stage);
        self
    }

    pub fn runtimes(&self) -> &[Arc<StageRuntime>] {
        &self.runtimes
    }

    pub fn worker(&self) -> &WorkerContext {
        &self.worker
    }

    /// Union of the hosted stages' channels plus the termination channel
    pub fn channels(&self) -> Vec<&'static str> {
        let mut channels: BTreeSet<&'static str> = self
            .runtimes
            .iter()
            .flat_map(|runtime| runtime.channels())
            .collect();
        channels.insert(DataKind::TermSig.channel());
        channels.into_iter().collect()
    }

    /// Decode one bus message and hand it to every stage it is addressed to
    pub async fn dispatch(&self, message: BusMessage) -> Vec<(String, HandleOutcome)> {
        let envelope = match TaskEnvelope::from_bytes(&message.bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    channel = %message.channel,
                    key = %message.key,
                    error = %err,
                    "Discarding undecodable envelope"
                );
                return Vec::new();
            }
        };

        if let Payload::Terminate(signal) = &envelope.payload {
            self.record_termination(&signal.task_id).await;
        }

        let mut outcomes = Vec::new();
        for runtime in &self.runtimes {
            for port in runtime.matching_ports(&envelope, &message.channel) {
                let outcome = runtime.handle_port(envelope.clone(), port).await;
                outcomes.push((runtime.name().to_string(), outcome));
            }
        }

        if outcomes.is_empty() {
            trace!(
                channel = %message.channel,
                task_id = %envelope.task_id,
                "No local stage consumes this envelope"
            );
        }
        outcomes
    }

    async fn record_termination(&self, task_id: &str) {
        if !self.worker.terminated.terminate(task_id) {
            return;
        }
        info!(task_id, "Task terminated");
        if let Err(err) = self.worker.claims.forget_task(task_id).await {
            warn!(task_id, error = %err, "Failed to release claims of terminated task");
        }
    }

    /// Subscribe to every channel the hosted stages need
    pub async fn subscribe(&self) -> Result<Subscription, PipelineError> {
        Ok(self.worker.bus.subscribe(&self.channels()).await?)
    }

    /// Subscribe, then serve until `shutdown` resolves or the bus closes
    pub async fn run<S>(self: Arc<Self>, shutdown: S) -> Result<(), PipelineError>
    where
        S: Future<Output = ()> + Send,
    {
        let subscription = self.subscribe().await?;
        self.serve(subscription, shutdown).await;
        Ok(())
    }

    /// Dispatch messages from `subscription` until `shutdown` resolves or
    /// the bus closes.
    ///
    /// Each message is handled on its own tokio task, with at most
    /// `concurrency` in flight. In-flight messages finish before this returns.
    pub async fn serve<S>(self: Arc<Self>, mut subscription: Subscription, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        let concurrency = self.worker.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        info!(
            stages = self.runtimes.len(),
            channels = ?self.channels(),
            concurrency,
            "Demultiplexer started"
        );

        tokio::pin!(shutdown);
        loop {
            let message = tokio::select! {
                biased;
                () = &mut shutdown => break,
                message = subscription.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.dispatch(message).await;
                drop(permit);
            });
        }

        // Wait for in-flight envelopes
        let _drained = semaphore.acquire_many(concurrency as u32).await;
        info!("Demultiplexer stopped");
    }
}
