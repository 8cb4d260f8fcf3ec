//! Command handler
//!
//! Consumes user commands from the command channel. For each command it
//! lists the videos under the `video-url` parameter, builds the command's
//! plan once and submits one task per video.

use crate::planner::{
    entry_tracklet_id, keys, params, plan_command, CommandType, EntryInput, PlanningError, Topology,
};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use video_pipeline_common::{CommandParams, DataKind, PedestrianInfo};
use video_pipeline_core::{
    BusMessage, ExecutionPlan, Payload, PipelineError, PlanError, Subscription, TaskEnvelope,
    WorkerContext,
};
use video_pipeline_storage::StorageError;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Expected a command, got a {0} payload")]
    UnexpectedPayload(&'static str),
}

impl From<StorageError> for HandlerError {
    fn from(err: StorageError) -> Self {
        Self::Pipeline(err.into())
    }
}

impl From<PlanError> for HandlerError {
    fn from(err: PlanError) -> Self {
        Self::Pipeline(err.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Pipeline(err.into())
    }
}

/// Bus message carrying `command`
pub fn command_envelope(command: CommandParams) -> TaskEnvelope {
    TaskEnvelope {
        task_id: Uuid::new_v4().to_string(),
        plan: ExecutionPlan::new(),
        destinations: Vec::new(),
        tag: Some(command.command.clone()),
        payload: Payload::Command(command),
        lineage: String::new(),
    }
}

/// Publish `command` on the command channel
pub async fn submit_command(
    worker: &WorkerContext,
    command: CommandParams,
) -> Result<(), PipelineError> {
    let key = command.command.clone();
    let bytes = command_envelope(command).to_bytes()?;
    let bus = &worker.bus;
    worker
        .executor
        .execute("submit command", || {
            bus.publish(DataKind::Command.channel(), &key, bytes.clone())
        })
        .await?;
    info!(command = %key, "Submitted command");
    Ok(())
}

/// Turns commands into tasks
pub struct CommandHandler {
    worker: WorkerContext,
}

impl CommandHandler {
    pub fn new(worker: WorkerContext) -> Self {
        Self { worker }
    }

    /// Plan `command` and submit one task per video, returning the task ids
    pub async fn handle(&self, command: &CommandParams) -> Result<Vec<String>, HandlerError> {
        let command_type: CommandType = command.command.parse()?;
        let video_dir = command
            .get(params::VIDEO_URL)
            .ok_or(PlanningError::MissingParam(params::VIDEO_URL))?;
        let topology = plan_command(command_type, command)?;

        let storage = self.worker.offloader.storage();
        let videos = self
            .worker
            .executor
            .execute("list videos", || storage.list_files(video_dir))
            .await?;
        if videos.is_empty() {
            warn!(command = %command_type, video_dir, "No videos to process");
        }

        let mut task_ids = Vec::with_capacity(videos.len());
        for video in &videos {
            let payload = match self.entry_payload(&topology, video, command).await {
                Ok(payload) => payload,
                Err(err) => {
                    error!(command = %command_type, video = %video, error = %err, "Skipping video");
                    continue;
                }
            };
            task_ids.push(self.submit(&topology, payload).await?);
        }

        info!(command = %command_type, tasks = task_ids.len(), "Handled command");
        Ok(task_ids)
    }

    async fn submit(&self, topology: &Topology, payload: Payload) -> Result<String, HandlerError> {
        let task_id = Uuid::new_v4().to_string();
        let envelope = TaskEnvelope::new(
            task_id.clone(),
            topology.plan.clone(),
            topology.entry_ports.clone(),
            payload,
        )?
        .with_tag(topology.command.as_str());

        let offloader = &self.worker.offloader;
        let spill_path = offloader.spill_path(&task_id, topology.command.as_str(), "", None);
        offloader
            .publish_all(
                self.worker.bus.as_ref(),
                &self.worker.executor,
                vec![envelope],
                &spill_path,
            )
            .await?;

        debug!(task_id = %task_id, command = %topology.command, "Submitted task");
        Ok(task_id)
    }

    async fn entry_payload(
        &self,
        topology: &Topology,
        video: &str,
        command: &CommandParams,
    ) -> Result<Payload, HandlerError> {
        match topology.entry() {
            EntryInput::VideoUrl => Ok(Payload::Url(video.to_string())),
            EntryInput::StoredTracklet => {
                let id = entry_tracklet_id(video, command)?;
                Ok(Payload::Url(keys::tracklet(&id)))
            }
            EntryInput::StoredPedestrian => {
                let id = entry_tracklet_id(video, command)?;
                let tracklet = self.load(&keys::tracklet(&id)).await?;
                let attributes = self.load(&keys::attributes(&id)).await?;
                Ok(Payload::PedestrianInfo(PedestrianInfo {
                    tracklet,
                    attributes,
                }))
            }
        }
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerError> {
        let storage = self.worker.offloader.storage();
        let bytes = self
            .worker
            .executor
            .execute("load saved result", || storage.retrieve_file(key))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Handle one message from the command channel
    pub async fn handle_message(&self, message: &BusMessage) -> Result<Vec<String>, HandlerError> {
        let envelope = TaskEnvelope::from_bytes(&message.bytes)?;
        match envelope.payload {
            Payload::Command(command) => self.handle(&command).await,
            other => Err(HandlerError::UnexpectedPayload(other.variant_name())),
        }
    }

    /// Subscribe to the command channel
    pub async fn subscribe(&self) -> Result<Subscription, PipelineError> {
        Ok(self
            .worker
            .bus
            .subscribe(&[DataKind::Command.channel()])
            .await?)
    }

    /// Handle commands until `shutdown` resolves or the bus closes
    pub async fn serve<S>(self: Arc<Self>, mut subscription: Subscription, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        info!("Command handler started");
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

            if let Err(err) = self.handle_message(&message).await {
                error!(key = %message.key, error = %err, "During command handling");
            }
        }
        info!("Command handler stopped");
    }
}
