//! Oversize payload offloading
//!
//! When the bus refuses an envelope for exceeding its message limit, the
//! payload is written to the bulk store and the envelope is republished
//! carrying a [`PayloadRef`] instead. Receivers call
//! [`PayloadOffloader::resolve`] to get the original payload back.

use crate::bus::MessageBus;
use crate::envelope::TaskEnvelope;
use crate::error::{BusError, PipelineError};
use crate::payload::{Payload, PayloadRef};
use crate::retry::RobustExecutor;
use std::sync::Arc;
use tracing::{debug, info};
use video_pipeline_storage::ObjectStorage;

/// Result of publishing a batch of envelopes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Envelopes published
    pub published: usize,
    /// Bulk store path the payload was spilled to, if it was
    pub spilled_to: Option<String>,
}

/// Spills oversize payloads to the bulk store
#[derive(Clone)]
pub struct PayloadOffloader {
    storage: Arc<dyn ObjectStorage>,
    prefix: String,
}

impl PayloadOffloader {
    pub fn new(storage: Arc<dyn ObjectStorage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Deterministic bulk store path for one result of one node invocation.
    ///
    /// `<prefix><task>/<node>` for the first invocation of a node with a
    /// single result. Invocations reached through upstream hops append
    /// `~<lineage>`, and invocations with several results append `#<index>`.
    #[must_use]
    pub fn spill_path(
        &self,
        task_id: &str,
        node_name: &str,
        lineage: &str,
        result_index: Option<usize>,
    ) -> String {
        let mut path = format!("{}{}/{}", self.prefix, task_id, node_name);
        if !lineage.is_empty() {
            path.push('~');
            path.push_str(lineage);
        }
        if let Some(index) = result_index {
            path.push('#');
            path.push_str(&index.to_string());
        }
        path
    }

    /// Write `payload` to `path` and return a reference to it.
    ///
    /// Transient storage errors are retried through `executor`.
    pub async fn offload(
        &self,
        executor: &RobustExecutor,
        payload: &Payload,
        path: &str,
    ) -> Result<Payload, PipelineError> {
        let (bytes, format) = payload.to_spill()?;
        let size = bytes.len() as u64;
        let storage = &self.storage;
        executor
            .execute("spill payload", || storage.store_file(path, &bytes))
            .await?;

        info!(path, size, "Offloaded oversize payload");
        Ok(Payload::Reference(PayloadRef {
            path: path.to_string(),
            format,
            size,
        }))
    }

    /// Replace a reference with the payload it points to
    pub async fn resolve(
        &self,
        executor: &RobustExecutor,
        payload: Payload,
    ) -> Result<Payload, PipelineError> {
        match payload {
            Payload::Reference(reference) => {
                debug!(path = %reference.path, "Resolving payload reference");
                let storage = &self.storage;
                let bytes = executor
                    .execute("resolve payload", || storage.retrieve_file(&reference.path))
                    .await?;
                Ok(Payload::from_spill(bytes, reference.format)?)
            }
            other => Ok(other),
        }
    }

    /// Publish every envelope on its destination channel.
    ///
    /// The envelopes are expected to carry the same payload. On the first
    /// size-limit refusal the payload is spilled to `spill_path` once and the
    /// refused envelope and all later ones are sent with the reference.
    /// Transient bus errors are retried through `executor`.
    pub async fn publish_all(
        &self,
        bus: &dyn MessageBus,
        executor: &RobustExecutor,
        envelopes: Vec<TaskEnvelope>,
        spill_path: &str,
    ) -> Result<PublishReport, PipelineError> {
        let mut report = PublishReport::default();
        let mut reference: Option<Payload> = None;

        for mut envelope in envelopes {
            if let Some(r) = &reference {
                envelope.payload = r.clone();
            }

            for channel in envelope.channels() {
                match Self::send(bus, executor, channel, &envelope).await {
                    Err(PipelineError::Bus(BusError::SizeLimitExceeded { size, limit }))
                        if reference.is_none() =>
                    {
                        debug!(
                            task_id = %envelope.task_id,
                            channel,
                            size,
                            limit,
                            "Envelope too large for the bus"
                        );
                        let r = self.offload(executor, &envelope.payload, spill_path).await?;
                        envelope.payload = r.clone();
                        reference = Some(r);
                        report.spilled_to = Some(spill_path.to_string());
                        Self::send(bus, executor, channel, &envelope).await?;
                    }
                    other => other?,
                }
                report.published += 1;
            }
        }

        Ok(report)
    }

    async fn send(
        bus: &dyn MessageBus,
        executor: &RobustExecutor,
        channel: &str,
        envelope: &TaskEnvelope,
    ) -> Result<(), PipelineError> {
        let bytes = envelope.to_bytes()?;
        executor
            .execute("publish", || bus.publish(channel, &envelope.task_id, bytes.clone()))
            .await?;
        Ok(())
    }
}
