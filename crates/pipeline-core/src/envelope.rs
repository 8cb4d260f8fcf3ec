//! Task envelopes and their wire codec

use crate::error::PlanError;
use crate::payload::Payload;
use crate::plan::{ExecutionPlan, NodeId};
use serde::{Deserialize, Serialize};
use video_pipeline_common::Port;

/// One task's position in its plan plus the data travelling with it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,

    /// Private copy of the task's plan
    pub plan: ExecutionPlan,

    /// Ports this envelope is addressed to
    pub destinations: Vec<Port>,

    pub payload: Payload,

    /// Free-form label threaded unchanged end to end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Hops that produced this envelope, as `node#result` joined by `.`.
    ///
    /// Empty for envelopes emitted by a planner. Distinguishes the many
    /// envelopes one task sends into the same node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lineage: String,
}

impl TaskEnvelope {
    /// Create an envelope addressed to `destinations`.
    ///
    /// Every destination must be declared by some node of `plan`.
    pub fn new(
        task_id: impl Into<String>,
        plan: ExecutionPlan,
        destinations: Vec<Port>,
        payload: Payload,
    ) -> Result<Self, PlanError> {
        for port in &destinations {
            plan.destination_node_id(port)?;
        }
        Ok(Self {
            task_id: task_id.into(),
            plan,
            destinations,
            payload,
            tag: None,
            lineage: String::new(),
        })
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Re-target the envelope at a single port
    pub fn change_current_node(&mut self, port: Port) -> Result<(), PlanError> {
        self.plan.destination_node_id(&port)?;
        self.destinations = vec![port];
        Ok(())
    }

    #[must_use]
    pub fn is_destined_to(&self, port: &Port) -> bool {
        self.destinations.contains(port)
    }

    /// Distinct channels this envelope must be published on
    #[must_use]
    pub fn channels(&self) -> Vec<&'static str> {
        let mut channels: Vec<&'static str> = self.destinations.iter().map(Port::channel).collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    /// Build one envelope per output edge of `node`, each carrying `payload`.
    ///
    /// The copies share this envelope's task id, tag and plan (including any
    /// executed flags already set on it).
    pub fn fan_out(
        &self,
        node: NodeId,
        result_index: usize,
        payload: &Payload,
    ) -> Result<Vec<TaskEnvelope>, PlanError> {
        let source = self.plan.node(node)?;
        let lineage = if self.lineage.is_empty() {
            format!("{}#{}", source.name, result_index)
        } else {
            format!("{}.{}#{}", self.lineage, source.name, result_index)
        };

        let mut copies = Vec::with_capacity(source.outputs.len());
        for edge in &source.outputs {
            let mut copy = TaskEnvelope {
                task_id: self.task_id.clone(),
                plan: self.plan.clone(),
                destinations: Vec::new(),
                payload: payload.clone(),
                tag: self.tag.clone(),
                lineage: lineage.clone(),
            };
            copy.change_current_node(edge.port.clone())?;
            copies.push(copy);
        }
        Ok(copies)
    }

    /// Encode for the bus
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the bus
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
