//! Execution plans: the per-task DAG of stage nodes
//!
//! Nodes live in a flat arena inside the plan and edges refer to them by
//! index, so a plan serializes as a plain node list and can be cloned into
//! every envelope of a task without shared ownership.

use crate::error::PlanError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use video_pipeline_common::{DataKind, Port};

/// Index of a node within its plan
pub type NodeId = usize;

/// Directed edge from a node to an input port of another node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub target: NodeId,
    pub port: Port,
}

/// One stage instance within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    /// Human readable name, also used to derive spill paths
    pub name: String,

    /// Kind of data this node's stage emits
    pub produced_kind: DataKind,

    /// Opaque parameter handed to the stage algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_param: Option<serde_json::Value>,

    /// Ports through which envelopes reach this node
    #[serde(default)]
    pub input_ports: Vec<Port>,

    /// Ordered outgoing edges
    #[serde(default)]
    pub outputs: Vec<Edge>,

    #[serde(default)]
    executed: bool,
}

impl Node {
    fn new(id: NodeId, name: String, produced_kind: DataKind, exec_param: Option<serde_json::Value>) -> Self {
        Self {
            id,
            name,
            produced_kind,
            exec_param,
            input_ports: Vec::new(),
            outputs: Vec::new(),
            executed: false,
        }
    }

    #[must_use]
    pub fn executed(&self) -> bool {
        self.executed
    }

    /// Record that this node has run.
    ///
    /// Returns `true` only for the call that flips the flag; the flag never
    /// resets.
    pub fn mark_executed(&mut self) -> bool {
        !std::mem::replace(&mut self.executed, true)
    }

    /// Whether envelopes stop at this node
    #[must_use]
    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty() || self.produced_kind.is_terminal()
    }

    #[must_use]
    pub fn accepts(&self, port: &Port) -> bool {
        self.input_ports.contains(port)
    }
}

/// DAG of stage nodes describing how one task travels through the workers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    nodes: Vec<Node>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with a generated name
    pub fn add_node(&mut self, kind: DataKind, exec_param: Option<serde_json::Value>) -> NodeId {
        let name = format!("node-{}", self.nodes.len());
        self.add_named_node(name, kind, exec_param)
    }

    /// Add a node with an explicit name
    pub fn add_named_node(
        &mut self,
        name: impl Into<String>,
        kind: DataKind,
        exec_param: Option<serde_json::Value>,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(id, name.into(), kind, exec_param));
        id
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, PlanError> {
        self.nodes.get(id).ok_or(PlanError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, PlanError> {
        self.nodes.get_mut(id).ok_or(PlanError::UnknownNode(id))
    }

    /// Look up a node by name
    #[must_use]
    pub fn node_named(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Bind `port` to `node` so envelopes sent to the port reach it.
    ///
    /// Binding the same port to the same node again is a no-op; binding it
    /// to a second node fails.
    pub fn create_input_port(&mut self, node: NodeId, port: Port) -> Result<Port, PlanError> {
        if let Some(owner) = self.nodes.iter().find(|n| n.accepts(&port)) {
            if owner.id == node {
                return Ok(port);
            }
            return Err(PlanError::PortAlreadyBound {
                port,
                node: owner.id,
            });
        }

        self.node_mut(node)?.input_ports.push(port.clone());
        Ok(port)
    }

    /// Record an edge from `from` to whichever node owns `port`.
    ///
    /// Acyclicity is the caller's responsibility; see [`ExecutionPlan::validate`].
    pub fn output_to(&mut self, from: NodeId, port: Port) -> Result<(), PlanError> {
        let target = self.destination_node_id(&port)?;
        let node = self.node_mut(from)?;
        let edge = Edge { target, port };
        if !node.outputs.contains(&edge) {
            node.outputs.push(edge);
        }
        Ok(())
    }

    /// Id of the node that declared `port`
    pub fn destination_node_id(&self, port: &Port) -> Result<NodeId, PlanError> {
        self.nodes
            .iter()
            .find(|n| n.accepts(port))
            .map(|n| n.id)
            .ok_or_else(|| PlanError::PortUnbound(port.clone()))
    }

    /// Node that declared `port`
    pub fn destination_node(&self, port: &Port) -> Result<&Node, PlanError> {
        let id = self.destination_node_id(port)?;
        self.node(id)
    }

    /// Mark a node executed, returning whether this call flipped the flag
    pub fn mark_executed(&mut self, id: NodeId) -> Result<bool, PlanError> {
        Ok(self.node_mut(id)?.mark_executed())
    }

    /// Check edge targets and reject cycles.
    ///
    /// Planners call this once before emitting the first envelope; workers
    /// never do.
    pub fn validate(&self) -> Result<(), PlanError> {
        for node in &self.nodes {
            for edge in &node.outputs {
                let target = self.node(edge.target)?;
                if !target.accepts(&edge.port) {
                    return Err(PlanError::PortUnbound(edge.port.clone()));
                }
            }
        }

        let mut visited = HashSet::with_capacity(self.nodes.len());
        let mut recursion_stack = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if self.has_cycle(node.id, &mut visited, &mut recursion_stack) {
                return Err(PlanError::Cycle(node.id));
            }
        }

        Ok(())
    }

    fn has_cycle(
        &self,
        id: NodeId,
        visited: &mut HashSet<NodeId>,
        recursion_stack: &mut HashSet<NodeId>,
    ) -> bool {
        if recursion_stack.contains(&id) {
            return true;
        }
        if !visited.insert(id) {
            return false;
        }

        recursion_stack.insert(id);
        let cyclic = self.nodes[id]
            .outputs
            .iter()
            .any(|edge| self.has_cycle(edge.target, visited, recursion_stack));
        recursion_stack.remove(&id);
        cyclic
    }
}
