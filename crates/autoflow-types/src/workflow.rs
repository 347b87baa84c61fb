//! Workflow domain types for Autoflow.
//!
//! Two families of types live here:
//!
//! - The declarative definition document (`DefinitionDocument`,
//!   `NodeDefinition`) loaded from YAML and validated by `autoflow-core`.
//! - The persisted execution records (`WorkflowInstance`, `NodeInstance`)
//!   written by the transition scheduler. A workflow's status is never stored;
//!   it is derived from its node chain and the task queue (`WorkflowStatus`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::JobHandle;

/// Outcome tag every job reports unless it chooses another one.
pub const DEFAULT_SELECTION: &str = "default";

/// Transition followed when a node's job fails.
pub const ERROR_SELECTION: &str = "error";

/// Transition a fork node follows when some of its children failed.
pub const PARTIAL_FAILURE_SELECTION: &str = "partial_failure";

/// Reference sources reserved by the argument resolver; node ids may not use them.
pub const RESERVED_SOURCES: &[&str] = &["subject", "args"];

// ---------------------------------------------------------------------------
// Definition document
// ---------------------------------------------------------------------------

/// A workflow definition as written in a YAML document.
///
/// ```yaml
/// id: transcode_episode
/// nodes:
///   - id: probe
///     job: ffprobe
///     args: { path: "${subject.path}" }
///     transitions: { default: determine_renditions }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionDocument {
    /// Definition key referenced by workflow instances.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Node the chain starts at. Defaults to the first node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    pub nodes: Vec<NodeDefinition>,
}

/// One node of a definition graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node key, unique within the definition.
    pub id: String,
    /// Job binding name looked up in the job registry.
    pub job: String,
    /// Argument templates; strings may contain `${source.path}` references.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, serde_json::Value>,
    /// Outcome tag -> next node id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transitions: BTreeMap<String, String>,
    /// Terminal node: the workflow completes when its job finishes.
    #[serde(default)]
    pub end: bool,
}

impl NodeDefinition {
    /// Next node for a selection, falling back to the `default` transition.
    pub fn next_for(&self, selection: &str) -> Option<&str> {
        self.transitions
            .get(selection)
            .or_else(|| self.transitions.get(DEFAULT_SELECTION))
            .map(String::as_str)
    }

    /// Whether an outcome tag is explicitly declared (no default fallback).
    pub fn declares(&self, selection: &str) -> bool {
        self.transitions.contains_key(selection)
    }
}

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// Typed reference to a domain entity a workflow runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub kind: String,
    pub id: String,
}

impl SubjectRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl std::str::FromStr for SubjectRef {
    type Err = String;

    /// Parses `kind:id`. The id may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(Self::new(kind, id)),
            _ => Err(format!("invalid subject '{s}', expected 'kind:id'")),
        }
    }
}

/// One execution of a workflow definition.
///
/// Immutable once created. Status is derived, see [`WorkflowStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID.
    pub id: Uuid,
    /// Key into the definition store.
    pub definition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectRef>,
    /// Input parameters, in declaration order.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    /// Workflow whose fork node created this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_workflow_id: Option<Uuid>,
    /// Idempotency token; creating a second instance with the same token
    /// returns the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// A new top-level instance with a fresh id.
    pub fn new(
        definition_id: impl Into<String>,
        subject: Option<SubjectRef>,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id: definition_id.into(),
            subject,
            args,
            parent_workflow_id: None,
            reservation: None,
            created_at: Utc::now(),
        }
    }

    /// Reservation token of the chain's first node.
    pub fn root_reservation(&self) -> String {
        format!("{}:root", self.id)
    }
}

/// Derived status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Complete,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Complete => "complete",
            WorkflowStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final outcome of a completed workflow: its terminal node's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    /// Definition node id of the terminal node.
    pub node_id: String,
    pub selection: String,
    #[serde(default)]
    pub output: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Node Instance
// ---------------------------------------------------------------------------

/// Job input and output of a node, namespaced separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Why a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    /// Argument resolution failed; no job was dispatched.
    Resolution,
    /// The node's job ended in the failed state.
    JobFailure,
    /// The definition has no transition for a non-terminal node.
    DefinitionInconsistency,
}

/// Failure details recorded on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One step executed within a workflow instance's chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    /// UUIDv7 node instance ID.
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Definition node key.
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<Uuid>,
    /// Successor link. `None` marks the chain's frontier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_node_id: Option<Uuid>,
    /// Unique token for the chain slot this node fills.
    pub reservation: String,
    /// Task queue job, once dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobHandle>,
    #[serde(default)]
    pub data: NodeData,
    /// Outcome tag the node resolved with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<NodeError>,
    /// Copied from the definition's `end` flag.
    pub terminal: bool,
    /// The chain was marked unresolvable at this node.
    #[serde(default)]
    pub halted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeInstance {
    pub fn is_frontier(&self) -> bool {
        self.child_node_id.is_none()
    }

    /// Reservation token for this node's successor slot.
    pub fn successor_reservation(&self) -> String {
        format!("{}:next", self.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
