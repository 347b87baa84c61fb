//! Task queue types.
//!
//! The engine talks to the task queue only through handles: it enqueues a
//! [`JobRequest`], keeps the returned [`JobHandle`] on the node, and re-queries
//! the job's [`JobStatus`] on every sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::DEFAULT_SELECTION;

/// Opaque reference to a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub Uuid);

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a queued job as reported by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (including while waiting out a retry backoff).
    Pending,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Payload a job reports on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Outcome tag used to choose the next node.
    #[serde(default = "default_selection")]
    pub selection: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_selection() -> String {
    DEFAULT_SELECTION.to_string()
}

impl JobResult {
    /// Result with the `default` selection.
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            selection: default_selection(),
            data,
        }
    }

    pub fn with_selection(selection: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            selection: selection.into(),
            data,
        }
    }
}

/// The node instance a job was dispatched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOrigin {
    pub workflow_id: Uuid,
    pub node_instance_id: Uuid,
}

/// A job to enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Job binding name.
    pub binding: String,
    /// Resolved arguments.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Set for node jobs; the queue enqueues at most one job per origin node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<JobOrigin>,
}

/// Full persisted state of a queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub binding: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<JobOrigin>,
    pub status: JobStatus,
    /// Attempts started so far (incremented on claim).
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Earliest time the job may be claimed.
    pub run_after: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn handle(&self) -> JobHandle {
        JobHandle(self.id)
    }
}
