//! Fork/join coordinator.
//!
//! A fork is an ordinary job (binding [`FORK_JOB`]) whose handler creates one
//! child workflow per element of its `children` argument and then blocks until
//! every child is complete or failed. Children are created with reservation
//! tokens derived from the fork node, so a retried fork job re-attaches to the
//! children of the first attempt instead of creating new ones.
//!
//! The wait deadline runs from the fork node's creation, not from the current
//! attempt; a retried or requeued fork keeps the original deadline. Workers
//! run the fork as a coordinator job (no job slot, no job timeout), so this
//! deadline is the only bound on the wait.
//!
//! ```yaml
//! - id: encode_all
//!   job: fork
//!   args:
//!     workflow: encode_rendition
//!     children: "${determine_renditions.output.video}"
//!     item_key: rendition
//!     shared: { source: "${probe.input.path}" }
//!   transitions:
//!     default: generate_playlist
//!     partial_failure: generate_playlist
//! ```

use std::sync::Arc;
use std::time::Duration;

use autoflow_types::config::ForkConfig;
use chrono::{DateTime, Utc};
use autoflow_types::queue::JobResult;
use autoflow_types::workflow::{
    DEFAULT_SELECTION, PARTIAL_FAILURE_SELECTION, SubjectRef, WorkflowStatus,
};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::queue::TaskQueue;
use crate::queue::handler::{JobContext, JobError, JobHandler};
use crate::repository::subject::SubjectLookup;
use crate::repository::workflow::WorkflowRepository;

use super::engine::WorkflowEngine;

/// Job binding name of the fork coordinator.
pub const FORK_JOB: &str = "fork";

const DEFAULT_ITEM_KEY: &str = "item";

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Parsed fork arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkSpec {
    /// Child definition id.
    pub workflow: String,
    /// Args of each child, in order.
    pub children: Vec<Map<String, Value>>,
    /// Overrides the parent's subject.
    pub subject: Option<SubjectRef>,
    /// Overrides the configured wait bound.
    pub timeout: Option<Duration>,
}

impl ForkSpec {
    pub fn from_args(args: &Value) -> Result<Self, JobError> {
        let args = args
            .as_object()
            .ok_or_else(|| JobError::fatal("fork arguments must be an object"))?;

        let workflow = args
            .get("workflow")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| JobError::fatal("fork requires a 'workflow' definition id"))?
            .to_string();

        let items = args
            .get("children")
            .and_then(Value::as_array)
            .ok_or_else(|| JobError::fatal("fork requires a 'children' array"))?;

        let item_key = match args.get("item_key") {
            None | Some(Value::Null) => DEFAULT_ITEM_KEY,
            Some(Value::String(key)) if !key.is_empty() => key.as_str(),
            Some(_) => return Err(JobError::fatal("fork 'item_key' must be a non-empty string")),
        };

        let shared = match args.get("shared") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(JobError::fatal("fork 'shared' must be an object")),
        };

        let children = items
            .iter()
            .map(|item| {
                let mut child = shared.clone();
                match item {
                    Value::Object(fields) => {
                        child.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())))
                    }
                    other => {
                        child.insert(item_key.to_string(), other.clone());
                    }
                }
                child
            })
            .collect();

        let subject = match args.get("subject") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<SubjectRef>(value.clone())
                    .map_err(|e| JobError::fatal(format!("fork 'subject' is invalid: {e}")))?,
            ),
        };

        let timeout = match args.get("timeout_secs") {
            None | Some(Value::Null) => None,
            Some(value) => Some(Duration::from_secs(value.as_u64().ok_or_else(|| {
                JobError::fatal("fork 'timeout_secs' must be a non-negative integer")
            })?)),
        };

        Ok(Self {
            workflow,
            children,
            subject,
            timeout,
        })
    }
}

/// Wait left of `timeout` counted from `started_at`.
fn remaining_wait(started_at: DateTime<Utc>, timeout: Duration, now: DateTime<Utc>) -> Duration {
    let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
    timeout.saturating_sub(elapsed)
}

// ---------------------------------------------------------------------------
// ForkJob
// ---------------------------------------------------------------------------

/// Job handler that spawns child workflows and joins on them.
pub struct ForkJob<R, Q, L> {
    engine: Arc<WorkflowEngine<R, Q, L>>,
    config: ForkConfig,
}

impl<R, Q, L> ForkJob<R, Q, L> {
    pub fn new(engine: Arc<WorkflowEngine<R, Q, L>>, config: ForkConfig) -> Self {
        Self { engine, config }
    }
}

impl<R, Q, L> ForkJob<R, Q, L>
where
    R: WorkflowRepository,
    Q: TaskQueue,
    L: SubjectLookup,
{
    /// Poll children until all are terminal or `remaining` runs out.
    async fn join(
        &self,
        children: &[Uuid],
        timeout: Duration,
        remaining: Duration,
    ) -> Result<Vec<(Uuid, WorkflowStatus)>, JobError> {
        let deadline = tokio::time::Instant::now() + remaining;
        loop {
            let mut statuses = Vec::with_capacity(children.len());
            for &id in children {
                let status = self
                    .engine
                    .status(id)
                    .await
                    .map_err(|e| JobError::retryable(e.to_string()))?;
                statuses.push((id, status));
            }

            if statuses.iter().all(|(_, s)| s.is_terminal()) {
                return Ok(statuses);
            }

            if tokio::time::Instant::now() >= deadline {
                let unresolved: Vec<String> = statuses
                    .iter()
                    .filter(|(_, s)| !s.is_terminal())
                    .map(|(id, _)| id.to_string())
                    .collect();
                return Err(JobError::fatal(format!(
                    "fork timed out after {}s with {} of {} children unresolved: {}",
                    timeout.as_secs(),
                    unresolved.len(),
                    children.len(),
                    unresolved.join(", ")
                )));
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

impl<R, Q, L> JobHandler for ForkJob<R, Q, L>
where
    R: WorkflowRepository,
    Q: TaskQueue,
    L: SubjectLookup,
{
    async fn run(&self, ctx: JobContext) -> Result<JobResult, JobError> {
        let origin = ctx
            .origin
            .ok_or_else(|| JobError::fatal("fork job must be dispatched by a workflow node"))?;
        let spec = ForkSpec::from_args(&ctx.args)?;

        self.engine
            .definition(&spec.workflow)
            .map_err(|e| JobError::fatal(e.to_string()))?;

        let parent = self
            .engine
            .workflow(origin.workflow_id)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))?;
        let node = self
            .engine
            .repository()
            .get_node(&origin.node_instance_id)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))?
            .ok_or_else(|| {
                JobError::fatal(format!("node instance {} not found", origin.node_instance_id))
            })?;

        let declares_partial_failure = self
            .engine
            .definitions()
            .get(&parent.definition_id)
            .and_then(|graph| {
                graph
                    .node(&node.node_id)
                    .map(|def| def.declares(PARTIAL_FAILURE_SELECTION))
            })
            .unwrap_or(false);

        let subject = spec.subject.clone().or_else(|| parent.subject.clone());
        let mut children = Vec::with_capacity(spec.children.len());
        for (index, args) in spec.children.into_iter().enumerate() {
            let reservation = format!("{}:fork:{index}", origin.node_instance_id);
            let child = self
                .engine
                .start_child(&parent, &spec.workflow, subject.clone(), args, reservation)
                .await
                .map_err(|e| JobError::retryable(e.to_string()))?;
            children.push(child.id);
        }

        tracing::info!(
            workflow_id = %parent.id,
            node = %node.node_id,
            child_definition = %spec.workflow,
            children = children.len(),
            attempt = ctx.attempt,
            "fork waiting on children"
        );

        let timeout = spec.timeout.unwrap_or_else(|| self.config.timeout());
        let remaining = remaining_wait(node.created_at, timeout, Utc::now());
        let statuses = self.join(&children, timeout, remaining).await?;

        let failed = statuses
            .iter()
            .filter(|(_, s)| *s == WorkflowStatus::Failed)
            .count();
        let complete = statuses.len() - failed;
        let selection = if failed > 0 && declares_partial_failure {
            PARTIAL_FAILURE_SELECTION
        } else {
            DEFAULT_SELECTION
        };

        tracing::info!(
            workflow_id = %parent.id,
            node = %node.node_id,
            complete,
            failed,
            selection,
            "fork joined"
        );

        let children: Vec<Value> = statuses
            .iter()
            .map(|(id, status)| json!({ "workflow_id": id, "status": status }))
            .collect();
        Ok(JobResult::with_selection(
            selection,
            json!({ "children": children, "complete": complete, "failed": failed }),
        ))
    }
}
