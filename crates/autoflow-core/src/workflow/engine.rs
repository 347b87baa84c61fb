//! Workflow engine: the instance API and node creation.
//!
//! `WorkflowEngine` is the entry point callers use (`start`, `status`,
//! `result`, `wait_for`). It also owns the primitive the transition scheduler
//! and the fork coordinator build on: [`WorkflowEngine::spawn_node`], which
//! resolves a node's arguments, claims its chain slot, and dispatches its job.
//!
//! # Node creation
//!
//! 1. Fetch the subject's fields and build the resolution scope from the chain.
//! 2. Resolve the node's argument templates. A resolution failure is recorded
//!    on the node, which is created but never dispatched.
//! 3. Claim the slot (`create_root_node` / `claim_and_advance`). Losing the
//!    race is not an error; the winner's node is returned.
//! 4. Enqueue the job (idempotent per node) and attach its handle.
//!
//! A crash between 3 and 4 leaves an undispatched frontier node, which the
//! next sweep dispatches.

use std::sync::Arc;
use std::time::Duration;

use autoflow_types::error::{QueueError, RepositoryError};
use autoflow_types::queue::{JobHandle, JobOrigin, JobRequest};
use autoflow_types::workflow::{
    NodeData, NodeDefinition, NodeError, NodeErrorKind, NodeInstance, SubjectRef,
    WorkflowInstance, WorkflowResult, WorkflowStatus,
};
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::queue::TaskQueue;
use crate::repository::subject::{LookupError, SubjectLookup};
use crate::repository::workflow::{ClaimOutcome, WorkflowRepository};

use super::definition::WorkflowGraph;
use super::resolver::{ResolutionScope, resolve_args, subject_value};
use super::status::{derive_status, frontier, needs_job_status};
use super::store::DefinitionStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown workflow definition '{0}'")]
    UnknownDefinition(String),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("node instance {0} not found")]
    NodeNotFound(Uuid),

    #[error("node '{node_id}' is not declared in definition '{definition_id}'")]
    UnknownNode {
        definition_id: String,
        node_id: String,
    },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("subject lookup error: {0}")]
    Lookup(#[from] LookupError),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Instance API over a repository, a task queue and a subject lookup.
///
/// Generic over the storage ports; definitions are shared behind
/// `Arc<dyn DefinitionStore>` since the store is synchronous and read-only.
pub struct WorkflowEngine<R, Q, L> {
    repo: Arc<R>,
    queue: Arc<Q>,
    subjects: Arc<L>,
    definitions: Arc<dyn DefinitionStore>,
}

impl<R, Q, L> WorkflowEngine<R, Q, L>
where
    R: WorkflowRepository,
    Q: TaskQueue,
    L: SubjectLookup,
{
    pub fn new(
        repo: Arc<R>,
        queue: Arc<Q>,
        subjects: Arc<L>,
        definitions: Arc<dyn DefinitionStore>,
    ) -> Self {
        Self {
            repo,
            queue,
            subjects,
            definitions,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn definitions(&self) -> &dyn DefinitionStore {
        self.definitions.as_ref()
    }

    /// Look up a definition graph.
    pub fn definition(&self, definition_id: &str) -> Result<Arc<WorkflowGraph>, EngineError> {
        self.definitions
            .get(definition_id)
            .ok_or_else(|| EngineError::UnknownDefinition(definition_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Instance API
    // -----------------------------------------------------------------------

    /// Start a top-level workflow. Returns the new instance id.
    ///
    /// The first node is created and dispatched right away; if that fails the
    /// next sweep does it.
    pub async fn start(
        &self,
        definition_id: &str,
        subject: Option<SubjectRef>,
        args: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let workflow = WorkflowInstance::new(definition_id, subject, args);
        Ok(self.create(workflow).await?.id)
    }

    /// Start a child workflow for a fork node. Idempotent per `reservation`:
    /// a second call returns the instance created by the first.
    pub async fn start_child(
        &self,
        parent: &WorkflowInstance,
        definition_id: &str,
        subject: Option<SubjectRef>,
        args: Map<String, Value>,
        reservation: String,
    ) -> Result<WorkflowInstance, EngineError> {
        let mut workflow = WorkflowInstance::new(definition_id, subject, args);
        workflow.parent_workflow_id = Some(parent.id);
        workflow.reservation = Some(reservation);
        self.create(workflow).await
    }

    async fn create(&self, workflow: WorkflowInstance) -> Result<WorkflowInstance, EngineError> {
        let graph = self.definition(&workflow.definition_id)?;
        let stored = self.repo.create_workflow(&workflow).await?;

        if stored.id == workflow.id {
            tracing::info!(
                workflow_id = %stored.id,
                definition = %stored.definition_id,
                subject = ?stored.subject.as_ref().map(ToString::to_string),
                parent_workflow_id = ?stored.parent_workflow_id,
                "workflow started"
            );
        } else {
            tracing::debug!(
                workflow_id = %stored.id,
                reservation = ?stored.reservation,
                "workflow reservation already taken, reusing instance"
            );
        }

        if let Err(e) = self.bootstrap(&stored, &graph).await {
            tracing::warn!(
                workflow_id = %stored.id,
                error = %e,
                "failed to create first node, leaving it to the next sweep"
            );
        }
        Ok(stored)
    }

    /// Current derived status of a workflow.
    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, EngineError> {
        let chain = self.chain(workflow_id).await?;
        let front = frontier(&chain);

        let job_status = match front.filter(|n| needs_job_status(n)).and_then(|n| n.job) {
            Some(handle) => Some(self.queue.status(&handle).await?),
            None => None,
        };
        Ok(derive_status(front, job_status))
    }

    /// The terminal node's output once the workflow is complete.
    pub async fn result(&self, workflow_id: Uuid) -> Result<Option<WorkflowResult>, EngineError> {
        let chain = self.chain(workflow_id).await?;
        let Some(front) = frontier(&chain) else {
            return Ok(None);
        };

        if let Some(selection) = &front.selection {
            if front.terminal && !front.halted {
                return Ok(Some(WorkflowResult {
                    workflow_id,
                    node_id: front.node_id.clone(),
                    selection: selection.clone(),
                    output: front.data.output.clone().unwrap_or(Value::Null),
                }));
            }
            return Ok(None);
        }

        // Finished in the queue but not yet recorded by a sweep.
        let Some(handle) = front.job.filter(|_| needs_job_status(front)) else {
            return Ok(None);
        };
        Ok(self.queue.result(&handle).await?.map(|r| WorkflowResult {
            workflow_id,
            node_id: front.node_id.clone(),
            selection: r.selection,
            output: r.data,
        }))
    }

    /// Poll the derived status until it is terminal or `timeout` elapses.
    /// Returns the last observed status.
    pub async fn wait_for(
        &self,
        workflow_id: Uuid,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<WorkflowStatus, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(workflow_id).await?;
            let now = tokio::time::Instant::now();
            if status.is_terminal() || now >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Get a workflow instance.
    pub async fn workflow(&self, workflow_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.repo
            .get_workflow(&workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))
    }

    /// A workflow's nodes in chain order.
    pub async fn chain(&self, workflow_id: Uuid) -> Result<Vec<NodeInstance>, EngineError> {
        self.workflow(workflow_id).await?;
        Ok(self.repo.list_chain(&workflow_id).await?)
    }

    /// Child workflows created by the workflow's fork nodes.
    pub async fn children(&self, workflow_id: Uuid) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.repo.list_children(&workflow_id).await?)
    }

    // -----------------------------------------------------------------------
    // Node creation
    // -----------------------------------------------------------------------

    /// Create and dispatch the first node of a workflow. Idempotent.
    pub async fn bootstrap(
        &self,
        workflow: &WorkflowInstance,
        graph: &WorkflowGraph,
    ) -> Result<ClaimOutcome, EngineError> {
        let start = graph.start_node().id.clone();
        self.spawn_node(workflow, graph, &start, None, &[]).await
    }

    /// Create node `node_id` in `workflow`'s chain, as the successor of
    /// `parent` (or as the root), and dispatch its job.
    pub async fn spawn_node(
        &self,
        workflow: &WorkflowInstance,
        graph: &WorkflowGraph,
        node_id: &str,
        parent: Option<&NodeInstance>,
        chain: &[NodeInstance],
    ) -> Result<ClaimOutcome, EngineError> {
        let def = graph.node(node_id).ok_or_else(|| EngineError::UnknownNode {
            definition_id: graph.id().to_string(),
            node_id: node_id.to_string(),
        })?;

        let scope = self.resolution_scope(workflow, chain, graph).await?;
        let (input, error_details) = match resolve_args(&def.args, &scope) {
            Ok(args) => (Some(Value::Object(args)), None),
            Err(e) => {
                tracing::warn!(
                    workflow_id = %workflow.id,
                    node = %def.id,
                    error = %e,
                    "argument resolution failed, node will not be dispatched"
                );
                (None, Some(NodeError::new(NodeErrorKind::Resolution, e.to_string())))
            }
        };

        let now = Utc::now();
        let node = NodeInstance {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            node_id: def.id.clone(),
            parent_node_id: parent.map(|p| p.id),
            child_node_id: None,
            reservation: parent
                .map(NodeInstance::successor_reservation)
                .unwrap_or_else(|| workflow.root_reservation()),
            job: None,
            data: NodeData {
                input,
                output: None,
            },
            selection: None,
            error_details,
            terminal: def.end,
            halted: false,
            created_at: now,
            updated_at: now,
        };

        let outcome = match parent {
            Some(p) => self.repo.claim_and_advance(&p.id, &node).await?,
            None => self.repo.create_root_node(&node).await?,
        };

        match &outcome {
            ClaimOutcome::Created(created) => {
                tracing::debug!(
                    workflow_id = %workflow.id,
                    node = %created.node_id,
                    node_instance_id = %created.id,
                    parent = ?parent.map(|p| p.node_id.as_str()),
                    "node created"
                );
                if created.error_details.is_none() {
                    self.dispatch(created, def).await?;
                }
            }
            ClaimOutcome::Existing(existing) => {
                tracing::debug!(
                    workflow_id = %workflow.id,
                    node = %existing.node_id,
                    node_instance_id = %existing.id,
                    "slot already claimed"
                );
            }
        }
        Ok(outcome)
    }

    /// Enqueue a node's job and attach the handle to the node.
    pub async fn dispatch(
        &self,
        node: &NodeInstance,
        def: &NodeDefinition,
    ) -> Result<JobHandle, EngineError> {
        let request = JobRequest {
            binding: def.job.clone(),
            args: node
                .data
                .input
                .clone()
                .unwrap_or_else(|| Value::Object(Map::new())),
            origin: Some(JobOrigin {
                workflow_id: node.workflow_id,
                node_instance_id: node.id,
            }),
        };

        let handle = self.queue.enqueue(&request).await?;
        self.repo.attach_job(&node.id, &handle).await?;

        tracing::info!(
            workflow_id = %node.workflow_id,
            node = %node.node_id,
            job = %def.job,
            job_id = %handle,
            "node dispatched"
        );
        Ok(handle)
    }

    async fn resolution_scope(
        &self,
        workflow: &WorkflowInstance,
        chain: &[NodeInstance],
        graph: &WorkflowGraph,
    ) -> Result<ResolutionScope, EngineError> {
        let fields = match &workflow.subject {
            Some(subject) => self.subjects.fetch(subject).await?,
            None => None,
        };
        let subject = subject_value(workflow.subject.as_ref(), fields);
        Ok(ResolutionScope::for_chain(
            subject,
            workflow.args.clone(),
            chain,
            graph,
        ))
    }
}
