//! Transition scheduler: the sweep that moves chains forward.
//!
//! Each sweep:
//!
//! 1. Creates the first node of workflows that have none yet.
//! 2. Loads frontier candidates and processes them concurrently, each in its
//!    own task so one node's failure never aborts the sweep:
//!    - selection already recorded -> advance
//!    - failure already recorded -> failure path
//!    - no job attached -> dispatch it
//!    - job pending/running -> wait
//!    - job finished -> record selection and output, advance (or complete)
//!    - job failed -> record the error, failure path
//! 3. Failure path: follow the node's `error` transition if it declares one,
//!    otherwise halt the chain.
//!
//! Any number of schedulers may sweep the same store; the repository's
//! conditional writes make every step safe to race.

use std::sync::Arc;

use autoflow_types::config::SchedulerConfig;
use autoflow_types::queue::{JobResult, JobStatus};
use autoflow_types::workflow::{
    ERROR_SELECTION, NodeError, NodeErrorKind, NodeInstance, WorkflowInstance,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::queue::TaskQueue;
use crate::repository::subject::SubjectLookup;
use crate::repository::workflow::{ClaimOutcome, WorkflowRepository};

use super::definition::WorkflowGraph;
use super::engine::{EngineError, WorkflowEngine};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What processing one frontier node did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeProgress {
    /// Job still pending or running.
    Waiting,
    /// An undispatched node's job was enqueued.
    Dispatched,
    /// The successor node was created.
    Advanced,
    /// Another scheduler created the successor first.
    LostRace,
    /// A terminal node's job finished; the workflow is complete.
    Completed,
    /// The chain was marked unresolvable.
    Halted,
}

/// Counters for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub bootstrapped: usize,
    pub examined: usize,
    pub waiting: usize,
    pub dispatched: usize,
    pub advanced: usize,
    pub lost_races: usize,
    pub completed: usize,
    pub halted: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, progress: NodeProgress) {
        match progress {
            NodeProgress::Waiting => self.waiting += 1,
            NodeProgress::Dispatched => self.dispatched += 1,
            NodeProgress::Advanced => self.advanced += 1,
            NodeProgress::LostRace => self.lost_races += 1,
            NodeProgress::Completed => self.completed += 1,
            NodeProgress::Halted => self.halted += 1,
        }
    }

    /// Whether the sweep changed anything.
    pub fn made_progress(&self) -> bool {
        self.bootstrapped + self.dispatched + self.advanced + self.completed + self.halted > 0
    }
}

// ---------------------------------------------------------------------------
// TransitionScheduler
// ---------------------------------------------------------------------------

pub struct TransitionScheduler<R, Q, L> {
    engine: Arc<WorkflowEngine<R, Q, L>>,
    config: SchedulerConfig,
}

impl<R, Q, L> Clone for TransitionScheduler<R, Q, L> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
        }
    }
}

impl<R, Q, L> TransitionScheduler<R, Q, L>
where
    R: WorkflowRepository + 'static,
    Q: TaskQueue + 'static,
    L: SubjectLookup + 'static,
{
    pub fn new(engine: Arc<WorkflowEngine<R, Q, L>>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine<R, Q, L>> {
        &self.engine
    }

    /// Sweep until cancelled. Errors are logged; the loop never exits on them.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "transition scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("transition scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.made_progress() || report.errors > 0 => {
                            tracing::info!(?report, "sweep finished");
                        }
                        Ok(report) => tracing::trace!(?report, "sweep idle"),
                        Err(e) => tracing::error!(error = %e, "sweep failed"),
                    }
                }
            }
        }
    }

    /// Run one sweep over unstarted workflows and frontier candidates.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        let repo = self.engine.repository();

        for workflow in repo.list_unstarted(self.config.batch_size).await? {
            match self.bootstrap(&workflow).await {
                Ok(true) => report.bootstrapped += 1,
                Ok(false) => report.lost_races += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        workflow_id = %workflow.id,
                        definition = %workflow.definition_id,
                        error = %e,
                        "failed to start workflow"
                    );
                }
            }
        }

        let candidates = repo.list_frontier_candidates(self.config.batch_size).await?;
        report.examined = candidates.len();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_advances.max(1)));
        let mut tasks = JoinSet::new();
        for node in candidates {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let (node_id, workflow_id) = (node.id, node.workflow_id);
                (node_id, workflow_id, this.process(node).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, _, Ok(progress))) => report.record(progress),
                Ok((node_id, workflow_id, Err(e))) => {
                    report.errors += 1;
                    tracing::warn!(
                        %workflow_id,
                        node_instance_id = %node_id,
                        error = %e,
                        "failed to process frontier node, retrying next sweep"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "frontier node task panicked");
                }
            }
        }

        tracing::debug!(?report, "sweep complete");
        Ok(report)
    }

    async fn bootstrap(&self, workflow: &WorkflowInstance) -> Result<bool, EngineError> {
        let graph = self.engine.definition(&workflow.definition_id)?;
        Ok(self.engine.bootstrap(workflow, &graph).await?.is_created())
    }

    /// Decide and perform the next step for one frontier node.
    async fn process(&self, node: NodeInstance) -> Result<NodeProgress, EngineError> {
        let workflow = self.engine.workflow(node.workflow_id).await?;
        let Some(graph) = self.engine.definitions().get(&workflow.definition_id) else {
            let message = format!("definition '{}' is not loaded", workflow.definition_id);
            return self.inconsistent(&node, message).await;
        };

        if let Some(selection) = &node.selection {
            return self.advance(&workflow, &graph, &node, selection).await;
        }
        if node.error_details.is_some() {
            return self.fail(&workflow, &graph, &node).await;
        }
        let Some(handle) = node.job else {
            return self.redispatch(&graph, &node).await;
        };

        let queue = self.engine.queue();
        let repo = self.engine.repository();
        match queue.status(&handle).await? {
            JobStatus::Pending | JobStatus::Running => Ok(NodeProgress::Waiting),
            JobStatus::Finished => {
                let result = queue
                    .result(&handle)
                    .await?
                    .unwrap_or_else(|| JobResult::new(serde_json::Value::Null));
                repo.record_outcome(&node.id, &result.selection, Some(&result.data))
                    .await?;

                if node.terminal {
                    tracing::info!(
                        workflow_id = %workflow.id,
                        definition = %workflow.definition_id,
                        node = %node.node_id,
                        "workflow complete"
                    );
                    return Ok(NodeProgress::Completed);
                }
                self.advance(&workflow, &graph, &node, &result.selection).await
            }
            JobStatus::Failed => {
                let message = queue
                    .failure(&handle)
                    .await?
                    .unwrap_or_else(|| "job failed".to_string());
                tracing::warn!(
                    workflow_id = %workflow.id,
                    node = %node.node_id,
                    job_id = %handle,
                    error = %message,
                    "node job failed"
                );
                repo.record_failure(&node.id, &NodeError::new(NodeErrorKind::JobFailure, message))
                    .await?;
                self.fail(&workflow, &graph, &node).await
            }
        }
    }

    /// Create the successor chosen by `selection`.
    async fn advance(
        &self,
        workflow: &WorkflowInstance,
        graph: &WorkflowGraph,
        node: &NodeInstance,
        selection: &str,
    ) -> Result<NodeProgress, EngineError> {
        if node.terminal {
            return Ok(NodeProgress::Completed);
        }

        let Some(def) = graph.node(&node.node_id) else {
            let message = format!(
                "node '{}' is not declared in definition '{}'",
                node.node_id,
                graph.id()
            );
            return self.inconsistent(node, message).await;
        };
        let Some(next) = def.next_for(selection) else {
            let message = format!(
                "non-terminal node '{}' has no transition for '{}' and no default",
                node.node_id, selection
            );
            return self.inconsistent(node, message).await;
        };

        let chain = self.engine.repository().list_chain(&workflow.id).await?;
        match self
            .engine
            .spawn_node(workflow, graph, next, Some(node), &chain)
            .await?
        {
            ClaimOutcome::Created(child) => {
                tracing::debug!(
                    workflow_id = %workflow.id,
                    from = %node.node_id,
                    to = %child.node_id,
                    selection,
                    "advanced"
                );
                Ok(NodeProgress::Advanced)
            }
            ClaimOutcome::Existing(_) => Ok(NodeProgress::LostRace),
        }
    }

    /// Follow the `error` transition, or halt the chain.
    async fn fail(
        &self,
        workflow: &WorkflowInstance,
        graph: &WorkflowGraph,
        node: &NodeInstance,
    ) -> Result<NodeProgress, EngineError> {
        let recovers = !node.terminal
            && graph
                .node(&node.node_id)
                .is_some_and(|def| def.declares(ERROR_SELECTION));

        if recovers {
            self.engine
                .repository()
                .record_outcome(&node.id, ERROR_SELECTION, None)
                .await?;
            return self.advance(workflow, graph, node, ERROR_SELECTION).await;
        }

        self.engine.repository().halt_node(&node.id).await?;
        tracing::warn!(
            workflow_id = %workflow.id,
            definition = %workflow.definition_id,
            node = %node.node_id,
            "workflow failed"
        );
        Ok(NodeProgress::Halted)
    }

    /// Dispatch a frontier node whose job was never enqueued.
    async fn redispatch(
        &self,
        graph: &WorkflowGraph,
        node: &NodeInstance,
    ) -> Result<NodeProgress, EngineError> {
        let Some(def) = graph.node(&node.node_id) else {
            let message = format!(
                "node '{}' is not declared in definition '{}'",
                node.node_id,
                graph.id()
            );
            return self.inconsistent(node, message).await;
        };
        self.engine.dispatch(node, def).await?;
        Ok(NodeProgress::Dispatched)
    }

    async fn inconsistent(
        &self,
        node: &NodeInstance,
        message: String,
    ) -> Result<NodeProgress, EngineError> {
        tracing::error!(
            workflow_id = %node.workflow_id,
            node = %node.node_id,
            node_instance_id = %node.id,
            %message,
            "definition inconsistency, halting chain"
        );
        let repo = self.engine.repository();
        repo.record_failure(
            &node.id,
            &NodeError::new(NodeErrorKind::DefinitionInconsistency, message),
        )
        .await?;
        repo.halt_node(&node.id).await?;
        Ok(NodeProgress::Halted)
    }
}
