//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow instances and their node
//! chains. The infrastructure layer (autoflow-infra) implements this trait
//! with SQLite persistence.

use autoflow_types::error::RepositoryError;
use autoflow_types::queue::JobHandle;
use autoflow_types::workflow::{NodeError, NodeInstance, WorkflowInstance};
use uuid::Uuid;

/// Result of trying to occupy a chain slot.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The node was inserted (and linked to its parent, for successors).
    Created(NodeInstance),
    /// The slot was already filled; carries the node occupying it.
    Existing(NodeInstance),
}

impl ClaimOutcome {
    pub fn node(&self) -> &NodeInstance {
        match self {
            ClaimOutcome::Created(node) | ClaimOutcome::Existing(node) => node,
        }
    }

    pub fn into_node(self) -> NodeInstance {
        match self {
            ClaimOutcome::Created(node) | ClaimOutcome::Existing(node) => node,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, ClaimOutcome::Created(_))
    }
}

/// Repository trait for workflow persistence.
///
/// Covers two entity families:
/// - **Instances:** create and query workflow instances (immutable once created).
/// - **Nodes:** the singly linked chain of node instances per workflow.
///
/// Every write that moves a chain forward is conditional, so any number of
/// schedulers may call these methods concurrently.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Persist a workflow instance.
    ///
    /// If the instance carries a reservation token that is already taken,
    /// nothing is written and the existing instance is returned.
    fn create_workflow(
        &self,
        workflow: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<WorkflowInstance, RepositoryError>> + Send;

    /// Get a workflow instance by id.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Instances created by fork nodes of `parent_id`, oldest first.
    fn list_children(
        &self,
        parent_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Instances that have no node yet, oldest first.
    fn list_unstarted(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Insert the first node of a chain.
    ///
    /// Returns `Existing` if a node with the same reservation already exists.
    fn create_root_node(
        &self,
        node: &NodeInstance,
    ) -> impl std::future::Future<Output = Result<ClaimOutcome, RepositoryError>> + Send;

    /// Atomically create `child` as the successor of `parent_id`.
    ///
    /// In one transaction: if a node holding `child.reservation` exists, link
    /// it to the parent if the parent is still unlinked and return it as
    /// `Existing`; otherwise set the parent's successor only if it is unset,
    /// and insert the child. When another writer advanced the parent first,
    /// nothing is written and the winner is returned as `Existing`.
    fn claim_and_advance(
        &self,
        parent_id: &Uuid,
        child: &NodeInstance,
    ) -> impl std::future::Future<Output = Result<ClaimOutcome, RepositoryError>> + Send;

    /// Record the dispatched job on a node. No-op (returns `false`) if a job
    /// is already attached.
    fn attach_job(
        &self,
        node_id: &Uuid,
        job: &JobHandle,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Record the node's selection and, if given, its job output. No-op if a
    /// selection is already recorded.
    fn record_outcome(
        &self,
        node_id: &Uuid,
        selection: &str,
        output: Option<&serde_json::Value>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record failure details on a node. No-op if an error is already recorded.
    fn record_failure(
        &self,
        node_id: &Uuid,
        error: &NodeError,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark the chain unresolvable at this node.
    fn halt_node(
        &self,
        node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a node instance by id.
    fn get_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<NodeInstance>, RepositoryError>> + Send;

    /// All nodes of a workflow in chain order (root first).
    fn list_chain(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInstance>, RepositoryError>> + Send;

    /// Frontier nodes the scheduler still has work for: unlinked, not halted,
    /// and not a terminal node with a recorded selection. Oldest first.
    fn list_frontier_candidates(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInstance>, RepositoryError>> + Send;
}

/// Order nodes of one workflow by following the chain links from the root.
///
/// Nodes that are not reachable from the root (which only a corrupted store
/// can produce) are appended in creation order.
pub fn order_chain(mut nodes: Vec<NodeInstance>) -> Vec<NodeInstance> {
    if nodes.len() < 2 {
        return nodes;
    }
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let mut ordered = Vec::with_capacity(nodes.len());
    let mut next = nodes
        .iter()
        .position(|n| n.parent_node_id.is_none())
        .map(|i| nodes.remove(i));
    while let Some(node) = next {
        next = node
            .child_node_id
            .and_then(|child| nodes.iter().position(|n| n.id == child))
            .map(|i| nodes.remove(i));
        ordered.push(node);
    }
    ordered.extend(nodes);
    ordered
}
