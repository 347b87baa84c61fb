//! Workflow status derivation.
//!
//! A workflow's status is never stored. It follows from the chain's frontier
//! node and, while the frontier is an unsettled terminal node, from the live
//! state of its job in the task queue.

use autoflow_types::queue::JobStatus;
use autoflow_types::workflow::{NodeInstance, WorkflowStatus};

/// The chain's frontier: the node without a successor.
///
/// Chains are expected to be in chain order (see `order_chain`); the last
/// unlinked node wins.
pub fn frontier(chain: &[NodeInstance]) -> Option<&NodeInstance> {
    chain.iter().rev().find(|n| n.is_frontier())
}

/// Whether deriving the status needs the frontier job's live queue state.
pub fn needs_job_status(frontier: &NodeInstance) -> bool {
    frontier.terminal
        && !frontier.halted
        && frontier.selection.is_none()
        && frontier.error_details.is_none()
        && frontier.job.is_some()
}

/// Derive a workflow's status from its frontier node.
///
/// `job_status` is the frontier job's queue state, consulted only when
/// [`needs_job_status`] holds.
pub fn derive_status(frontier: Option<&NodeInstance>, job_status: Option<JobStatus>) -> WorkflowStatus {
    let Some(node) = frontier else {
        return WorkflowStatus::Running;
    };

    if node.halted {
        return WorkflowStatus::Failed;
    }
    if !node.terminal {
        return WorkflowStatus::Running;
    }
    if node.error_details.is_some() {
        return WorkflowStatus::Failed;
    }
    if node.selection.is_some() {
        return WorkflowStatus::Complete;
    }

    match job_status {
        Some(JobStatus::Finished) => WorkflowStatus::Complete,
        Some(JobStatus::Failed) => WorkflowStatus::Failed,
        _ => WorkflowStatus::Running,
    }
}
