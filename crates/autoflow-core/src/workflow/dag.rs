//! Static checks over a definition's transition graph.
//!
//! Uses `petgraph` to model transitions as a directed graph. Topological sort
//! detects cycles (a chain may never revisit a node), and a DFS from the
//! start node finds nodes no execution can reach.

use std::collections::HashMap;

use autoflow_types::workflow::NodeDefinition;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use super::definition::WorkflowError;

/// Build the transition graph. Edges whose target is unknown are reported as
/// [`WorkflowError::UnknownTarget`].
fn build_graph(
    nodes: &[NodeDefinition],
) -> Result<(DiGraph<&str, &str>, HashMap<&str, NodeIndex>), WorkflowError> {
    let mut graph = DiGraph::<&str, &str>::new();
    let indices: HashMap<&str, NodeIndex> = nodes
        .iter()
        .map(|n| (n.id.as_str(), graph.add_node(n.id.as_str())))
        .collect();

    for node in nodes {
        let from = indices[node.id.as_str()];
        for (tag, target) in &node.transitions {
            let to = indices.get(target.as_str()).ok_or_else(|| {
                WorkflowError::UnknownTarget(format!(
                    "node '{}' transition '{}' points to unknown node '{}'",
                    node.id, tag, target
                ))
            })?;
            graph.add_edge(from, *to, tag.as_str());
        }
    }

    Ok((graph, indices))
}

/// Reject transition graphs containing a cycle.
pub fn validate_transition_graph(nodes: &[NodeDefinition]) -> Result<(), WorkflowError> {
    let (graph, _) = build_graph(nodes)?;

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving node '{node_id}'"))
    })?;

    Ok(())
}

/// Node ids not reachable from `start`, in declaration order.
///
/// Returns an empty list when the graph cannot be built or `start` is unknown;
/// those cases are reported by validation.
pub fn unreachable_nodes<'a>(nodes: &'a [NodeDefinition], start: &str) -> Vec<&'a str> {
    let Ok((graph, indices)) = build_graph(nodes) else {
        return Vec::new();
    };
    let Some(&start_idx) = indices.get(start) else {
        return Vec::new();
    };

    let mut reachable = vec![false; graph.node_count()];
    let mut dfs = Dfs::new(&graph, start_idx);
    while let Some(idx) = dfs.next(&graph) {
        reachable[idx.index()] = true;
    }

    nodes
        .iter()
        .filter(|n| !reachable[indices[n.id.as_str()].index()])
        .map(|n| n.id.as_str())
        .collect()
}
