//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts YAML documents into a validated [`WorkflowGraph`], checks
//! structural constraints (unique ids, known transition targets, a `default`
//! transition on every non-terminal node, no cycles), and discovers definition
//! files on disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use autoflow_types::workflow::{
    DEFAULT_SELECTION, DefinitionDocument, NodeDefinition, RESERVED_SOURCES,
};
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading workflow definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Transition graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A transition points at a node that does not exist.
    #[error("unknown transition target: {0}")]
    UnknownTarget(String),

    /// Two files declare the same definition id.
    #[error("duplicate definition '{id}' in {path}")]
    DuplicateDefinition { id: String, path: PathBuf },
}

// ---------------------------------------------------------------------------
// Validated graph
// ---------------------------------------------------------------------------

/// A definition document that passed validation.
///
/// Immutable; the store hands out shared `Arc<WorkflowGraph>` references.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    document: DefinitionDocument,
    index: HashMap<String, usize>,
    start: String,
}

impl WorkflowGraph {
    /// Validate a document and build the graph.
    pub fn from_document(document: DefinitionDocument) -> Result<Self, WorkflowError> {
        validate_definition(&document)?;

        let index = document
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();
        let start = document
            .start
            .clone()
            .unwrap_or_else(|| document.nodes[0].id.clone());

        let unreachable = dag::unreachable_nodes(&document.nodes, &start);
        if !unreachable.is_empty() {
            tracing::warn!(
                definition = %document.id,
                nodes = ?unreachable,
                "definition declares nodes that are unreachable from the start node"
            );
        }

        Ok(Self {
            document,
            index,
            start,
        })
    }

    pub fn id(&self) -> &str {
        &self.document.id
    }

    pub fn description(&self) -> Option<&str> {
        self.document.description.as_deref()
    }

    /// Node the chain starts at.
    pub fn start_node(&self) -> &NodeDefinition {
        &self.document.nodes[self.index[&self.start]]
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.index.get(node_id).map(|&i| &self.document.nodes[i])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.document.nodes
    }

    /// Distinct job bindings referenced by the definition.
    pub fn job_bindings(&self) -> Vec<&str> {
        let mut bindings: Vec<&str> = self.document.nodes.iter().map(|n| n.job.as_str()).collect();
        bindings.sort_unstable();
        bindings.dedup();
        bindings
    }

    pub fn document(&self) -> &DefinitionDocument {
        &self.document
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated [`WorkflowGraph`].
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowGraph, WorkflowError> {
    let document: DefinitionDocument =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    WorkflowGraph::from_document(document)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate structural constraints on a definition document.
///
/// Checks:
/// - Id is non-empty and contains only alphanumerics, `_` and `-`
/// - At least one node exists
/// - Node ids are unique identifiers and do not shadow resolver sources
/// - Every node names a job
/// - `start` (if set) names an existing node
/// - Transition targets exist
/// - Non-terminal nodes declare a `default` transition
/// - Terminal nodes declare no transitions
/// - The transition graph is acyclic
pub fn validate_definition(def: &DefinitionDocument) -> Result<(), WorkflowError> {
    if !is_identifier(&def.id) {
        return Err(WorkflowError::ValidationError(format!(
            "definition id '{}' must be non-empty and contain only alphanumerics, '_' and '-'",
            def.id
        )));
    }

    if def.nodes.is_empty() {
        return Err(WorkflowError::ValidationError(format!(
            "definition '{}' must have at least one node",
            def.id
        )));
    }

    let mut seen_ids = HashSet::new();
    for node in &def.nodes {
        if !is_identifier(&node.id) {
            return Err(WorkflowError::ValidationError(format!(
                "node id '{}' must be non-empty and contain only alphanumerics, '_' and '-'",
                node.id
            )));
        }
        if RESERVED_SOURCES.contains(&node.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "node id '{}' is reserved",
                node.id
            )));
        }
        if !seen_ids.insert(node.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate node id: '{}'",
                node.id
            )));
        }
        if node.job.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "node '{}' has no job binding",
                node.id
            )));
        }
    }

    if let Some(start) = &def.start {
        if !seen_ids.contains(start.as_str()) {
            return Err(WorkflowError::UnknownTarget(format!(
                "start node '{start}' does not exist"
            )));
        }
    }

    for node in &def.nodes {
        for (tag, target) in &node.transitions {
            if !seen_ids.contains(target.as_str()) {
                return Err(WorkflowError::UnknownTarget(format!(
                    "node '{}' transition '{}' points to unknown node '{}'",
                    node.id, tag, target
                )));
            }
        }

        if node.end {
            if !node.transitions.is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "terminal node '{}' must not declare transitions",
                    node.id
                )));
            }
        } else if !node.transitions.contains_key(DEFAULT_SELECTION) {
            return Err(WorkflowError::ValidationError(format!(
                "node '{}' is not terminal and has no '{}' transition",
                node.id, DEFAULT_SELECTION
            )));
        }
    }

    dag::validate_transition_graph(&def.nodes)
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowGraph, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

/// Load every definition under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Any invalid file or
/// duplicate id fails the whole load.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowGraph)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;

    let mut ids = HashSet::new();
    for (path, graph) in &results {
        if !ids.insert(graph.id()) {
            return Err(WorkflowError::DuplicateDefinition {
                id: graph.id().to_string(),
                path: path.clone(),
            });
        }
    }
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowGraph)>,
) -> Result<(), WorkflowError> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                let graph = load_definition_file(&path).map_err(|e| match e {
                    WorkflowError::IoError(io) => WorkflowError::IoError(io),
                    other => WorkflowError::ValidationError(format!(
                        "{}: {other}",
                        path.display()
                    )),
                })?;
                results.push((path, graph));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCODE: &str = r#"
id: transcode_episode
description: Probe, plan renditions, write the master playlist
nodes:
  - id: probe
    job: ffprobe
    args:
      path: "${subject.path}"
    transitions:
      default: determine_renditions
  - id: determine_renditions
    job: determine_renditions
    args:
      ffprobe_output: "${probe.output}"
    transitions:
      default: generate_playlist
      error: cleanup
  - id: generate_playlist
    job: generate_master_playlist
    end: true
  - id: cleanup
    job: cleanup
    end: true
"#;

    #[test]
    fn test_parse_valid_definition() {
        let graph = parse_definition_yaml(TRANSCODE).unwrap();
        assert_eq!(graph.id(), "transcode_episode");
        assert_eq!(graph.start_node().id, "probe");
        assert_eq!(graph.nodes().len(), 4);
        assert!(graph.node("generate_playlist").unwrap().end);
        assert_eq!(
            graph.node("determine_renditions").unwrap().next_for("error"),
            Some("cleanup")
        );
        assert_eq!(
            graph.job_bindings(),
            vec!["cleanup", "determine_renditions", "ffprobe", "generate_master_playlist"]
        );
    }

    #[test]
    fn test_explicit_start_node() {
        let yaml = r#"
id: wf
start: b
nodes:
  - id: a
    job: x
    end: true
  - id: b
    job: y
    transitions: { default: a }
"#;
        let graph = parse_definition_yaml(yaml).unwrap();
        assert_eq!(graph.start_node().id, "b");
    }

    #[test]
    fn test_rejects_unknown_start() {
        let yaml = r#"
id: wf
start: missing
nodes:
  - { id: a, job: x, end: true }
"#;
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownTarget(_)));
    }

    #[test]
    fn test_rejects_unknown_transition_target() {
        let yaml = r#"
id: wf
nodes:
  - id: a
    job: x
    transitions: { default: nowhere }
"#;
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownTarget(_)));
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_rejects_non_terminal_without_default() {
        let yaml = r#"
id: wf
nodes:
  - id: a
    job: x
    transitions: { error: b }
  - { id: b, job: y, end: true }
"#;
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("no 'default' transition"));
    }

    #[test]
    fn test_rejects_terminal_with_transitions() {
        let yaml = r#"
id: wf
nodes:
  - id: a
    job: x
    end: true
    transitions: { default: b }
  - { id: b, job: y, end: true }
"#;
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("must not declare transitions"));
    }

    #[test]
    fn test_rejects_cycle() {
        let yaml = r#"
id: wf
nodes:
  - id: a
    job: x
    transitions: { default: b }
  - id: b
    job: y
    transitions: { default: c, retry: a }
  - { id: c, job: z, end: true }
"#;
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn test_rejects_duplicate_and_reserved_ids() {
        let dup = r#"
id: wf
nodes:
  - { id: a, job: x, end: true }
  - { id: a, job: y, end: true }
"#;
        assert!(parse_definition_yaml(dup)
            .unwrap_err()
            .to_string()
            .contains("duplicate node id"));

        let reserved = r#"
id: wf
nodes:
  - { id: subject, job: x, end: true }
"#;
        assert!(parse_definition_yaml(reserved)
            .unwrap_err()
            .to_string()
            .contains("reserved"));
    }

    #[test]
    fn test_rejects_invalid_definition_id_and_empty_nodes() {
        let bad_id = "id: \"my workflow\"\nnodes:\n  - { id: a, job: x, end: true }\n";
        assert!(matches!(
            parse_definition_yaml(bad_id).unwrap_err(),
            WorkflowError::ValidationError(_)
        ));

        let empty = "id: wf\nnodes: []\n";
        assert!(parse_definition_yaml(empty)
            .unwrap_err()
            .to_string()
            .contains("at least one node"));
    }

    #[test]
    fn test_rejects_missing_job() {
        let yaml = "id: wf\nnodes:\n  - { id: a, job: \"  \", end: true }\n";
        assert!(parse_definition_yaml(yaml)
            .unwrap_err()
            .to_string()
            .contains("no job binding"));
    }

    #[test]
    fn test_parse_error_on_malformed_yaml() {
        let err = parse_definition_yaml("id: [unclosed").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_discover_definitions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("transcode.yaml"), TRANSCODE).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested/other.yml"),
            "id: other\nnodes:\n  - { id: a, job: x, end: true }\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a definition").unwrap();

        let found = discover_definitions(dir.path()).unwrap();
        let mut ids: Vec<&str> = found.iter().map(|(_, g)| g.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["other", "transcode_episode"]);
    }

    #[test]
    fn test_discover_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "id: same\nnodes:\n  - { id: a, job: x, end: true }\n";
        std::fs::write(dir.path().join("a.yaml"), yaml).unwrap();
        std::fs::write(dir.path().join("b.yaml"), yaml).unwrap();

        let err = discover_definitions(dir.path()).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateDefinition { .. }));
    }

    #[test]
    fn test_discover_fails_on_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "id: wf\nnodes: []\n").unwrap();
        let err = discover_definitions(dir.path()).unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_definitions(Path::new("/nonexistent/autoflow/defs")).unwrap();
        assert!(found.is_empty());
    }
}
