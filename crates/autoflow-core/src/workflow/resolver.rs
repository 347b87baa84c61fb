//! Argument resolution for node job inputs.
//!
//! Argument templates reference the execution context with `${source.path}`:
//!
//! - `subject` -- fields of the workflow's subject entity (plus `kind`, `id`)
//! - `args` -- the workflow instance's input arguments
//! - `<node_id>` -- `{input, output, selection}` of the latest node instance
//!   with that id in the chain
//!
//! A template that is exactly one reference yields the referenced JSON value
//! with its type intact. References embedded in a larger string are rendered
//! as text. Missing or null intermediates resolve to null (empty text) rather
//! than failing; unknown sources and malformed references are errors.
//! `$${` writes a literal `${`.

use std::collections::{HashMap, HashSet};

use autoflow_types::workflow::{NodeInstance, SubjectRef};
use serde_json::{Map, Value, json};
use thiserror::Error;

use super::definition::WorkflowGraph;

/// Errors raised while resolving argument templates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// The reference names neither a reserved source nor a node of the definition.
    #[error("unknown source '{source_name}' in reference '${{{reference}}}'")]
    UnknownSource {
        source_name: String,
        reference: String,
    },

    /// The template is not well formed.
    #[error("malformed reference in '{template}': {reason}")]
    Malformed { template: String, reason: String },
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Values visible to argument templates of one node.
#[derive(Debug, Clone, Default)]
pub struct ResolutionScope {
    subject: Value,
    args: Value,
    nodes: HashMap<String, Value>,
    declared: HashSet<String>,
}

impl ResolutionScope {
    /// Scope with a subject value and workflow args, and no prior nodes.
    pub fn new(subject: Value, args: Map<String, Value>) -> Self {
        Self {
            subject,
            args: Value::Object(args),
            nodes: HashMap::new(),
            declared: HashSet::new(),
        }
    }

    /// Scope for the next node of a chain: every executed node contributes its
    /// record, and every node of the definition is a known source.
    pub fn for_chain(
        subject: Value,
        args: Map<String, Value>,
        chain: &[NodeInstance],
        graph: &WorkflowGraph,
    ) -> Self {
        let mut scope = Self::new(subject, args);
        scope.declare(graph.nodes().iter().map(|n| n.id.clone()));
        for node in chain {
            scope.record(&node.node_id, node_record(node));
        }
        scope
    }

    /// Mark node ids as known sources even before they have executed.
    pub fn declare(&mut self, node_ids: impl IntoIterator<Item = String>) {
        self.declared.extend(node_ids);
    }

    /// Record an executed node's value, replacing any earlier instance.
    pub fn record(&mut self, node_id: &str, value: Value) {
        self.declared.insert(node_id.to_string());
        self.nodes.insert(node_id.to_string(), value);
    }

    fn source(&self, reference: &Reference) -> Result<&Value, ResolutionError> {
        match reference.source.as_str() {
            "subject" => Ok(&self.subject),
            "args" => Ok(&self.args),
            name => match self.nodes.get(name) {
                Some(value) => Ok(value),
                None if self.declared.contains(name) => Ok(&Value::Null),
                None => Err(ResolutionError::UnknownSource {
                    source_name: name.to_string(),
                    reference: reference.raw.clone(),
                }),
            },
        }
    }
}

/// The value a node instance exposes to later templates.
pub fn node_record(node: &NodeInstance) -> Value {
    json!({
        "input": node.data.input.clone().unwrap_or(Value::Null),
        "output": node.data.output.clone().unwrap_or(Value::Null),
        "selection": node.selection,
    })
}

/// The `subject` source: looked-up fields plus `kind` and `id`.
///
/// Non-object lookups are ignored; a missing subject resolves to null.
pub fn subject_value(subject: Option<&SubjectRef>, fields: Option<Value>) -> Value {
    let Some(subject) = subject else {
        return Value::Null;
    };
    let mut object = match fields {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    object
        .entry("kind")
        .or_insert_with(|| Value::String(subject.kind.clone()));
    object
        .entry("id")
        .or_insert_with(|| Value::String(subject.id.clone()));
    Value::Object(object)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference {
    raw: String,
    source: String,
    path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Reference(Reference),
}

fn malformed(template: &str, reason: impl Into<String>) -> ResolutionError {
    ResolutionError::Malformed {
        template: template.to_string(),
        reason: reason.into(),
    }
}

fn parse_reference(template: &str, body: &str) -> Result<Reference, ResolutionError> {
    let raw = body.trim();
    if raw.is_empty() {
        return Err(malformed(template, "empty reference"));
    }

    let mut parts = Vec::new();
    for part in raw.split('.') {
        if part.is_empty() {
            return Err(malformed(template, format!("empty path segment in '{raw}'")));
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(malformed(
                template,
                format!("invalid character in path segment '{part}'"),
            ));
        }
        parts.push(part.to_string());
    }

    let source = parts.remove(0);
    Ok(Reference {
        raw: raw.to_string(),
        source,
        path: parts,
    })
}

fn parse_template(template: &str) -> Result<Vec<Segment>, ResolutionError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        literal.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("$${") {
            literal.push_str("${");
            rest = after;
        } else if let Some(after) = tail.strip_prefix("${") {
            let close = after
                .find('}')
                .ok_or_else(|| malformed(template, "unterminated '${'"))?;
            let reference = parse_reference(template, &after[..close])?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Reference(reference));
            rest = &after[close + 1..];
        } else {
            literal.push('$');
            rest = &tail[1..];
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn lookup(reference: &Reference, scope: &ResolutionScope) -> Result<Value, ResolutionError> {
    let mut current = scope.source(reference)?;
    for key in &reference.path {
        let next = match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        // Numbers and bools print as literals, arrays and objects as compact JSON.
        other => other.to_string(),
    }
}

/// Resolve one string template.
pub fn resolve_str(template: &str, scope: &ResolutionScope) -> Result<Value, ResolutionError> {
    let segments = parse_template(template)?;

    match segments.as_slice() {
        [] => Ok(Value::String(String::new())),
        [Segment::Reference(reference)] => lookup(reference, scope),
        _ => {
            let mut out = String::with_capacity(template.len());
            for segment in &segments {
                match segment {
                    Segment::Literal(text) => out.push_str(text),
                    Segment::Reference(reference) => out.push_str(&render(&lookup(reference, scope)?)),
                }
            }
            Ok(Value::String(out))
        }
    }
}

/// Resolve a template value: strings are evaluated, arrays and objects are
/// resolved element-wise, other scalars pass through.
pub fn resolve_value(template: &Value, scope: &ResolutionScope) -> Result<Value, ResolutionError> {
    match template {
        Value::String(s) => resolve_str(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_args(map, scope).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve a node's argument map, preserving key order.
pub fn resolve_args(
    args: &Map<String, Value>,
    scope: &ResolutionScope,
) -> Result<Map<String, Value>, ResolutionError> {
    args.iter()
        .map(|(key, template)| Ok((key.clone(), resolve_value(template, scope)?)))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::workflow::NodeData;
    use chrono::Utc;
    use uuid::Uuid;

    fn episode_scope() -> ResolutionScope {
        let subject = subject_value(
            Some(&SubjectRef::new("episode", "42")),
            Some(json!({
                "title": "X",
                "season": 2,
                "episode": 5,
                "tv_season": { "tv_show": { "title": "Show" } },
                "tags": ["drama", "hdr"],
            })),
        );
        let mut args = Map::new();
        args.insert("quality".to_string(), json!("1080p"));
        let mut scope = ResolutionScope::new(subject, args);
        scope.declare(["cleanup".to_string()]);
        scope.record(
            "probe",
            json!({ "input": { "path": "/in.mkv" }, "output": { "streams": [{ "height": 1080 }] }, "selection": "default" }),
        );
        scope
    }

    #[test]
    fn test_embedded_references_render_as_text() {
        let scope = episode_scope();
        let value = resolve_str(
            "${subject.title} S${subject.season}E${subject.episode}",
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!("X S2E5"));
    }

    #[test]
    fn test_whole_reference_preserves_type() {
        let scope = episode_scope();
        assert_eq!(
            resolve_str("${probe.output}", &scope).unwrap(),
            json!({ "streams": [{ "height": 1080 }] })
        );
        assert_eq!(resolve_str("${subject.season}", &scope).unwrap(), json!(2));
        assert_eq!(
            resolve_str("${probe.output.streams.0.height}", &scope).unwrap(),
            json!(1080)
        );
    }

    #[test]
    fn test_nested_subject_path() {
        let scope = episode_scope();
        assert_eq!(
            resolve_str("/TV Shows/${subject.tv_season.tv_show.title}/s${subject.season}", &scope)
                .unwrap(),
            json!("/TV Shows/Show/s2")
        );
    }

    #[test]
    fn test_missing_intermediate_yields_null_or_empty() {
        let scope = episode_scope();
        assert_eq!(
            resolve_str("${subject.tv_season.missing.title}", &scope).unwrap(),
            Value::Null
        );
        assert_eq!(
            resolve_str("title: ${subject.nope.deeper}!", &scope).unwrap(),
            json!("title: !")
        );
        assert_eq!(resolve_str("${subject.tags.9}", &scope).unwrap(), Value::Null);
        assert_eq!(resolve_str("${subject.title.length}", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn test_declared_but_unexecuted_node_is_null() {
        let scope = episode_scope();
        assert_eq!(resolve_str("${cleanup.output}", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn test_unknown_source_is_an_error() {
        let scope = episode_scope();
        let err = resolve_str("${Setting.root_path}/x", &scope).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::UnknownSource {
                source_name: "Setting".to_string(),
                reference: "Setting.root_path".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_references() {
        let scope = episode_scope();
        for template in ["${}", "${subject..title}", "${subject.title", "${sub ject.x}", "${.a}"] {
            let err = resolve_str(template, &scope).unwrap_err();
            assert!(
                matches!(err, ResolutionError::Malformed { .. }),
                "{template} should be malformed, got {err:?}"
            );
        }
    }

    #[test]
    fn test_plain_strings_and_escapes() {
        let scope = episode_scope();
        assert_eq!(resolve_str("no refs here", &scope).unwrap(), json!("no refs here"));
        assert_eq!(resolve_str("cost: $5", &scope).unwrap(), json!("cost: $5"));
        assert_eq!(
            resolve_str("literal $${subject.title}", &scope).unwrap(),
            json!("literal ${subject.title}")
        );
        assert_eq!(resolve_str("", &scope).unwrap(), json!(""));
    }

    #[test]
    fn test_structured_values_render_as_json_when_embedded() {
        let scope = episode_scope();
        assert_eq!(
            resolve_str("tags=${subject.tags}", &scope).unwrap(),
            json!(r#"tags=["drama","hdr"]"#)
        );
    }

    #[test]
    fn test_resolve_args_recurses_and_keeps_order() {
        let scope = episode_scope();
        let mut args = Map::new();
        args.insert("z_path".to_string(), json!("${probe.input.path}"));
        args.insert("a_nested".to_string(), json!({ "q": "${args.quality}", "n": 3 }));
        args.insert("m_list".to_string(), json!(["${subject.id}", true]));

        let resolved = resolve_args(&args, &scope).unwrap();
        let keys: Vec<&str> = resolved.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z_path", "a_nested", "m_list"]);
        assert_eq!(resolved["z_path"], json!("/in.mkv"));
        assert_eq!(resolved["a_nested"], json!({ "q": "1080p", "n": 3 }));
        assert_eq!(resolved["m_list"], json!(["42", true]));
    }

    #[test]
    fn test_subject_value_injects_identity() {
        let subject = SubjectRef::new("profile", "7");
        assert_eq!(
            subject_value(Some(&subject), None),
            json!({ "kind": "profile", "id": "7" })
        );
        assert_eq!(
            subject_value(Some(&subject), Some(json!({ "id": "custom" })))["id"],
            json!("custom")
        );
        assert_eq!(subject_value(None, Some(json!({ "a": 1 }))), Value::Null);
    }

    #[test]
    fn test_scope_for_chain_uses_latest_instance() {
        let graph = crate::workflow::definition::parse_definition_yaml(
            "id: wf\nnodes:\n  - { id: step, job: x, transitions: { default: done } }\n  - { id: done, job: y, end: true }\n",
        )
        .unwrap();
        let workflow_id = Uuid::now_v7();
        let make = |output: Value| NodeInstance {
            id: Uuid::now_v7(),
            workflow_id,
            node_id: "step".to_string(),
            parent_node_id: None,
            child_node_id: None,
            reservation: Uuid::now_v7().to_string(),
            job: None,
            data: NodeData {
                input: None,
                output: Some(output),
            },
            selection: Some("default".to_string()),
            error_details: None,
            terminal: false,
            halted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let chain = vec![make(json!("first")), make(json!("second"))];

        let scope = ResolutionScope::for_chain(Value::Null, Map::new(), &chain, &graph);
        assert_eq!(resolve_str("${step.output}", &scope).unwrap(), json!("second"));
        assert_eq!(resolve_str("${step.selection}", &scope).unwrap(), json!("default"));
        assert_eq!(resolve_str("${done.output}", &scope).unwrap(), Value::Null);
        assert_eq!(resolve_str("${subject.title}", &scope).unwrap(), Value::Null);
    }
}
