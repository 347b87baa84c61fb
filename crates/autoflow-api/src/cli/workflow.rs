//! Workflow instance commands: start, status and result.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use autoflow_types::workflow::{NodeInstance, SubjectRef, WorkflowStatus};

use crate::state::AppState;

/// Parse `--args` into a JSON object; absent means empty.
pub fn parse_args(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("invalid JSON in --args")? {
        Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {}", json_kind(&other)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn parse_workflow_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("'{raw}' is not a workflow UUID"))
}

fn status_cell(status: WorkflowStatus) -> Cell {
    let color = match status {
        WorkflowStatus::Running => Color::Yellow,
        WorkflowStatus::Complete => Color::Green,
        WorkflowStatus::Failed => Color::Red,
    };
    Cell::new(status).fg(color)
}

fn styled_status(status: WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Running => style(status).yellow().to_string(),
        WorkflowStatus::Complete => style(status).green().to_string(),
        WorkflowStatus::Failed => style(status).red().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

pub async fn start(
    state: &AppState,
    definition: &str,
    subject: Option<SubjectRef>,
    raw_args: Option<&str>,
    wait: Option<u64>,
    json: bool,
) -> Result<()> {
    let args = parse_args(raw_args)?;
    let engine = state.runtime.engine();

    let workflow_id = engine
        .start(definition, subject.clone(), args)
        .await
        .with_context(|| format!("failed to start workflow '{definition}'"))?;

    let Some(secs) = wait else {
        if json {
            let out = serde_json::json!({
                "workflow_id": workflow_id.to_string(),
                "definition": definition,
                "subject": subject.as_ref().map(ToString::to_string),
                "status": WorkflowStatus::Running,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!();
            println!(
                "  {} Started workflow '{}'",
                style("*").green().bold(),
                style(definition).cyan()
            );
            println!("  ID: {workflow_id}");
            if let Some(subject) = &subject {
                println!("  Subject: {subject}");
            }
            println!();
            println!(
                "  Check progress: {}",
                style(format!("autoflow status {workflow_id}")).dim()
            );
            println!();
        }
        return Ok(());
    };

    let spinner = ProgressBar::new_spinner();
    if json {
        spinner.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Running {definition} ({workflow_id})..."));
    spinner.enable_steady_tick(Duration::from_millis(80));

    let cancel = CancellationToken::new();
    let running = state.runtime.spawn(cancel.clone());
    let poll = state.paths.config.scheduler.poll_interval();
    let waited = engine
        .wait_for(workflow_id, Duration::from_secs(secs), poll)
        .await;
    cancel.cancel();
    running.await?;
    spinner.finish_and_clear();

    let status = waited?;
    if !status.is_terminal() {
        if json {
            let out = serde_json::json!({
                "workflow_id": workflow_id.to_string(),
                "status": status,
                "timed_out": true,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!(
                "  {} Workflow {} still running after {secs}s",
                style("…").yellow(),
                workflow_id
            );
        }
        return Ok(());
    }

    show_status(state, workflow_id, json).await
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn status(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let workflow_id = parse_workflow_id(raw_id)?;
    show_status(state, workflow_id, json).await
}

async fn show_status(state: &AppState, workflow_id: Uuid, json: bool) -> Result<()> {
    let engine = state.runtime.engine();
    let workflow = engine.workflow(workflow_id).await?;
    let status = engine.status(workflow_id).await?;
    let chain = engine.chain(workflow_id).await?;
    let children = engine.children(workflow_id).await?;
    let result = engine.result(workflow_id).await?;

    if json {
        let mut child_statuses = Vec::with_capacity(children.len());
        for child in &children {
            child_statuses.push(serde_json::json!({
                "workflow_id": child.id.to_string(),
                "definition": child.definition_id,
                "status": engine.status(child.id).await?,
            }));
        }
        let out = serde_json::json!({
            "workflow": workflow,
            "status": status,
            "nodes": chain,
            "children": child_statuses,
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({})",
        style("Workflow:").bold(),
        style(&workflow.definition_id).cyan(),
        workflow.id
    );
    println!("  Status:  {}", styled_status(status));
    if let Some(subject) = &workflow.subject {
        println!("  Subject: {subject}");
    }
    if let Some(parent) = workflow.parent_workflow_id {
        println!("  Parent:  {parent}");
    }
    println!(
        "  Started: {}",
        workflow.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!();

    if chain.is_empty() {
        println!("  No nodes yet; the next sweep creates the first one.");
        println!();
    } else {
        println!("{}", chain_table(&chain));
        println!();
    }

    if !children.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Child").fg(Color::Cyan),
                Cell::new("Definition"),
                Cell::new("Status"),
            ]);
        for child in &children {
            table.add_row(vec![
                Cell::new(child.id),
                Cell::new(&child.definition_id),
                status_cell(engine.status(child.id).await?),
            ]);
        }
        println!("{table}");
        println!();
    }

    if let Some(result) = result {
        println!(
            "  Result ({} → {}):",
            style(&result.node_id).cyan(),
            result.selection
        );
        println!("  {}", serde_json::to_string(&result.output)?);
        println!();
    }

    Ok(())
}

fn chain_table(chain: &[NodeInstance]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Job"),
            Cell::new("Selection"),
            Cell::new("Error"),
            Cell::new("Updated"),
        ]);

    for (i, node) in chain.iter().enumerate() {
        let job = node
            .job
            .map(|h| h.to_string().chars().take(8).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        let selection = node.selection.clone().unwrap_or_else(|| "-".to_string());
        let error = match &node.error_details {
            Some(e) => Cell::new(&e.message).fg(Color::Red),
            None if node.halted => Cell::new("halted").fg(Color::Red),
            None => Cell::new("-"),
        };
        let mut name = node.node_id.clone();
        if node.terminal {
            name.push_str(" (end)");
        }

        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(name),
            Cell::new(job),
            Cell::new(selection),
            error,
            Cell::new(node.updated_at.format("%H:%M:%S").to_string()),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

pub async fn result(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let workflow_id = parse_workflow_id(raw_id)?;
    let engine = state.runtime.engine();
    engine.workflow(workflow_id).await?;

    let Some(result) = engine.result(workflow_id).await? else {
        let status = engine.status(workflow_id).await?;
        bail!("workflow {workflow_id} is {status}; it has no result");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&result.output)?);
    }
    Ok(())
}
