//! `definitions list|validate`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use autoflow_core::queue::registry::JobRegistry;
use autoflow_core::workflow::dag::unreachable_nodes;
use autoflow_core::workflow::definition::{WorkflowGraph, load_definition_file};
use autoflow_core::workflow::fork::FORK_JOB;
use autoflow_core::workflow::store::DefinitionStore;

use crate::jobs::builtin_registry;
use crate::state::AppPaths;

#[derive(Subcommand)]
pub enum DefinitionsCommand {
    /// List definitions in the definitions directory.
    List,

    /// Validate definition files.
    Validate {
        /// Files or directories to check (default: the definitions directory).
        paths: Vec<PathBuf>,
    },
}

pub async fn handle_definitions_command(
    cmd: DefinitionsCommand,
    paths: &AppPaths,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionsCommand::List => list(paths, json),
        DefinitionsCommand::Validate { paths: targets } => {
            let targets = if targets.is_empty() {
                vec![paths.definitions_dir.clone()]
            } else {
                targets
            };
            validate(&targets, json)
        }
    }
}

/// Bindings of `graph` that have no built-in handler.
fn unhandled<'a>(graph: &'a WorkflowGraph, registry: &JobRegistry) -> Vec<&'a str> {
    registry
        .missing_bindings(graph)
        .into_iter()
        .filter(|b| *b != FORK_JOB)
        .collect()
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

fn list(paths: &AppPaths, json: bool) -> Result<()> {
    let catalog = paths.load_definitions()?;
    let registry = builtin_registry();
    let graphs: Vec<_> = catalog
        .ids()
        .iter()
        .filter_map(|id| catalog.get(id))
        .collect();

    if json {
        let out: Vec<_> = graphs
            .iter()
            .map(|g| {
                serde_json::json!({
                    "id": g.id(),
                    "description": g.description(),
                    "start": g.start_node().id,
                    "nodes": g.nodes().len(),
                    "jobs": g.job_bindings(),
                    "unhandled_jobs": unhandled(g, &registry),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if graphs.is_empty() {
        println!();
        println!(
            "  No definitions in {}.",
            style(paths.definitions_dir.display()).dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Definition").fg(Color::Cyan),
            Cell::new("Start"),
            Cell::new("Nodes"),
            Cell::new("Jobs"),
            Cell::new("External handlers"),
        ]);

    for g in &graphs {
        let external = unhandled(g, &registry);
        table.add_row(vec![
            Cell::new(g.id()),
            Cell::new(&g.start_node().id),
            Cell::new(g.nodes().len()),
            Cell::new(g.job_bindings().join(", ")),
            if external.is_empty() {
                Cell::new("-")
            } else {
                Cell::new(external.join(", ")).fg(Color::Yellow)
            },
        ]);
    }

    println!();
    println!(
        "  Definitions in {}",
        style(paths.definitions_dir.display()).dim()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FileReport {
    path: PathBuf,
    id: Option<String>,
    error: Option<String>,
    warnings: Vec<String>,
}

fn collect_yaml_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    let mut entries = std::fs::read_dir(path)
        .with_context(|| format!("cannot read {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            collect_yaml_files(&entry_path, out)?;
        } else if entry_path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            out.push(entry_path);
        }
    }
    Ok(())
}

fn check_files(files: &[PathBuf]) -> Vec<FileReport> {
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut reports = Vec::with_capacity(files.len());

    for path in files {
        let mut report = FileReport {
            path: path.clone(),
            id: None,
            error: None,
            warnings: Vec::new(),
        };
        match load_definition_file(path) {
            Ok(graph) => {
                let id = graph.id().to_string();
                if let Some(first) = seen.get(&id) {
                    report.error = Some(format!(
                        "duplicate definition '{id}' (also in {})",
                        first.display()
                    ));
                } else {
                    seen.insert(id.clone(), path.clone());
                }
                for node in unreachable_nodes(graph.nodes(), &graph.start_node().id) {
                    report
                        .warnings
                        .push(format!("node '{node}' is unreachable from '{}'", graph.start_node().id));
                }
                report.id = Some(id);
            }
            Err(e) => report.error = Some(e.to_string()),
        }
        reports.push(report);
    }
    reports
}

fn validate(targets: &[PathBuf], json: bool) -> Result<()> {
    let mut files = Vec::new();
    for target in targets {
        collect_yaml_files(target, &mut files)?;
    }
    let reports = check_files(&files);
    let invalid = reports.iter().filter(|r| r.error.is_some()).count();

    if json {
        let out: Vec<_> = reports
            .iter()
            .map(|r| {
                serde_json::json!({
                    "path": r.path.display().to_string(),
                    "id": r.id,
                    "valid": r.error.is_none(),
                    "error": r.error,
                    "warnings": r.warnings,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        for r in &reports {
            match &r.error {
                None => println!(
                    "  {} {} ({})",
                    style("✓").green(),
                    r.path.display(),
                    r.id.as_deref().unwrap_or("?")
                ),
                Some(e) => println!("  {} {}: {e}", style("✗").red(), r.path.display()),
            }
            for w in &r.warnings {
                println!("    {} {w}", style("!").yellow());
            }
        }
        if reports.is_empty() {
            println!("  No definition files found.");
        }
        println!();
    }

    if invalid > 0 {
        bail!("{invalid} of {} definition files are invalid", reports.len());
    }
    Ok(())
}
