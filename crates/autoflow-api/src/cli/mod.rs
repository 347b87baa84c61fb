//! CLI command definitions for the `autoflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod definitions;
pub mod run;
pub mod subject;
pub mod workflow;

use std::path::PathBuf;

use autoflow_observe::tracing_setup::LogFormat;
use autoflow_types::workflow::SubjectRef;
use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Durable, queue-backed workflow engine.
#[derive(Parser)]
#[command(name = "autoflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding config.toml, the database and definitions.
    #[arg(long, global = true, env = "AUTOFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log output format (pretty or json).
    #[arg(long, global = true, default_value = "pretty", env = "AUTOFLOW_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the transition scheduler and job worker until Ctrl+C.
    Run,

    /// Run one sweep, then execute every claimable job once.
    ///
    /// Fork jobs wait for their children, which only progress under `run`.
    Sweep,

    /// Start a workflow.
    Start {
        /// Definition id.
        definition: String,

        /// Subject record as `kind:id`.
        #[arg(long)]
        subject: Option<SubjectRef>,

        /// Input arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,

        /// Run the engine in-process and wait up to this many seconds for
        /// the workflow to finish.
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,
    },

    /// Show the derived status and node chain of a workflow.
    Status {
        /// Workflow UUID.
        workflow_id: String,
    },

    /// Print the result of a completed workflow.
    Result {
        /// Workflow UUID.
        workflow_id: String,
    },

    /// Inspect workflow definitions.
    #[command(alias = "defs")]
    Definitions {
        #[command(subcommand)]
        action: definitions::DefinitionsCommand,
    },

    /// Manage subject records used by `${subject.*}` references.
    Subject {
        #[command(subcommand)]
        action: subject::SubjectCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
