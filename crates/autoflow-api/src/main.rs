//! Autoflow CLI entry point.
//!
//! Binary name: `autoflow`
//!
//! Parses CLI arguments, sets up tracing, resolves the data directory and
//! dispatches to the command handlers.

mod cli;
mod jobs;
mod state;

use clap::Parser;
use clap_complete::generate;

use autoflow_observe::tracing_setup::{
    TracingOptions, filter_for_verbosity, init_tracing, shutdown_tracing,
};
use cli::{Cli, Commands};
use state::{AppPaths, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        format: cli.log_format,
        default_filter: filter_for_verbosity(cli.verbose, cli.quiet).to_string(),
        enable_otel: cli.otel,
    })?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need any state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "autoflow", &mut std::io::stdout());
        return Ok(());
    }

    let paths = AppPaths::resolve(cli.data_dir.clone()).await?;

    // Definition commands only read files
    if let Commands::Definitions { action } = cli.command {
        return cli::definitions::handle_definitions_command(action, &paths, cli.json).await;
    }

    let state = AppState::init(paths).await?;

    match cli.command {
        Commands::Run => cli::run::run(&state, cli.json).await,
        Commands::Sweep => cli::run::sweep(&state, cli.json).await,
        Commands::Start {
            definition,
            subject,
            args,
            wait,
        } => {
            cli::workflow::start(&state, &definition, subject, args.as_deref(), wait, cli.json).await
        }
        Commands::Status { workflow_id } => {
            cli::workflow::status(&state, &workflow_id, cli.json).await
        }
        Commands::Result { workflow_id } => {
            cli::workflow::result(&state, &workflow_id, cli.json).await
        }
        Commands::Subject { action } => {
            cli::subject::handle_subject_command(action, &state, cli.json).await
        }
        Commands::Definitions { .. } | Commands::Completions { .. } => {
            unreachable!("handled above")
        }
    }
}
