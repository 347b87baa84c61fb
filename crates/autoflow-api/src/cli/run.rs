//! `run` and `sweep`: drive the engine.

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Run the scheduler and the job worker until Ctrl+C or SIGTERM.
pub async fn run(state: &AppState, json: bool) -> Result<()> {
    let runtime = &state.runtime;
    let missing = runtime.missing_handlers();

    if !json {
        println!();
        println!(
            "  {} Autoflow v{} running",
            style("⚡").bold(),
            env!("CARGO_PKG_VERSION")
        );
        println!(
            "  Definitions: {}  Database: {}",
            style(runtime.definitions().len()).bold(),
            style(&state.paths.database_url).dim()
        );
        for (definition, binding) in &missing {
            println!(
                "  {} no handler for job '{}' used by '{}' (left pending for other workers)",
                style("!").yellow().bold(),
                binding,
                definition
            );
        }
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    let cancel = CancellationToken::new();
    let engine = runtime.spawn(cancel.clone());

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    cancel.cancel();
    engine.await?;

    if !json {
        println!("\n  Engine stopped.");
    }
    Ok(())
}

/// One sweep plus one pass over claimable jobs.
pub async fn sweep(state: &AppState, json: bool) -> Result<()> {
    let (report, jobs) = state.runtime.step().await?;

    if json {
        let out = serde_json::json!({
            "bootstrapped": report.bootstrapped,
            "examined": report.examined,
            "waiting": report.waiting,
            "dispatched": report.dispatched,
            "advanced": report.advanced,
            "lost_races": report.lost_races,
            "completed": report.completed,
            "halted": report.halted,
            "errors": report.errors,
            "jobs_run": jobs,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {}", style("── Sweep ──").dim());
    println!("  Examined:   {}", style(report.examined).bold());
    println!("  Started:    {}", report.bootstrapped);
    println!("  Advanced:   {}", style(report.advanced).green());
    println!("  Dispatched: {}", report.dispatched);
    println!("  Waiting:    {}", report.waiting);
    println!("  Completed:  {}", style(report.completed).green());
    if report.halted > 0 {
        println!("  Halted:     {}", style(report.halted).red());
    }
    if report.errors > 0 {
        println!("  Errors:     {}", style(report.errors).yellow());
    }
    println!();
    println!("  {}", style("── Jobs ──").dim());
    println!("  Executed:   {}", style(jobs).bold());
    println!();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
