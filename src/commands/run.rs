// ABOUTME: Foreground scheduler loop and one-shot sync runs
// ABOUTME: Ctrl+C or SIGTERM stop the scheduler after in-flight jobs finish their phase

use anyhow::{bail, Context, Result};

use super::banner;
use crate::orchestrator::CycleReport;
use crate::SyncEngine;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Start the scheduler immediately instead of running a single pass.
    pub auto_start: bool,
    /// Running detached; nothing is printed to a terminal.
    pub background: bool,
}

/// Run the scheduler until a shutdown signal arrives.
///
/// Without `auto_start` a single pass over every pair runs and the command returns.
pub async fn run(engine: SyncEngine, opts: RunOptions) -> Result<()> {
    if !opts.auto_start {
        tracing::info!("Scheduler not started (pass --auto-start to sync on schedule)");
        return sync(&engine, None).await;
    }
    engine
        .start_scheduler()
        .context("Failed to start scheduler")?;

    if !opts.background {
        banner("database-bisync running");
        println!("  Pairs: {}", engine.config().pairs.len());
        println!("  Press Ctrl+C to stop");
        println!();
    }

    wait_for_shutdown().await?;
    tracing::info!("Received shutdown signal");
    engine.stop_scheduler().await;
    Ok(())
}

/// Run one cycle for `pair_id`, or for every pair, and wait for the results.
pub async fn sync(engine: &SyncEngine, pair_id: Option<&str>) -> Result<()> {
    let pair_ids: Vec<String> = match pair_id {
        Some(id) => vec![id.to_string()],
        None => engine.config().pairs.iter().map(|p| p.id.clone()).collect(),
    };

    let mut failed = Vec::new();
    for pair_id in &pair_ids {
        match engine.run_pair_now(pair_id).await {
            Ok(report) => print_report(&report),
            Err(e) => {
                tracing::error!("Sync of '{}' failed: {:?}", pair_id, e);
                println!("  {}: FAILED ({})", pair_id, e);
                failed.push(pair_id.clone());
            }
        }
    }
    if !failed.is_empty() {
        bail!("{} pair(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!(
        "  {}: {} to local, {} to remote, {} conflict(s) ({} open), {} held, {} convergent, {}ms",
        report.pair_id,
        report.applied_to_local,
        report.applied_to_remote,
        report.conflicts,
        report.opened,
        report.held,
        report.convergent,
        report.duration_ms
    );
    if report.compacted > 0 {
        println!("    compacted {} changelog row(s)", report.compacted);
    }
    for waiting in &report.unresolved {
        println!("    {}", waiting);
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C"),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}
