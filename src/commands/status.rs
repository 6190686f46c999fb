// ABOUTME: Status command for pair states and engine statistics
// ABOUTME: Prints either a readable summary or the full status as JSON

use anyhow::{Context, Result};

use super::banner;
use crate::orchestrator::EngineStatus;
use crate::SyncEngine;

/// Print pair states and engine statistics, as text or as JSON.
pub async fn status(engine: &SyncEngine, json: bool) -> Result<()> {
    let status = engine
        .get_status()
        .await
        .context("Failed to read sync status")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("Failed to serialize status")?
        );
        return Ok(());
    }
    print_status(&status);
    Ok(())
}

fn print_status(status: &EngineStatus) {
    banner("Sync status");
    println!(
        "  Scheduler: {}",
        if status.scheduler_running {
            "running"
        } else {
            "stopped"
        }
    );
    println!(
        "  Cycles: {}  Rows applied: {}  Conflicts: {}  Failures: {}",
        status.statistics.cycles,
        status.statistics.rows_applied,
        status.statistics.conflicts,
        status.statistics.failures
    );
    println!();
    for pair in &status.pairs {
        let last_success = pair
            .last_success_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {}: {}{}",
            pair.pair_id,
            pair.state.label(),
            if pair.degraded { " (degraded)" } else { "" }
        );
        println!("    last success: {}", last_success);
        println!("    open conflicts: {}", pair.open_conflicts);
        if pair.consecutive_failures > 0 {
            println!("    consecutive failures: {}", pair.consecutive_failures);
        }
        if let Some(error) = &pair.last_error {
            println!("    last error: {}", error);
        }
    }
}
