// ABOUTME: Infrastructure and diagnostics commands: setup, teardown, validate, check, tables, compact
// ABOUTME: Failures are printed per endpoint or pair before the command reports an error

use anyhow::{bail, Context, Result};

use super::banner;
use crate::SyncEngine;

pub async fn setup(engine: &SyncEngine) -> Result<()> {
    let results = engine
        .setup_infrastructure()
        .await
        .context("Failed to install sync infrastructure")?;
    banner("Sync infrastructure installed");
    for result in &results {
        println!(
            "  {}.{}: {} trigger(s) created, {} replaced, {} unchanged",
            result.endpoint,
            result.table,
            result.triggers_created.len(),
            result.triggers_replaced.len(),
            result.triggers_unchanged.len()
        );
    }
    Ok(())
}

pub async fn teardown(engine: &SyncEngine) -> Result<()> {
    engine
        .teardown_infrastructure()
        .await
        .context("Failed to remove sync infrastructure")?;
    println!("Removed triggers and changelogs for {} pair(s)", engine.config().pairs.len());
    println!("Cursors were cleared; the next setup starts capturing from scratch.");
    Ok(())
}

pub async fn validate(engine: &SyncEngine) -> Result<()> {
    let problems = engine.validate_configuration().await;
    if problems.is_empty() {
        println!("Configuration is valid");
        return Ok(());
    }
    println!("Configuration has {} problem(s):", problems.len());
    for problem in &problems {
        println!("  - {}", problem);
    }
    bail!("Configuration validation failed")
}

pub async fn check(engine: &SyncEngine) -> Result<()> {
    let checks = engine.check_connections().await;
    let mut failed = 0;
    for check in &checks {
        match &check.error {
            None => println!("  ✓ {} ({}) {}", check.endpoint, check.dialect, check.dsn),
            Some(error) => {
                failed += 1;
                println!("  ✗ {} ({}) {}: {}", check.endpoint, check.dialect, check.dsn, error);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} endpoint(s) unreachable", failed, checks.len());
    }
    Ok(())
}

pub async fn tables(engine: &SyncEngine, endpoint_id: &str) -> Result<()> {
    let tables = engine
        .list_tables(endpoint_id)
        .await
        .with_context(|| format!("Failed to list tables of '{}'", endpoint_id))?;
    if tables.is_empty() {
        println!("No user tables on '{}'", endpoint_id);
    }
    for table in tables {
        println!("{}", table);
    }
    Ok(())
}

pub async fn compact(engine: &SyncEngine, pair_id: Option<&str>) -> Result<()> {
    let pair_ids: Vec<String> = match pair_id {
        Some(id) => vec![id.to_string()],
        None => engine.config().pairs.iter().map(|p| p.id.clone()).collect(),
    };
    for pair_id in &pair_ids {
        let report = engine
            .compact(pair_id)
            .await
            .with_context(|| format!("Failed to compact changelogs of '{}'", pair_id))?;
        let watermark = |w: Option<i64>| w.map_or_else(|| "-".to_string(), |w| w.to_string());
        println!(
            "  {}: deleted {} row(s) (local up to {}, remote up to {})",
            report.pair_id,
            report.deleted,
            watermark(report.local_watermark),
            watermark(report.remote_watermark)
        );
    }
    Ok(())
}
