// ABOUTME: Conflict listing and manual resolution commands
// ABOUTME: Shows both recorded images so the operator can pick a side

use anyhow::{bail, Context, Result};
use sync_journal::{ConflictRow, ConflictStatus};

use crate::model::ChangeLogEntry;
use crate::{Side, SyncEngine};

pub async fn list_conflicts(
    engine: &SyncEngine,
    pair_id: Option<&str>,
    status: Option<ConflictStatus>,
) -> Result<()> {
    let rows = engine
        .list_conflicts(pair_id, status)
        .await
        .context("Failed to read conflict journal")?;
    if rows.is_empty() {
        println!("No conflicts recorded");
        return Ok(());
    }
    for row in &rows {
        print_conflict(row);
    }
    Ok(())
}

pub async fn resolve_conflict(engine: &SyncEngine, conflict_id: i64, side: Side) -> Result<()> {
    let closed = engine
        .resolve_conflict(conflict_id, side)
        .await
        .with_context(|| format!("Failed to resolve conflict {}", conflict_id))?;
    if !closed {
        bail!("Conflict {} is not open", conflict_id);
    }
    println!("Conflict {} resolved in favour of the {} side", conflict_id, side);
    Ok(())
}

fn print_conflict(row: &ConflictRow) {
    println!(
        "#{} [{}] pair '{}' table '{}' key {} ({}, {})",
        row.conflict_id,
        row.status.as_str(),
        row.pair_id,
        row.table_name,
        row.pk_text,
        row.strategy,
        row.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!("    local:  {}", describe_entry(&row.local_entry));
    println!("    remote: {}", describe_entry(&row.remote_entry));
    if let Some(winner) = row.winner {
        println!("    winner: {}", winner.as_str());
    }
}

fn describe_entry(bytes: &[u8]) -> String {
    match ChangeLogEntry::from_journal_bytes(bytes) {
        Some(entry) => {
            let image = entry
                .row
                .map(|row| serde_json::Value::Object(row).to_string())
                .unwrap_or_else(|| "-".to_string());
            format!(
                "#{} {} by {} {}",
                entry.sequence_id,
                entry.operation.as_str(),
                entry.origin,
                image
            )
        }
        None => "<unreadable>".to_string(),
    }
}
