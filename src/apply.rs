// ABOUTME: Apply engine - writes winning changes to the target with the cursor in one transaction
// ABOUTME: Idempotent by cursor, guarded against concurrent target writes, retried once after refresh

use std::collections::BTreeMap;

use crate::adapter::{self, AtomicBatch, Connection, Statement, TableName};
use crate::error::{Result, SyncError};
use crate::model::{ChangeLogEntry, Operation, RowImage};
use crate::reader::json_object;

/// One end of a pair as the apply engine sees it.
pub struct TableSide<'a> {
    pub conn: &'a dyn Connection,
    pub table: TableName,
    /// Primary key columns in this endpoint's names.
    pub primary_key: Vec<String>,
    /// Every column of the table, introspected at setup.
    pub columns: Vec<String>,
    /// Whether capture triggers (and a changelog) exist on this side.
    pub capture: bool,
}

impl TableSide<'_> {
    pub fn endpoint_id(&self) -> &str {
        self.conn.endpoint_id()
    }
}

/// What to apply on the target in one transaction.
#[derive(Debug, Clone, Default)]
pub struct ApplyPlan {
    pub source_endpoint: String,
    /// Winning source entries, in any order.
    pub entries: Vec<ChangeLogEntry>,
    /// Cursor value committed together with the writes.
    pub source_high_water: i64,
    /// Highest target changelog id this cycle has seen; newer genuine rows for an applied key abort.
    pub target_high_water: i64,
    /// Source column name to target column name, for renamed columns only.
    pub column_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub applied: usize,
    /// Entries at or below the stored cursor.
    pub skipped: usize,
    pub rows_affected: u64,
    pub cursor: i64,
    pub refreshed: bool,
}

/// Current cursor of `source` on `target`, 0 when none was stored yet.
pub async fn read_cursor(target: &dyn Connection, source: &str, table: &str) -> Result<i64> {
    let stmt = target
        .dialect()
        .read_cursor(target.schema(), source, table);
    let rows = adapter::run_query(target, &stmt).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("last_sequence_id"))
        .and_then(adapter::as_i64)
        .unwrap_or(0))
}

/// Forget how far `target` has applied `source`'s changelog. Used when that changelog is dropped,
/// since a recreated changelog numbers its rows from the start again.
pub async fn reset_cursor(target: &dyn Connection, source: &str, table: &str) -> Result<()> {
    let cursor_table = TableName::new(target.schema(), adapter::sql::CURSOR_TABLE);
    if !adapter::table_exists(target, &cursor_table).await? {
        return Ok(());
    }
    let stmt = target
        .dialect()
        .delete_cursor(target.schema(), source, table);
    target.execute_write(&stmt.sql, &stmt.params).await?;
    Ok(())
}

/// Apply `plan` to `target`. `source` is used to refresh stale rows after a constraint failure.
pub async fn apply(
    source: &TableSide<'_>,
    target: &TableSide<'_>,
    plan: &ApplyPlan,
) -> Result<ApplyResult> {
    let cursor = read_cursor(target.conn, &plan.source_endpoint, &target.table.name).await?;
    let mut entries: Vec<ChangeLogEntry> = plan
        .entries
        .iter()
        .filter(|e| e.sequence_id > cursor)
        .cloned()
        .collect();
    entries.sort_by_key(|e| e.sequence_id);
    let skipped = plan.entries.len() - entries.len();

    let mut result = ApplyResult {
        applied: entries.len(),
        skipped,
        cursor: cursor.max(plan.source_high_water),
        ..Default::default()
    };

    if entries.is_empty() && plan.source_high_water <= cursor {
        tracing::debug!(
            "Nothing to apply on '{}' from '{}' (cursor {})",
            target.endpoint_id(),
            plan.source_endpoint,
            cursor
        );
        return Ok(result);
    }

    let batch = plan_apply(target, plan, &entries)?;
    match target.conn.execute_atomic(&batch).await {
        Ok(affected) => {
            result.rows_affected = affected;
        }
        Err(SyncError::Apply { message, .. }) => {
            tracing::warn!(
                "Apply on '{}' failed ({}); refreshing {} row(s) from '{}' and retrying once",
                target.endpoint_id(),
                message,
                entries.len(),
                source.endpoint_id()
            );
            let refreshed = refresh_entries(source, &entries).await?;
            let batch = plan_apply(target, plan, &refreshed)?;
            result.rows_affected = target.conn.execute_atomic(&batch).await.map_err(|e| match e {
                SyncError::Apply { endpoint, message } => {
                    SyncError::ApplyEscalated { endpoint, message }
                }
                other => other,
            })?;
            result.refreshed = true;
        }
        Err(e) => return Err(e),
    }

    tracing::debug!(
        "Applied {} change(s) on '{}' from '{}', cursor now {}",
        result.applied,
        target.endpoint_id(),
        plan.source_endpoint,
        result.cursor
    );
    Ok(result)
}

/// Build the transaction for `entries`: guard, row writes in sequence order, cursor upsert.
pub fn plan_apply(
    target: &TableSide<'_>,
    plan: &ApplyPlan,
    entries: &[ChangeLogEntry],
) -> Result<AtomicBatch> {
    let dialect = target.conn.dialect();
    let mut batch = AtomicBatch::new(Some(plan.source_endpoint.clone()));

    if target.capture && !entries.is_empty() {
        let mut keys: Vec<String> = entries.iter().map(|e| e.pk_text.clone()).collect();
        keys.sort();
        keys.dedup();
        batch.guards.push(dialect.concurrent_writes_guard(
            &target.table,
            plan.target_high_water,
            &plan.source_endpoint,
            &keys,
        ));
    }

    for entry in entries {
        batch
            .statements
            .push(row_statement(target, &plan.column_map, entry)?);
    }

    batch.statements.push(dialect.advance_cursor(
        target.conn.schema(),
        &plan.source_endpoint,
        &target.table.name,
        plan.source_high_water,
    ));
    Ok(batch)
}

/// Write one settled change to `target` outside the cursor protocol.
///
/// Used when a held conflict is resolved: the writes carry the echo marker of `source_endpoint`
/// so the peer does not send them back, but no cursor moves.
pub async fn write_resolution(
    target: &TableSide<'_>,
    source_endpoint: &str,
    column_map: &BTreeMap<String, String>,
    entry: &ChangeLogEntry,
) -> Result<u64> {
    let mut batch = AtomicBatch::new(Some(source_endpoint.to_string()));
    batch
        .statements
        .push(row_statement(target, column_map, entry)?);
    target.conn.execute_atomic(&batch).await
}

fn row_statement(
    target: &TableSide<'_>,
    column_map: &BTreeMap<String, String>,
    entry: &ChangeLogEntry,
) -> Result<Statement> {
    let dialect = target.conn.dialect();
    match entry.operation {
        Operation::Delete => {
            let key = map_row(target, column_map, &entry.primary_key, entry)?;
            Ok(dialect.delete_row(&target.table, &target.primary_key, &key))
        }
        Operation::Insert | Operation::Update => {
            let image = entry.row.as_ref().ok_or_else(|| {
                SyncError::schema(
                    &entry.origin,
                    format!(
                        "{} entry {} has no row image",
                        entry.operation.as_str(),
                        entry.sequence_id
                    ),
                )
            })?;
            let row = map_row(target, column_map, image, entry)?;
            Ok(dialect.upsert_row(&target.table, &target.primary_key, &row))
        }
    }
}

/// Rename source columns to target columns, dropping columns the target does not have.
fn map_row(
    target: &TableSide<'_>,
    column_map: &BTreeMap<String, String>,
    image: &RowImage,
    entry: &ChangeLogEntry,
) -> Result<RowImage> {
    let mut mapped = RowImage::new();
    for (column, value) in image {
        let name = column_map
            .get(column)
            .cloned()
            .unwrap_or_else(|| column.clone());
        if target.columns.is_empty() || target.columns.contains(&name) {
            mapped.insert(name, value.clone());
        } else {
            tracing::trace!(
                "Column '{}' has no counterpart on '{}'; dropped",
                column,
                target.endpoint_id()
            );
        }
    }
    if let Some(missing) = target.primary_key.iter().find(|c| !mapped.contains_key(*c)) {
        return Err(SyncError::schema(
            target.endpoint_id(),
            format!(
                "change {} for key '{}' has no value for primary key column '{}'",
                entry.sequence_id, entry.pk_text, missing
            ),
        ));
    }
    Ok(mapped)
}

/// Re-read every entry's row from the source; a vanished row becomes a delete.
async fn refresh_entries(
    source: &TableSide<'_>,
    entries: &[ChangeLogEntry],
) -> Result<Vec<ChangeLogEntry>> {
    let mut refreshed = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut fresh = entry.clone();
        match read_row(source, &entry.primary_key).await? {
            Some(row) => {
                if fresh.operation.is_delete() {
                    fresh.operation = Operation::Update;
                }
                fresh.row = Some(row);
            }
            None => {
                fresh.operation = Operation::Delete;
                fresh.row = None;
            }
        }
        refreshed.push(fresh);
    }
    Ok(refreshed)
}

/// Current image of the row identified by `key` (source column names), if it exists.
pub async fn read_row(side: &TableSide<'_>, key: &RowImage) -> Result<Option<RowImage>> {
    let stmt = side
        .conn
        .dialect()
        .select_row_image(&side.table, &side.columns, &side.primary_key, key);
    let rows = adapter::run_query(side.conn, &stmt).await?;
    Ok(rows
        .first()
        .and_then(|row| json_object(row.get("row_image"))))
}
