// ABOUTME: Change reader - pulls pending changelog rows past a sequence watermark
// ABOUTME: Stops before young sequence gaps so uncommitted ids are never skipped

use std::time::Duration;

use serde_json::Value;

use crate::adapter::{self, Connection, Row, TableName};
use crate::error::{Result, SyncError};
use crate::model::{ChangeLogEntry, Operation, RowImage};

/// One read from a changelog.
#[derive(Debug, Clone, Default)]
pub struct PendingBatch {
    /// Entries in strictly ascending sequence order.
    pub entries: Vec<ChangeLogEntry>,
    /// Highest sequence id that is safe to consume; equals the watermark when nothing was read.
    pub high_water: i64,
    /// Set when reading stopped in front of a gap that may still be filled by an open transaction.
    pub blocked_at: Option<i64>,
    /// True when the batch limit was reached and more rows may be waiting.
    pub truncated: bool,
}

/// Reads changelog rows from one endpoint.
///
/// Auto-increment ids are handed out at insert time but become visible at commit time, so a
/// reader can observe id 12 before id 11. A missing id followed by a row younger than the grace
/// period ends the batch; older gaps are ids of rolled-back transactions and are stepped over.
pub struct ChangeReader<'a> {
    conn: &'a dyn Connection,
    batch_size: usize,
    gap_grace: Duration,
}

impl<'a> ChangeReader<'a> {
    pub fn new(conn: &'a dyn Connection, batch_size: usize, gap_grace: Duration) -> Self {
        Self {
            conn,
            batch_size: batch_size.max(1),
            gap_grace,
        }
    }

    pub async fn read_pending(&self, table: &TableName, since: i64) -> Result<PendingBatch> {
        let stmt = self
            .conn
            .dialect()
            .read_changelog(table, since, self.batch_size);
        let rows = adapter::run_query(self.conn, &stmt).await?;
        let truncated = rows.len() >= self.batch_size;

        let mut batch = PendingBatch {
            high_water: since,
            truncated,
            ..Default::default()
        };
        let mut now_micros: Option<i64> = None;
        let grace_micros = i64::try_from(self.gap_grace.as_micros()).unwrap_or(i64::MAX);

        for row in &rows {
            let entry = parse_entry(self.conn.endpoint_id(), &table.name, row)?;
            let expected = batch.high_water + 1;
            if entry.sequence_id != expected {
                let now = match now_micros {
                    Some(now) => now,
                    None => {
                        let now = adapter::database_clock(self.conn).await?;
                        now_micros = Some(now);
                        now
                    }
                };
                let age = now.saturating_sub(entry.logical_timestamp);
                if age < grace_micros {
                    tracing::debug!(
                        "Changelog '{}' on '{}': sequence {} missing and next row is {}ms old; stopping batch",
                        table.name,
                        self.conn.endpoint_id(),
                        expected,
                        age / 1000
                    );
                    batch.blocked_at = Some(expected);
                    batch.truncated = false;
                    break;
                }
                tracing::debug!(
                    "Changelog '{}' on '{}': skipping rolled-back sequence ids {}..{}",
                    table.name,
                    self.conn.endpoint_id(),
                    expected,
                    entry.sequence_id - 1
                );
            }
            batch.high_water = entry.sequence_id;
            batch.entries.push(entry);
        }

        tracing::debug!(
            "Read {} changelog row(s) from '{}' on '{}' after sequence {}",
            batch.entries.len(),
            table.name,
            self.conn.endpoint_id(),
            since
        );
        Ok(batch)
    }
}

/// Read at most `batch_size` pending entries of `table` after `since`.
pub async fn read_pending(
    conn: &dyn Connection,
    table: &TableName,
    since: i64,
    batch_size: usize,
    gap_grace_ms: u64,
) -> Result<Vec<ChangeLogEntry>> {
    let reader = ChangeReader::new(conn, batch_size, Duration::from_millis(gap_grace_ms));
    Ok(reader.read_pending(table, since).await?.entries)
}

fn parse_entry(endpoint: &str, table: &str, row: &Row) -> Result<ChangeLogEntry> {
    let malformed = |column: &str| {
        SyncError::schema(
            endpoint,
            format!("changelog of '{table}' has a malformed '{column}' value"),
        )
    };

    let sequence_id = row
        .get("sequence_id")
        .and_then(adapter::as_i64)
        .ok_or_else(|| malformed("sequence_id"))?;
    let operation = row
        .get("operation")
        .and_then(Value::as_str)
        .and_then(Operation::parse)
        .ok_or_else(|| malformed("operation"))?;
    let pk_text = match row.get("pk_text") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(malformed("pk_text")),
    };
    let primary_key = json_object(row.get("primary_key")).ok_or_else(|| malformed("primary_key"))?;
    let row_image = json_object(row.get("row_data"));
    if !operation.is_delete() && row_image.is_none() {
        return Err(malformed("row_data"));
    }
    let origin = row
        .get("origin")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("origin"))?
        .to_string();
    let applied_from = row
        .get("applied_from")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let logical_timestamp = row
        .get("changed_at")
        .and_then(adapter::as_i64)
        .ok_or_else(|| malformed("changed_at"))?;

    Ok(ChangeLogEntry {
        sequence_id,
        table: table.to_string(),
        operation,
        pk_text,
        primary_key,
        row: if operation.is_delete() { None } else { row_image },
        origin,
        applied_from,
        logical_timestamp,
    })
}

/// JSON column delivered either as text or already decoded.
pub(crate) fn json_object(value: Option<&Value>) -> Option<RowImage> {
    match value? {
        Value::Object(map) => Some(map.clone()),
        Value::String(text) => match serde_json::from_str(text) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}
