// ABOUTME: Creates and verifies changelog tables, capture triggers, and support tables
// ABOUTME: Idempotent; replaces triggers whose stored body drifted from the expected one

use std::collections::HashMap;

use serde::Serialize;

use crate::adapter::{self, Connection, TableName};
use crate::error::{Result, SyncError};
use crate::utils::normalize_sql;

/// What `ensure_infrastructure` did on one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallResult {
    pub endpoint: String,
    pub table: String,
    pub triggers_created: Vec<String>,
    pub triggers_replaced: Vec<String>,
    pub triggers_unchanged: Vec<String>,
    /// Introspected column list, in ordinal order.
    pub columns: Vec<String>,
}

/// What is missing on an endpoint, without changing anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub endpoint: String,
    pub table: String,
    pub table_exists: bool,
    pub primary_key_matches: bool,
    pub changelog_exists: bool,
    pub cursor_table_exists: bool,
    pub missing_triggers: Vec<String>,
    pub stale_triggers: Vec<String>,
}

impl VerifyReport {
    pub fn is_complete(&self, capture: bool) -> bool {
        self.table_exists
            && self.primary_key_matches
            && self.cursor_table_exists
            && (!capture
                || (self.changelog_exists
                    && self.missing_triggers.is_empty()
                    && self.stale_triggers.is_empty()))
    }
}

/// Check that `table` exists with exactly the configured primary key. Returns its columns.
pub async fn check_table(
    conn: &dyn Connection,
    table: &TableName,
    primary_key: &[String],
) -> Result<Vec<String>> {
    let endpoint = conn.endpoint_id();
    if !adapter::table_exists(conn, table).await? {
        return Err(SyncError::schema(
            endpoint,
            format!("table '{}' does not exist", table.name),
        ));
    }
    let actual = adapter::primary_key_columns(conn, table).await?;
    if actual.is_empty() {
        return Err(SyncError::schema(
            endpoint,
            format!("table '{}' has no primary key", table.name),
        ));
    }
    if !same_columns(&actual, primary_key) {
        return Err(SyncError::schema(
            endpoint,
            format!(
                "table '{}' primary key is ({}) but the pair is configured with ({})",
                table.name,
                actual.join(", "),
                primary_key.join(", ")
            ),
        ));
    }
    adapter::table_columns(conn, table).await
}

fn same_columns(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<&String> = a.iter().collect();
    let mut b: Vec<&String> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}

/// Create support tables and, when `capture` is set, the changelog and capture triggers.
///
/// Safe to run repeatedly. Missing DDL privileges surface as `SchemaError`.
pub async fn ensure_infrastructure(
    conn: &dyn Connection,
    table: &TableName,
    primary_key: &[String],
    capture: bool,
) -> Result<InstallResult> {
    let dialect = conn.dialect();
    let endpoint = conn.endpoint_id().to_string();
    let columns = check_table(conn, table, primary_key).await?;

    for ddl in dialect.support_tables_ddl(conn.schema()) {
        conn.execute_ddl(&ddl).await?;
    }

    let mut result = InstallResult {
        endpoint: endpoint.clone(),
        table: table.name.clone(),
        columns: columns.clone(),
        ..Default::default()
    };

    if !capture {
        tracing::debug!(
            "Endpoint '{}' table '{}' is apply-only; skipping capture triggers",
            endpoint,
            table.name
        );
        return Ok(result);
    }

    for ddl in dialect.changelog_ddl(table) {
        conn.execute_ddl(&ddl).await?;
    }

    let existing = existing_triggers(conn, table).await?;
    let capture_ddl = dialect.capture_ddl(table, &columns, primary_key, &endpoint);
    if let Some(function) = &capture_ddl.function_sql {
        conn.execute_ddl(function).await?;
    }

    for trigger in &capture_ddl.triggers {
        match existing.get(&trigger.name) {
            None => {
                conn.execute_ddl(&trigger.create_sql).await?;
                result.triggers_created.push(trigger.name.clone());
            }
            Some(body) if normalize_sql(body) != normalize_sql(&trigger.expected_body) => {
                tracing::warn!(
                    "Trigger '{}' on endpoint '{}' does not match the table definition; recreating",
                    trigger.name,
                    endpoint
                );
                match dialect.replace_trigger(table, trigger) {
                    Some(batch) => conn.execute_ddl(&batch).await?,
                    None => {
                        // Rows written between these two statements are not captured.
                        conn.execute_ddl(&dialect.drop_trigger(table, &trigger.name))
                            .await?;
                        conn.execute_ddl(&trigger.create_sql).await?;
                    }
                }
                result.triggers_replaced.push(trigger.name.clone());
            }
            Some(_) => result.triggers_unchanged.push(trigger.name.clone()),
        }
    }

    tracing::info!(
        "Infrastructure ready on '{}' for '{}': {} created, {} replaced, {} unchanged",
        endpoint,
        table.name,
        result.triggers_created.len(),
        result.triggers_replaced.len(),
        result.triggers_unchanged.len()
    );
    Ok(result)
}

/// Report missing or stale pieces without creating anything.
pub async fn verify_infrastructure(
    conn: &dyn Connection,
    table: &TableName,
    primary_key: &[String],
) -> Result<VerifyReport> {
    let dialect = conn.dialect();
    let mut report = VerifyReport {
        endpoint: conn.endpoint_id().to_string(),
        table: table.name.clone(),
        ..Default::default()
    };

    report.table_exists = adapter::table_exists(conn, table).await?;
    if !report.table_exists {
        return Ok(report);
    }
    let actual_pk = adapter::primary_key_columns(conn, table).await?;
    report.primary_key_matches = !actual_pk.is_empty() && same_columns(&actual_pk, primary_key);
    report.changelog_exists = adapter::table_exists(conn, &table.changelog()).await?;
    report.cursor_table_exists =
        adapter::table_exists(conn, &table.sibling(adapter::sql::CURSOR_TABLE)).await?;

    let columns = adapter::table_columns(conn, table).await?;
    let existing = existing_triggers(conn, table).await?;
    let expected = dialect.capture_ddl(table, &columns, primary_key, conn.endpoint_id());
    for trigger in expected.triggers {
        match existing.get(&trigger.name) {
            None => report.missing_triggers.push(trigger.name),
            Some(body) if normalize_sql(body) != normalize_sql(&trigger.expected_body) => {
                report.stale_triggers.push(trigger.name)
            }
            Some(_) => {}
        }
    }
    Ok(report)
}

/// Drop capture triggers, trigger function, and the changelog. Support tables stay.
pub async fn teardown_infrastructure(conn: &dyn Connection, table: &TableName) -> Result<()> {
    for ddl in conn.dialect().teardown_ddl(table) {
        conn.execute_ddl(&ddl).await?;
    }
    tracing::info!(
        "Removed capture infrastructure for '{}' on '{}'",
        table.name,
        conn.endpoint_id()
    );
    Ok(())
}

async fn existing_triggers(
    conn: &dyn Connection,
    table: &TableName,
) -> Result<HashMap<String, String>> {
    let rows = adapter::run_query(conn, &conn.dialect().existing_triggers(table)).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let name = row.get("name")?.as_str()?.to_string();
            let body = row
                .get("body")
                .and_then(|b| b.as_str())
                .unwrap_or_default()
                .to_string();
            Some((name, body))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_columns_ignores_order() {
        let a = vec!["a".to_string(), "b".to_string()];
        let b = vec!["b".to_string(), "a".to_string()];
        let c = vec!["a".to_string()];
        assert!(same_columns(&a, &b));
        assert!(!same_columns(&a, &c));
    }

    #[test]
    fn test_verify_report_completeness() {
        let mut report = VerifyReport {
            table_exists: true,
            primary_key_matches: true,
            cursor_table_exists: true,
            ..Default::default()
        };
        assert!(report.is_complete(false));
        assert!(!report.is_complete(true));
        report.changelog_exists = true;
        assert!(report.is_complete(true));
        report.stale_triggers.push("t_bisync_update".into());
        assert!(!report.is_complete(true));
    }
}
