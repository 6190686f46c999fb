// ABOUTME: Database adapter seam shared by the PostgreSQL, MySQL, and SQLite drivers
// ABOUTME: One async Connection trait plus catalog helpers built on top of it

pub mod sql;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::EndpointConfig;
use crate::error::{Result, SyncError};
use crate::model::RowImage;

pub use sql::{Dialect, Statement, TableName};

/// A result row: column name to JSON value.
pub type Row = RowImage;

/// Everything one `execute_atomic` call commits or rolls back together.
#[derive(Debug, Clone, Default)]
pub struct AtomicBatch {
    /// Endpoint id recorded as `applied_from` by capture triggers fired inside the transaction.
    pub applying_from: Option<String>,
    /// Queries returning a single count; any non-zero count aborts the transaction.
    pub guards: Vec<Statement>,
    pub statements: Vec<Statement>,
}

impl AtomicBatch {
    pub fn new(applying_from: Option<String>) -> Self {
        Self {
            applying_from,
            guards: Vec::new(),
            statements: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// A live connection to one endpoint.
///
/// Implementations bound every call by the endpoint's statement timeout and never open an
/// implicit transaction; `execute_atomic` is the only transactional entry point.
#[async_trait]
pub trait Connection: Send + Sync {
    fn endpoint_id(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Schema that unqualified support tables live in (PostgreSQL only).
    fn schema(&self) -> Option<&str> {
        None
    }

    async fn execute_ddl(&self, sql: &str) -> Result<()>;

    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn execute_write(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run guards then statements in one transaction with the echo marker set.
    ///
    /// Returns the number of affected rows. A guard returning a non-zero count rolls back and
    /// fails with [`SyncError::ConcurrentChange`].
    async fn execute_atomic(&self, batch: &AtomicBatch) -> Result<u64>;
}

/// Open a connection to `endpoint`, failing with `Connectivity` on auth, network, or timeout.
pub async fn connect(
    endpoint: &EndpointConfig,
    statement_timeout: Duration,
) -> Result<Arc<dyn Connection>> {
    let connect_timeout = Duration::from_secs(endpoint.connect_timeout_secs.max(1));
    tracing::debug!(
        "Connecting to endpoint '{}' ({}) at {}",
        endpoint.id,
        endpoint.dialect.as_str(),
        endpoint.display_dsn()
    );
    let connecting = async {
        let conn: Arc<dyn Connection> = match endpoint.dialect {
            Dialect::Postgres => Arc::new(
                crate::postgres::PgConnection::connect(endpoint, statement_timeout).await?,
            ),
            Dialect::MySql => Arc::new(
                crate::mysql::MySqlConnection::connect(endpoint, statement_timeout).await?,
            ),
            Dialect::Sqlite => Arc::new(
                crate::sqlite::SqliteConnection::open(endpoint, statement_timeout).await?,
            ),
        };
        Ok::<_, SyncError>(conn)
    };
    match tokio::time::timeout(connect_timeout, connecting).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::connectivity(
            &endpoint.id,
            format!("connect timed out after {}s", connect_timeout.as_secs()),
        )),
    }
}

/// Run `operation` under `limit`, turning an elapsed deadline into a retryable `Timeout`.
pub(crate) async fn with_timeout<T, F>(
    endpoint: &str,
    operation: &str,
    limit: Duration,
    future: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            endpoint: endpoint.to_string(),
            operation: operation.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

/// Short form of a statement for error messages.
pub(crate) fn describe(sql: &str) -> String {
    let flat = crate::utils::normalize_sql(sql);
    if flat.len() > 80 {
        let cut = flat
            .char_indices()
            .take_while(|(i, _)| *i < 77)
            .map(|(i, c)| i + c.len_utf8())
            .last()
            .unwrap_or(0);
        format!("{}...", &flat[..cut])
    } else {
        flat
    }
}

// ----- catalog helpers -----

pub async fn run_query(conn: &dyn Connection, stmt: &Statement) -> Result<Vec<Row>> {
    conn.execute_query(&stmt.sql, &stmt.params).await
}

pub async fn table_exists(conn: &dyn Connection, table: &TableName) -> Result<bool> {
    let rows = run_query(conn, &conn.dialect().table_exists(table)).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("present"))
        .map(truthy)
        .unwrap_or(false))
}

pub async fn table_columns(conn: &dyn Connection, table: &TableName) -> Result<Vec<String>> {
    names(run_query(conn, &conn.dialect().columns(table)).await?)
}

pub async fn primary_key_columns(conn: &dyn Connection, table: &TableName) -> Result<Vec<String>> {
    names(run_query(conn, &conn.dialect().primary_key(table)).await?)
}

/// User tables, without the changelog and support tables the engine creates.
pub async fn list_user_tables(conn: &dyn Connection) -> Result<Vec<String>> {
    let all = names(run_query(conn, &conn.dialect().list_tables(conn.schema())).await?)?;
    Ok(all
        .into_iter()
        .filter(|name| !sql::is_support_table(name))
        .collect())
}

/// Database clock in microseconds since the Unix epoch.
pub async fn database_clock(conn: &dyn Connection) -> Result<i64> {
    let rows = run_query(conn, &conn.dialect().clock()).await?;
    rows.first()
        .and_then(|row| row.get("now_micros"))
        .and_then(as_i64)
        .ok_or_else(|| SyncError::schema(conn.endpoint_id(), "database clock query returned no value"))
}

/// Sum of the first column of every row, read as an integer.
pub(crate) fn first_count(rows: &[Row]) -> i64 {
    rows.iter()
        .filter_map(|row| row.values().next())
        .filter_map(as_i64)
        .sum()
}

fn names(rows: Vec<Row>) -> Result<Vec<String>> {
    Ok(rows
        .into_iter()
        .filter_map(|mut row| match row.remove("name") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        })
        .collect())
}

/// Read an integer out of a JSON value that a driver may have delivered as number or text.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        other => as_i64(other).map(|n| n != 0).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_i64_accepts_driver_shapes() {
        assert_eq!(as_i64(&json!(42)), Some(42));
        assert_eq!(as_i64(&json!("17")), Some(17));
        assert_eq!(as_i64(&json!(true)), Some(1));
        assert_eq!(as_i64(&json!(null)), None);
        assert_eq!(as_i64(&json!({"a": 1})), None);
    }

    #[test]
    fn test_first_count_sums_rows() {
        let rows: Vec<Row> = vec![
            json!({"pending": 2}).as_object().cloned().unwrap(),
            json!({"pending": "3"}).as_object().cloned().unwrap(),
        ];
        assert_eq!(first_count(&rows), 5);
        assert_eq!(first_count(&[]), 0);
    }

    #[test]
    fn test_describe_truncates_long_sql() {
        let long = format!("SELECT {} FROM t", "x, ".repeat(50));
        let short = describe(&long);
        assert!(short.len() <= 83);
        assert!(short.ends_with("..."));
        assert_eq!(describe("SELECT 1\n"), "SELECT 1");
    }
}
