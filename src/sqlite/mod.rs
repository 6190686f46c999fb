// ABOUTME: SQLite driver for the Connection trait
// ABOUTME: Runs blocking rusqlite calls on the blocking pool behind a shared mutex

pub mod converter;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params_from_iter, ErrorCode, TransactionBehavior};
use serde_json::Value;

use crate::adapter::sql::MARKER_TABLE;
use crate::adapter::{describe, first_count, with_timeout, AtomicBatch, Connection, Dialect, Row};
use crate::config::EndpointConfig;
use crate::error::{Result, SyncError};
use converter::{json_to_sqlite_value, sqlite_row_to_json};

pub struct SqliteConnection {
    endpoint_id: String,
    path: PathBuf,
    conn: Arc<Mutex<rusqlite::Connection>>,
    timeout: Duration,
}

/// Strip an optional `sqlite://` prefix from a DSN.
pub fn sqlite_path(dsn: &str) -> PathBuf {
    let trimmed = dsn.trim();
    let path = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed);
    PathBuf::from(path)
}

impl SqliteConnection {
    pub async fn open(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        let path = sqlite_path(&endpoint.dsn);
        let endpoint_id = endpoint.id.clone();
        let open_path = path.clone();
        let id = endpoint_id.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&open_path).map_err(|e| classify(&id, e))?;
            conn.busy_timeout(timeout).map_err(|e| classify(&id, e))?;
            conn.pragma_update(None, "journal_mode", "wal")
                .map_err(|e| classify(&id, e))?;
            Ok::<_, SyncError>(conn)
        })
        .await
        .map_err(|e| SyncError::connectivity(&endpoint_id, e))??;

        tracing::debug!("Opened SQLite endpoint '{}' at {}", endpoint_id, path.display());
        Ok(Self {
            endpoint_id,
            path,
            conn: Arc::new(Mutex::new(conn)),
            timeout,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn blocking<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection, &str) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let id = self.endpoint_id.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| SyncError::connectivity(&id, "connection mutex poisoned"))?;
            f(&mut guard, &id)
        });
        with_timeout(&self.endpoint_id, operation, self.timeout, async {
            task.await
                .map_err(|e| SyncError::connectivity(&self.endpoint_id, e))?
        })
        .await
    }
}

fn query_rows(conn: &rusqlite::Connection, id: &str, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql).map_err(|e| classify(id, e))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt
        .query(params_from_iter(params.iter().map(json_to_sqlite_value)))
        .map_err(|e| classify(id, e))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| classify(id, e))? {
        out.push(sqlite_row_to_json(row, &columns).map_err(|e| SyncError::schema(id, format!("{e:#}")))?);
    }
    Ok(out)
}

fn execute(conn: &rusqlite::Connection, id: &str, sql: &str, params: &[Value]) -> Result<u64> {
    conn.execute(sql, params_from_iter(params.iter().map(json_to_sqlite_value)))
        .map(|n| n as u64)
        .map_err(|e| classify(id, e))
}

#[async_trait]
impl Connection for SqliteConnection {
    fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.blocking(&describe(&sql), move |conn, id| {
            let tx = conn.transaction().map_err(|e| classify(id, e))?;
            tx.execute_batch(&sql).map_err(|e| classify(id, e))?;
            tx.commit().map_err(|e| classify(id, e))
        })
        .await
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.blocking(&describe(&sql), move |conn, id| {
            query_rows(conn, id, &sql, &params)
        })
        .await
    }

    async fn execute_write(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.blocking(&describe(&sql), move |conn, id| {
            execute(conn, id, &sql, &params)
        })
        .await
    }

    async fn execute_atomic(&self, batch: &AtomicBatch) -> Result<u64> {
        let batch = batch.clone();
        self.blocking("atomic batch", move |conn, id| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| classify(id, e))?;
            let marker = format!("\"{MARKER_TABLE}\"");

            if let Some(from) = &batch.applying_from {
                execute(&tx, id, &format!("DELETE FROM {marker}"), &[])?;
                execute(
                    &tx,
                    id,
                    &format!("INSERT INTO {marker} (endpoint_id) VALUES (?)"),
                    &[Value::String(from.clone())],
                )?;
            }

            for guard in &batch.guards {
                let pending = first_count(&query_rows(&tx, id, &guard.sql, &guard.params)?);
                if pending > 0 {
                    return Err(SyncError::ConcurrentChange {
                        endpoint: id.to_string(),
                        keys: pending as usize,
                    });
                }
            }

            let mut affected = 0;
            for stmt in &batch.statements {
                affected += execute(&tx, id, &stmt.sql, &stmt.params)?;
            }

            if batch.applying_from.is_some() {
                execute(&tx, id, &format!("DELETE FROM {marker}"), &[])?;
            }
            tx.commit().map_err(|e| classify(id, e))?;
            Ok(affected)
        })
        .await
    }
}

/// Map a rusqlite error onto the engine's taxonomy.
pub fn classify(endpoint: &str, err: rusqlite::Error) -> SyncError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    };
    match code {
        Some(ErrorCode::ConstraintViolation) => SyncError::apply(endpoint, err),
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::FileLockingProtocolFailed,
        ) => SyncError::connectivity(endpoint, err),
        _ => SyncError::schema(endpoint, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Statement;
    use serde_json::json;
    use tempfile::tempdir;

    fn endpoint(path: &std::path::Path) -> EndpointConfig {
        EndpointConfig {
            id: "laptop".into(),
            dialect: Dialect::Sqlite,
            dsn: path.display().to_string(),
            schema: None,
            connect_timeout_secs: 5,
        }
    }

    #[test]
    fn test_sqlite_path_strips_scheme() {
        assert_eq!(sqlite_path("sqlite:///tmp/a.db"), PathBuf::from("/tmp/a.db"));
        assert_eq!(sqlite_path("/tmp/a.db"), PathBuf::from("/tmp/a.db"));
    }

    #[tokio::test]
    async fn test_query_and_write_round_trip() {
        let dir = tempdir().unwrap();
        let conn = SqliteConnection::open(&endpoint(&dir.path().join("a.db")), Duration::from_secs(5))
            .await
            .unwrap();
        conn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .await
            .unwrap();
        let written = conn
            .execute_write("INSERT INTO t (id, name) VALUES (?, ?)", &[json!(1), json!("Ada")])
            .await
            .unwrap();
        assert_eq!(written, 1);
        let rows = conn
            .execute_query("SELECT id, name FROM t WHERE id = ?", &[json!(1)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn test_constraint_violation_is_apply_error() {
        let dir = tempdir().unwrap();
        let conn = SqliteConnection::open(&endpoint(&dir.path().join("a.db")), Duration::from_secs(5))
            .await
            .unwrap();
        conn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .await
            .unwrap();
        let err = conn
            .execute_write("INSERT INTO t (id, name) VALUES (?, NULL)", &[json!(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Apply { .. }));

        let err = conn
            .execute_query("SELECT * FROM missing", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Schema { .. }));
    }

    #[tokio::test]
    async fn test_failed_ddl_batch_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let conn = SqliteConnection::open(&endpoint(&dir.path().join("a.db")), Duration::from_secs(5))
            .await
            .unwrap();
        conn.execute_ddl(
            "CREATE TABLE t (id INTEGER PRIMARY KEY);
             CREATE TRIGGER t_keep AFTER INSERT ON t BEGIN SELECT 1; END",
        )
        .await
        .unwrap();

        let err = conn
            .execute_ddl(
                "DROP TRIGGER IF EXISTS t_keep;
                 CREATE TRIGGER t_keep AFTER INSERT ON missing BEGIN SELECT 1; END",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Schema { .. }), "{err}");

        let triggers = conn
            .execute_query(
                "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'trigger' AND name = 't_keep'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(triggers[0]["n"], json!(1));
    }

    #[tokio::test]
    async fn test_atomic_batch_rolls_back_on_guard() {
        let dir = tempdir().unwrap();
        let conn = SqliteConnection::open(&endpoint(&dir.path().join("a.db")), Duration::from_secs(5))
            .await
            .unwrap();
        conn.execute_ddl(
            "CREATE TABLE t (id INTEGER PRIMARY KEY);
             CREATE TABLE \"_bisync_apply_marker\" (endpoint_id TEXT NOT NULL);",
        )
        .await
        .unwrap();

        let mut batch = AtomicBatch::new(Some("cloud".into()));
        batch.statements.push(Statement::new("INSERT INTO t (id) VALUES (?)", vec![json!(1)]));
        batch
            .guards
            .push(Statement::new("SELECT COUNT(*) AS pending FROM t WHERE id = 99", vec![]));
        assert_eq!(conn.execute_atomic(&batch).await.unwrap(), 1);

        let mut blocked = AtomicBatch::new(Some("cloud".into()));
        blocked
            .statements
            .push(Statement::new("INSERT INTO t (id) VALUES (?)", vec![json!(2)]));
        blocked
            .guards
            .push(Statement::new("SELECT COUNT(*) AS pending FROM t", vec![]));
        let err = conn.execute_atomic(&blocked).await.unwrap_err();
        assert!(matches!(err, SyncError::ConcurrentChange { .. }));

        let rows = conn.execute_query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        let marker = conn
            .execute_query("SELECT COUNT(*) AS n FROM \"_bisync_apply_marker\"", &[])
            .await
            .unwrap();
        assert_eq!(marker[0]["n"], json!(0));
    }
}
