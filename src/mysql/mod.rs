// ABOUTME: MySQL driver for the Connection trait
// ABOUTME: Binary-protocol statements with JSON parameters and server error code classification

use std::time::Duration;

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, Params, Transaction, TxOpts, Value as MyValue};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::adapter::sql::MYSQL_APPLYING_VAR;
use crate::adapter::{describe, first_count, with_timeout, AtomicBatch, Connection, Dialect, Row};
use crate::config::EndpointConfig;
use crate::error::{Result, SyncError};

pub struct MySqlConnection {
    endpoint_id: String,
    conn: Mutex<Conn>,
    timeout: Duration,
}

impl MySqlConnection {
    pub async fn connect(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        let dsn = endpoint
            .dsn
            .trim()
            .replacen("mariadb://", "mysql://", 1);
        let opts = Opts::from_url(&dsn)
            .map_err(|e| SyncError::config(format!("endpoint '{}': invalid dsn: {e}", endpoint.id)))?;
        let conn = Conn::new(opts)
            .await
            .map_err(|e| classify(&endpoint.id, e))?;
        tracing::debug!("Connected to MySQL endpoint '{}'", endpoint.id);
        Ok(Self {
            endpoint_id: endpoint.id.clone(),
            conn: Mutex::new(conn),
            timeout,
        })
    }
}

fn to_params(values: &[Value]) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values.iter().map(json_to_mysql).collect())
    }
}

async fn query_rows<Q: Queryable>(conn: &mut Q, id: &str, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let rows: Vec<mysql_async::Row> = conn
        .exec(sql, to_params(params))
        .await
        .map_err(|e| classify(id, e))?;
    Ok(rows.iter().map(row_to_json).collect())
}

async fn apply_in_tx(tx: &mut Transaction<'_>, id: &str, batch: &AtomicBatch) -> Result<u64> {
    if let Some(from) = &batch.applying_from {
        let set_marker = format!("SET {MYSQL_APPLYING_VAR} = ?");
        tx.exec_drop(
            set_marker.as_str(),
            Params::Positional(vec![MyValue::from(from.as_str())]),
        )
        .await
        .map_err(|e| classify(id, e))?;
    }

    for guard in &batch.guards {
        let pending = first_count(&query_rows(tx, id, &guard.sql, &guard.params).await?);
        if pending > 0 {
            return Err(SyncError::ConcurrentChange {
                endpoint: id.to_string(),
                keys: pending as usize,
            });
        }
    }

    let mut affected = 0;
    for stmt in &batch.statements {
        tx.exec_drop(stmt.sql.as_str(), to_params(&stmt.params))
            .await
            .map_err(|e| classify(id, e))?;
        affected += tx.affected_rows();
    }
    Ok(affected)
}

#[async_trait]
impl Connection for MySqlConnection {
    fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        // Text protocol: CREATE TRIGGER cannot be prepared.
        with_timeout(&self.endpoint_id, &describe(sql), self.timeout, async {
            let mut conn = self.conn.lock().await;
            conn.query_drop(sql)
                .await
                .map_err(|e| classify(&self.endpoint_id, e))
        })
        .await
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        with_timeout(&self.endpoint_id, &describe(sql), self.timeout, async {
            let mut conn = self.conn.lock().await;
            query_rows(&mut *conn, &self.endpoint_id, sql, params).await
        })
        .await
    }

    async fn execute_write(&self, sql: &str, params: &[Value]) -> Result<u64> {
        with_timeout(&self.endpoint_id, &describe(sql), self.timeout, async {
            let mut conn = self.conn.lock().await;
            conn.exec_drop(sql, to_params(params))
                .await
                .map_err(|e| classify(&self.endpoint_id, e))?;
            Ok(conn.affected_rows())
        })
        .await
    }

    async fn execute_atomic(&self, batch: &AtomicBatch) -> Result<u64> {
        let id = self.endpoint_id.as_str();
        with_timeout(id, "atomic batch", self.timeout, async {
            let mut conn = self.conn.lock().await;
            let result = {
                let mut tx = conn
                    .start_transaction(TxOpts::default())
                    .await
                    .map_err(|e| classify(id, e))?;
                match apply_in_tx(&mut tx, id, batch).await {
                    Ok(affected) => tx
                        .commit()
                        .await
                        .map(|_| affected)
                        .map_err(|e| classify(id, e)),
                    Err(e) => {
                        if let Err(rollback) = tx.rollback().await {
                            tracing::warn!("Rollback on '{}' failed: {}", id, rollback);
                        }
                        Err(e)
                    }
                }
            };

            // The marker is a session variable: clear it whether the transaction committed or not.
            if batch.applying_from.is_some() {
                let clear_marker = format!("SET {MYSQL_APPLYING_VAR} = NULL");
                let cleared = conn
                    .query_drop(clear_marker.as_str())
                    .await
                    .map_err(|e| classify(id, e));
                if result.is_ok() {
                    cleared?;
                }
            }
            result
        })
        .await
    }
}

fn json_to_mysql(value: &Value) -> MyValue {
    match value {
        Value::Null => MyValue::NULL,
        Value::Bool(b) => MyValue::Int(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MyValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                MyValue::UInt(u)
            } else {
                MyValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => MyValue::Bytes(s.as_bytes().to_vec()),
        other => MyValue::Bytes(other.to_string().into_bytes()),
    }
}

fn row_to_json(row: &mysql_async::Row) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns_ref().iter().enumerate() {
        let value = row
            .as_ref(idx)
            .map(|v| mysql_to_json(v, column.column_type()))
            .unwrap_or(Value::Null);
        out.insert(column.name_str().into_owned(), value);
    }
    out
}

fn mysql_to_json(value: &MyValue, column_type: ColumnType) -> Value {
    match value {
        MyValue::NULL => Value::Null,
        MyValue::Int(i) => Value::from(*i),
        MyValue::UInt(u) => Value::from(*u),
        MyValue::Float(f) => Value::from(f64::from(*f)),
        MyValue::Double(d) => Value::from(*d),
        MyValue::Bytes(bytes) => {
            if column_type == ColumnType::MYSQL_TYPE_JSON {
                if let Ok(parsed) = serde_json::from_slice(bytes) {
                    return parsed;
                }
            }
            match std::str::from_utf8(bytes) {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => serde_json::json!({
                    "_type": "blob",
                    "data": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes),
                }),
            }
        }
        MyValue::Date(year, month, day, hour, minute, second, micros) => Value::String(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        )),
        MyValue::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u32::from(*hours) + days * 24;
            Value::String(format!(
                "{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}

/// Map a mysql_async error onto the engine's taxonomy by server error code.
pub fn classify(endpoint: &str, err: mysql_async::Error) -> SyncError {
    match &err {
        mysql_async::Error::Server(server) => classify_code(endpoint, server.code, err.to_string()),
        mysql_async::Error::Url(_) => SyncError::config(format!("endpoint '{endpoint}': {err}")),
        _ => SyncError::connectivity(endpoint, err),
    }
}

fn classify_code(endpoint: &str, code: u16, message: String) -> SyncError {
    match code {
        // duplicate key, foreign key, NOT NULL, check constraint
        1062 | 1451 | 1452 | 1048 | 1216 | 1217 | 3819 => SyncError::apply(endpoint, message),
        // access denied to database / bad credentials / lost connection
        1044 | 1045 | 2002 | 2003 | 2006 | 2013 => SyncError::connectivity(endpoint, message),
        // lock wait timeout, deadlock
        1205 | 1213 => SyncError::connectivity(endpoint, message),
        _ => SyncError::schema(endpoint, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_codes() {
        assert!(matches!(
            classify_code("my", 1062, "Duplicate entry".into()),
            SyncError::Apply { .. }
        ));
        assert!(matches!(
            classify_code("my", 1142, "command denied".into()),
            SyncError::Schema { .. }
        ));
        assert!(matches!(
            classify_code("my", 1146, "table doesn't exist".into()),
            SyncError::Schema { .. }
        ));
        assert!(classify_code("my", 1213, "Deadlock".into()).is_retryable());
        assert!(classify_code("my", 1045, "Access denied".into()).is_retryable());
    }

    #[test]
    fn test_json_to_mysql_values() {
        assert_eq!(json_to_mysql(&json!(null)), MyValue::NULL);
        assert_eq!(json_to_mysql(&json!(true)), MyValue::Int(1));
        assert_eq!(json_to_mysql(&json!(7)), MyValue::Int(7));
        assert_eq!(json_to_mysql(&json!(1.5)), MyValue::Double(1.5));
        assert_eq!(
            json_to_mysql(&json!("Ada")),
            MyValue::Bytes(b"Ada".to_vec())
        );
        assert_eq!(
            json_to_mysql(&json!({"a": 1})),
            MyValue::Bytes(b"{\"a\":1}".to_vec())
        );
    }

    #[test]
    fn test_mysql_to_json_values() {
        assert_eq!(
            mysql_to_json(&MyValue::Bytes(b"{\"id\":1}".to_vec()), ColumnType::MYSQL_TYPE_JSON),
            json!({"id": 1})
        );
        assert_eq!(
            mysql_to_json(&MyValue::Bytes(b"{\"id\":1}".to_vec()), ColumnType::MYSQL_TYPE_VAR_STRING),
            json!("{\"id\":1}")
        );
        assert_eq!(
            mysql_to_json(&MyValue::Date(2024, 3, 9, 14, 5, 0, 120), ColumnType::MYSQL_TYPE_DATETIME),
            json!("2024-03-09 14:05:00.000120")
        );
        assert_eq!(
            mysql_to_json(&MyValue::Bytes(vec![0xff, 0xfe]), ColumnType::MYSQL_TYPE_BLOB)["_type"],
            json!("blob")
        );
    }
}
