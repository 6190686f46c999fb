// ABOUTME: PostgreSQL driver for the Connection trait
// ABOUTME: Typed parameter binding from JSON, TLS when sslmode=require, SQLSTATE classification

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, GenericClient, NoTls};

use crate::adapter::sql::PG_APPLYING_SETTING;
use crate::adapter::{describe, first_count, with_timeout, AtomicBatch, Connection, Dialect, Row};
use crate::config::EndpointConfig;
use crate::error::{Result, SyncError};

pub struct PgConnection {
    endpoint_id: String,
    schema: String,
    client: Mutex<Client>,
    timeout: Duration,
}

impl PgConnection {
    pub async fn connect(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        let mut config: tokio_postgres::Config = endpoint
            .dsn
            .parse()
            .map_err(|e| SyncError::config(format!("endpoint '{}': invalid dsn: {e}", endpoint.id)))?;
        config.connect_timeout(Duration::from_secs(endpoint.connect_timeout_secs.max(1)));
        config.application_name("database-bisync");

        let id = endpoint.id.clone();
        let client = if config.get_ssl_mode() == SslMode::Require {
            let connector = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| SyncError::connectivity(&id, format!("TLS setup failed: {e}")))?;
            let tls = postgres_native_tls::MakeTlsConnector::new(connector);
            let (client, connection) = config.connect(tls).await.map_err(|e| classify(&id, e))?;
            let endpoint_id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("PostgreSQL connection for '{}' closed: {}", endpoint_id, e);
                }
            });
            client
        } else {
            let (client, connection) = config.connect(NoTls).await.map_err(|e| classify(&id, e))?;
            let endpoint_id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("PostgreSQL connection for '{}' closed: {}", endpoint_id, e);
                }
            });
            client
        };

        tracing::debug!("Connected to PostgreSQL endpoint '{}'", id);
        Ok(Self {
            endpoint_id: id,
            schema: endpoint.schema().to_string(),
            client: Mutex::new(client),
            timeout,
        })
    }
}

async fn query_json<C: GenericClient + Sync>(
    client: &C,
    id: &str,
    sql: &str,
    params: &[Value],
) -> Result<Vec<Row>> {
    let stmt = client.prepare(sql).await.map_err(|e| classify(id, e))?;
    let boxed = bind_params(id, stmt.params(), params)?;
    let refs: Vec<&(dyn ToSql + Sync)> = boxed
        .iter()
        .map(|v| v.as_ref() as &(dyn ToSql + Sync))
        .collect();
    let rows = client
        .query(&stmt, &refs)
        .await
        .map_err(|e| classify(id, e))?;
    Ok(rows.iter().map(row_to_json).collect())
}

async fn execute_json<C: GenericClient + Sync>(
    client: &C,
    id: &str,
    sql: &str,
    params: &[Value],
) -> Result<u64> {
    let stmt = client.prepare(sql).await.map_err(|e| classify(id, e))?;
    let boxed = bind_params(id, stmt.params(), params)?;
    let refs: Vec<&(dyn ToSql + Sync)> = boxed
        .iter()
        .map(|v| v.as_ref() as &(dyn ToSql + Sync))
        .collect();
    client
        .execute(&stmt, &refs)
        .await
        .map_err(|e| classify(id, e))
}

#[async_trait]
impl Connection for PgConnection {
    fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn schema(&self) -> Option<&str> {
        Some(&self.schema)
    }

    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        with_timeout(&self.endpoint_id, &describe(sql), self.timeout, async {
            let client = self.client.lock().await;
            client
                .batch_execute(sql)
                .await
                .map_err(|e| classify(&self.endpoint_id, e))
        })
        .await
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        with_timeout(&self.endpoint_id, &describe(sql), self.timeout, async {
            let client = self.client.lock().await;
            query_json(&*client, &self.endpoint_id, sql, params).await
        })
        .await
    }

    async fn execute_write(&self, sql: &str, params: &[Value]) -> Result<u64> {
        with_timeout(&self.endpoint_id, &describe(sql), self.timeout, async {
            let client = self.client.lock().await;
            execute_json(&*client, &self.endpoint_id, sql, params).await
        })
        .await
    }

    async fn execute_atomic(&self, batch: &AtomicBatch) -> Result<u64> {
        let id = self.endpoint_id.as_str();
        with_timeout(id, "atomic batch", self.timeout, async {
            let mut client = self.client.lock().await;
            let tx = client.transaction().await.map_err(|e| classify(id, e))?;

            if let Some(from) = &batch.applying_from {
                tx.execute(
                    "SELECT set_config($1, $2, true)",
                    &[&PG_APPLYING_SETTING, from],
                )
                .await
                .map_err(|e| classify(id, e))?;
            }

            for guard in &batch.guards {
                let pending = first_count(&query_json(&tx, id, &guard.sql, &guard.params).await?);
                if pending > 0 {
                    // Dropping the transaction rolls it back.
                    return Err(SyncError::ConcurrentChange {
                        endpoint: id.to_string(),
                        keys: pending as usize,
                    });
                }
            }

            let mut affected = 0;
            for stmt in &batch.statements {
                affected += execute_json(&tx, id, &stmt.sql, &stmt.params).await?;
            }
            tx.commit().await.map_err(|e| classify(id, e))?;
            Ok(affected)
        })
        .await
    }
}

/// Box each JSON parameter as the Rust type matching the server-inferred parameter type.
fn bind_params(
    id: &str,
    types: &[Type],
    values: &[Value],
) -> Result<Vec<Box<dyn ToSql + Sync + Send>>> {
    if types.len() != values.len() {
        return Err(SyncError::schema(
            id,
            format!(
                "statement expects {} parameters, got {}",
                types.len(),
                values.len()
            ),
        ));
    }
    types
        .iter()
        .zip(values)
        .map(|(ty, value)| json_to_param(id, ty, value))
        .collect()
}

fn json_to_param(id: &str, ty: &Type, value: &Value) -> Result<Box<dyn ToSql + Sync + Send>> {
    let mismatch = || SyncError::schema(id, format!("cannot bind {} as {}", value, ty.name()));
    let text = || match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    };
    let int = || -> Result<Option<i64>> {
        match value {
            Value::Null => Ok(None),
            other => crate::adapter::as_i64(other).map(Some).ok_or_else(mismatch),
        }
    };
    let float = || -> Result<Option<f64>> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => n.as_f64().map(Some).ok_or_else(mismatch),
            Value::String(s) => s.parse().map(Some).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        }
    };

    Ok(match *ty {
        Type::INT2 => Box::new(int()?.map(|v| v as i16)),
        Type::INT4 => Box::new(int()?.map(|v| v as i32)),
        Type::INT8 => Box::new(int()?),
        Type::FLOAT4 => Box::new(float()?.map(|v| v as f32)),
        Type::FLOAT8 => Box::new(float()?),
        Type::BOOL => Box::new(match value {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            other => Some(crate::adapter::as_i64(other).ok_or_else(mismatch)? != 0),
        }),
        Type::JSON | Type::JSONB => Box::new(match value {
            Value::Null => None,
            other => Some(other.clone()),
        }),
        Type::NUMERIC => Box::new(match text() {
            None => None,
            Some(s) => Some(s.parse::<rust_decimal::Decimal>().map_err(|_| mismatch())?),
        }),
        Type::UUID => Box::new(match text() {
            None => None,
            Some(s) => Some(s.parse::<uuid::Uuid>().map_err(|_| mismatch())?),
        }),
        Type::TIMESTAMPTZ => Box::new(match text() {
            None => None,
            Some(s) => Some(
                chrono::DateTime::parse_from_rfc3339(&s)
                    .map_err(|_| mismatch())?
                    .with_timezone(&chrono::Utc),
            ),
        }),
        _ => Box::new(text()),
    })
}

/// Convert a result row to JSON using the column types the server reported.
fn row_to_json(row: &tokio_postgres::Row) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            Type::OID => row
                .try_get::<_, Option<u32>>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::from(f64::from(v))),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            Type::BOOL => row
                .try_get::<_, Option<bool>>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx).ok().flatten(),
            Type::NUMERIC => row
                .try_get::<_, Option<rust_decimal::Decimal>>(idx)
                .ok()
                .flatten()
                .map(|d| Value::String(d.to_string())),
            Type::UUID => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .ok()
                .flatten()
                .map(|u| Value::String(u.to_string())),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_rfc3339())),
            _ => row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::String),
        };
        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    out
}

/// Map a tokio-postgres error onto the engine's taxonomy by SQLSTATE.
pub fn classify(endpoint: &str, err: tokio_postgres::Error) -> SyncError {
    let Some(code) = err.code().map(|c| c.code().to_string()) else {
        return SyncError::connectivity(endpoint, err);
    };
    classify_sqlstate(endpoint, &code, err)
}

fn classify_sqlstate(endpoint: &str, code: &str, err: impl ToString) -> SyncError {
    match code {
        c if c.starts_with("23") => SyncError::apply(endpoint, err),
        c if c.starts_with("08") || c.starts_with("28") || c.starts_with("57P") => {
            SyncError::connectivity(endpoint, err)
        }
        // serialization failure, deadlock, lock timeout
        "40001" | "40P01" | "55P03" => SyncError::connectivity(endpoint, err),
        _ => SyncError::schema(endpoint, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sqlstate_classification() {
        assert!(matches!(
            classify_sqlstate("pg", "23505", "duplicate key"),
            SyncError::Apply { .. }
        ));
        assert!(matches!(
            classify_sqlstate("pg", "42501", "permission denied"),
            SyncError::Schema { .. }
        ));
        assert!(matches!(
            classify_sqlstate("pg", "42P01", "undefined table"),
            SyncError::Schema { .. }
        ));
        assert!(matches!(
            classify_sqlstate("pg", "28P01", "bad password"),
            SyncError::Connectivity { .. }
        ));
        assert!(classify_sqlstate("pg", "40P01", "deadlock").is_retryable());
    }

    #[test]
    fn test_bind_params_checks_arity() {
        assert!(bind_params("pg", &[Type::INT8], &[]).is_err());
        assert_eq!(
            bind_params("pg", &[Type::INT8, Type::TEXT], &[json!(5), json!("a")])
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_json_to_param_rejects_mismatch() {
        assert!(json_to_param("pg", &Type::INT4, &json!("abc")).is_err());
        assert!(json_to_param("pg", &Type::INT4, &json!("12")).is_ok());
        assert!(json_to_param("pg", &Type::NUMERIC, &json!(12.5)).is_ok());
        assert!(json_to_param("pg", &Type::UUID, &json!("not-a-uuid")).is_err());
        assert!(json_to_param("pg", &Type::JSONB, &json!({"id": 1})).is_ok());
    }
}
