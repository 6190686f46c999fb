// ABOUTME: SQLite value conversion to and from JSON row images
// ABOUTME: Handles all SQLite storage classes with BLOB base64 encoding

use anyhow::{Context, Result};
use rusqlite::types::Value as SqliteValue;
use serde_json::Value as JsonValue;

use crate::model::RowImage;

/// Convert a single SQLite value to JSON
///
/// Maps SQLite types to JSON types:
/// - INTEGER → number (i64)
/// - REAL → number (f64)
/// - TEXT → string (UTF-8)
/// - BLOB → object with base64-encoded data
/// - NULL → null
///
/// # Examples
///
/// ```
/// # use database_bisync::sqlite::converter::sqlite_value_to_json;
/// # use rusqlite::types::Value;
/// let json = sqlite_value_to_json(&Value::Integer(42)).unwrap();
/// assert_eq!(json, serde_json::json!(42));
/// ```
pub fn sqlite_value_to_json(value: &SqliteValue) -> Result<JsonValue> {
    match value {
        SqliteValue::Null => Ok(JsonValue::Null),

        SqliteValue::Integer(i) => Ok(JsonValue::Number((*i).into())),

        SqliteValue::Real(f) => {
            // JSON can't represent NaN or Infinity
            if f.is_finite() {
                serde_json::Number::from_f64(*f)
                    .map(JsonValue::Number)
                    .ok_or_else(|| anyhow::anyhow!("Failed to convert float {} to JSON number", f))
            } else {
                Ok(JsonValue::String(f.to_string()))
            }
        }

        SqliteValue::Text(s) => Ok(JsonValue::String(s.clone())),

        SqliteValue::Blob(b) => {
            // Format: {"_type": "blob", "data": "base64..."}
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b);
            Ok(serde_json::json!({
                "_type": "blob",
                "data": encoded
            }))
        }
    }
}

/// Convert a JSON value into a SQLite parameter
///
/// Booleans become 0/1, nested objects and arrays are stored as JSON text, and the
/// `{"_type": "blob"}` shape produced by [`sqlite_value_to_json`] is decoded back to a BLOB.
///
/// # Examples
///
/// ```
/// # use database_bisync::sqlite::converter::json_to_sqlite_value;
/// # use rusqlite::types::Value;
/// assert_eq!(json_to_sqlite_value(&serde_json::json!(true)), Value::Integer(1));
/// assert_eq!(json_to_sqlite_value(&serde_json::json!("x")), Value::Text("x".into()));
/// ```
pub fn json_to_sqlite_value(value: &JsonValue) -> SqliteValue {
    match value {
        JsonValue::Null => SqliteValue::Null,
        JsonValue::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqliteValue::Integer(i),
            None => SqliteValue::Real(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => SqliteValue::Text(s.clone()),
        JsonValue::Object(map) => {
            if let (Some(JsonValue::String(kind)), Some(JsonValue::String(data))) =
                (map.get("_type"), map.get("data"))
            {
                if kind == "blob" {
                    if let Ok(bytes) =
                        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
                    {
                        return SqliteValue::Blob(bytes);
                    }
                }
            }
            SqliteValue::Text(value.to_string())
        }
        JsonValue::Array(_) => SqliteValue::Text(value.to_string()),
    }
}

/// Convert a result row to a JSON object keyed by column name
pub fn sqlite_row_to_json(row: &rusqlite::Row<'_>, columns: &[String]) -> Result<RowImage> {
    let mut json_obj = RowImage::new();

    for (idx, col_name) in columns.iter().enumerate() {
        let value: SqliteValue = row
            .get(idx)
            .with_context(|| format!("Failed to read column '{}'", col_name))?;
        let json_value = sqlite_value_to_json(&value)
            .with_context(|| format!("Failed to convert column '{}' to JSON", col_name))?;
        json_obj.insert(col_name.clone(), json_value);
    }

    Ok(json_obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_convert_integer() {
        let json = sqlite_value_to_json(&SqliteValue::Integer(42)).unwrap();
        assert_eq!(json, serde_json::json!(42));
    }

    #[test]
    fn test_convert_real() {
        let json = sqlite_value_to_json(&SqliteValue::Real(42.75)).unwrap();
        assert_eq!(json, serde_json::json!(42.75));
    }

    #[test]
    fn test_convert_non_finite_real() {
        let json = sqlite_value_to_json(&SqliteValue::Real(f64::INFINITY)).unwrap();
        assert_eq!(json, serde_json::json!("inf"));
    }

    #[test]
    fn test_convert_null() {
        assert_eq!(
            sqlite_value_to_json(&SqliteValue::Null).unwrap(),
            JsonValue::Null
        );
    }

    #[test]
    fn test_blob_survives_both_directions() {
        let blob = SqliteValue::Blob(vec![0x00, 0xFF, 0x10]);
        let json = sqlite_value_to_json(&blob).unwrap();
        assert_eq!(json["_type"], "blob");
        assert_eq!(json_to_sqlite_value(&json), blob);
    }

    #[test]
    fn test_json_objects_become_text() {
        let value = serde_json::json!({"tags": ["a", "b"]});
        match json_to_sqlite_value(&value) {
            SqliteValue::Text(text) => assert_eq!(text, "{\"tags\":[\"a\",\"b\"]}"),
            other => panic!("expected text, got {:?}", other),
        }
        assert_eq!(
            json_to_sqlite_value(&serde_json::json!(1.5)),
            SqliteValue::Real(1.5)
        );
    }

    #[test]
    fn test_row_to_json_uses_column_names() {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = conn
            .prepare("SELECT 1 AS id, 'Alice' AS name, NULL AS note")
            .unwrap();
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([]).unwrap();
        let row = rows.next().unwrap().unwrap();
        let json = sqlite_row_to_json(row, &columns).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["name"], "Alice");
        assert_eq!(json["note"], JsonValue::Null);
    }
}
