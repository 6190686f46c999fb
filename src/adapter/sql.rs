// ABOUTME: Dialect-specific SQL generation for changelog, triggers, cursors, and row writes
// ABOUTME: Every statement the engine runs is built here so drivers stay dialect-agnostic

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::RowImage;
use crate::utils::{quote_ident, quote_literal, quote_mysql_ident};

pub const CURSOR_TABLE: &str = "_bisync_cursor";
pub const MARKER_TABLE: &str = "_bisync_apply_marker";
pub const CHANGELOG_SUFFIX: &str = "_changelog";
pub const PG_APPLYING_SETTING: &str = "bisync.applying_from";
pub const MYSQL_APPLYING_VAR: &str = "@bisync_applying_from";

const CHANGELOG_COLUMNS: &str =
    "operation, pk_text, primary_key, row_data, origin, applied_from, changed_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "mariadb")]
    MySql,
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "sqlite3")]
    Sqlite,
}

/// A statement with positional parameters in the dialect's placeholder syntax.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A table name plus the schema it lives in (PostgreSQL only).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// A table in the same schema whose name is this one plus `suffix`.
    pub fn with_suffix(&self, suffix: &str) -> TableName {
        TableName {
            schema: self.schema.clone(),
            name: format!("{}{}", self.name, suffix),
        }
    }

    pub fn changelog(&self) -> TableName {
        self.with_suffix(CHANGELOG_SUFFIX)
    }

    pub fn sibling(&self, name: &str) -> TableName {
        TableName {
            schema: self.schema.clone(),
            name: name.to_string(),
        }
    }
}

/// One capture trigger and what its stored body must look like.
#[derive(Debug, Clone)]
pub struct TriggerDef {
    pub name: String,
    pub create_sql: String,
    /// Text the catalog reports for an up-to-date trigger.
    pub expected_body: String,
}

#[derive(Debug, Clone)]
pub struct CaptureDdl {
    /// PostgreSQL trigger function, created before the triggers.
    pub function_sql: Option<String>,
    pub triggers: Vec<TriggerDef>,
}

/// True for tables the engine itself creates.
pub fn is_support_table(name: &str) -> bool {
    name.starts_with("_bisync_") || name.ends_with(CHANGELOG_SUFFIX)
}

pub fn trigger_name(table: &str, verb: &str) -> String {
    format!("{table}_bisync_{verb}")
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }

    pub fn accepts_dsn(&self, dsn: &str) -> bool {
        let lower = dsn.trim().to_ascii_lowercase();
        match self {
            Dialect::Postgres => {
                lower.starts_with("postgres://") || lower.starts_with("postgresql://")
            }
            Dialect::MySql => lower.starts_with("mysql://") || lower.starts_with("mariadb://"),
            Dialect::Sqlite => {
                (!lower.is_empty() && !lower.contains("://")) || lower.starts_with("sqlite://")
            }
        }
    }

    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::MySql => quote_mysql_ident(ident),
            Dialect::Postgres | Dialect::Sqlite => quote_ident(ident),
        }
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn qualified(&self, table: &TableName) -> String {
        match (self, &table.schema) {
            (Dialect::Postgres, Some(schema)) => {
                format!("{}.{}", self.quote(schema), self.quote(&table.name))
            }
            _ => self.quote(&table.name),
        }
    }

    fn quote_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    // ----- support tables -----

    pub fn support_tables_ddl(&self, schema: Option<&str>) -> Vec<String> {
        let cursor = self.qualified(&TableName::new(schema, CURSOR_TABLE));
        match self {
            Dialect::Postgres => vec![format!(
                "CREATE TABLE IF NOT EXISTS {cursor} (
                    source_endpoint TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    last_sequence_id BIGINT NOT NULL DEFAULT 0,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    PRIMARY KEY (source_endpoint, table_name)
                )"
            )],
            Dialect::MySql => vec![format!(
                "CREATE TABLE IF NOT EXISTS {cursor} (
                    source_endpoint VARCHAR(64) NOT NULL,
                    table_name VARCHAR(128) NOT NULL,
                    last_sequence_id BIGINT NOT NULL DEFAULT 0,
                    updated_at DATETIME(6) NOT NULL,
                    PRIMARY KEY (source_endpoint, table_name)
                )"
            )],
            Dialect::Sqlite => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {cursor} (
                        source_endpoint TEXT NOT NULL,
                        table_name TEXT NOT NULL,
                        last_sequence_id INTEGER NOT NULL DEFAULT 0,
                        updated_at TEXT NOT NULL,
                        PRIMARY KEY (source_endpoint, table_name)
                    )"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (endpoint_id TEXT NOT NULL)",
                    self.quote(MARKER_TABLE)
                ),
            ],
        }
    }

    pub fn changelog_ddl(&self, table: &TableName) -> Vec<String> {
        let changelog = table.changelog();
        let cl = self.qualified(&changelog);
        let index = self.quote(&format!("{}_pk_idx", changelog.name));
        match self {
            Dialect::Postgres => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {cl} (
                        sequence_id BIGSERIAL PRIMARY KEY,
                        operation TEXT NOT NULL,
                        pk_text TEXT NOT NULL,
                        primary_key JSONB NOT NULL,
                        row_data JSONB,
                        origin TEXT NOT NULL,
                        applied_from TEXT,
                        changed_at BIGINT NOT NULL
                    )"
                ),
                format!("CREATE INDEX IF NOT EXISTS {index} ON {cl} (pk_text, sequence_id)"),
            ],
            Dialect::MySql => vec![format!(
                "CREATE TABLE IF NOT EXISTS {cl} (
                    sequence_id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                    operation VARCHAR(8) NOT NULL,
                    pk_text VARCHAR(512) NOT NULL,
                    primary_key JSON NOT NULL,
                    row_data JSON NULL,
                    origin VARCHAR(64) NOT NULL,
                    applied_from VARCHAR(64) NULL,
                    changed_at BIGINT NOT NULL,
                    KEY {index} (pk_text, sequence_id)
                )"
            )],
            Dialect::Sqlite => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {cl} (
                        sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
                        operation TEXT NOT NULL,
                        pk_text TEXT NOT NULL,
                        primary_key TEXT NOT NULL,
                        row_data TEXT,
                        origin TEXT NOT NULL,
                        applied_from TEXT,
                        changed_at INTEGER NOT NULL
                    )"
                ),
                format!("CREATE INDEX IF NOT EXISTS {index} ON {cl} (pk_text, sequence_id)"),
            ],
        }
    }

    // ----- capture triggers -----

    /// Capture triggers for `table`. `columns` is the full column list (used by MySQL and SQLite,
    /// which cannot serialize a whole row), `pk` the primary key in key order.
    pub fn capture_ddl(
        &self,
        table: &TableName,
        columns: &[String],
        pk: &[String],
        origin: &str,
    ) -> CaptureDdl {
        match self {
            Dialect::Postgres => self.pg_capture_ddl(table, pk, origin),
            Dialect::MySql => self.mysql_capture_ddl(table, columns, pk, origin),
            Dialect::Sqlite => self.sqlite_capture_ddl(table, columns, pk, origin),
        }
    }

    fn pg_capture_ddl(&self, table: &TableName, pk: &[String], origin: &str) -> CaptureDdl {
        let cl = self.qualified(&table.changelog());
        let function = self.qualified(&table.with_suffix("_bisync_capture"));
        let target = self.qualified(table);
        let origin = quote_literal(origin);
        let pk_text = |row: &str| {
            let parts = pk
                .iter()
                .map(|c| format!("{row}.{}::text", self.quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("concat_ws('|', {parts})")
        };
        let pk_json = |row: &str| {
            let parts = pk
                .iter()
                .map(|c| format!("{}, {row}.{}", quote_literal(c), self.quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("jsonb_build_object({parts})")
        };
        let applied = format!("NULLIF(current_setting('{PG_APPLYING_SETTING}', true), '')");
        let clock = "(extract(epoch FROM clock_timestamp()) * 1000000)::bigint";

        let body = format!(
            "
BEGIN
    IF TG_OP = 'DELETE' THEN
        INSERT INTO {cl} ({CHANGELOG_COLUMNS})
        VALUES ('delete', {old_text}, {old_json}, NULL, {origin}, {applied}, {clock});
        RETURN OLD;
    END IF;
    INSERT INTO {cl} ({CHANGELOG_COLUMNS})
    VALUES (lower(TG_OP), {new_text}, {new_json}, to_jsonb(NEW), {origin}, {applied}, {clock});
    RETURN NEW;
END;
",
            old_text = pk_text("OLD"),
            old_json = pk_json("OLD"),
            new_text = pk_text("NEW"),
            new_json = pk_json("NEW"),
        );
        let function_sql = format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS $bisync${body}$bisync$"
        );

        let triggers = ["insert", "update", "delete"]
            .iter()
            .map(|verb| {
                let name = trigger_name(&table.name, verb);
                TriggerDef {
                    create_sql: format!(
                        "CREATE TRIGGER {} AFTER {} ON {target} FOR EACH ROW EXECUTE FUNCTION {function}()",
                        self.quote(&name),
                        verb.to_ascii_uppercase()
                    ),
                    name,
                    expected_body: body.clone(),
                }
            })
            .collect();

        CaptureDdl {
            function_sql: Some(function_sql),
            triggers,
        }
    }

    fn mysql_capture_ddl(
        &self,
        table: &TableName,
        columns: &[String],
        pk: &[String],
        origin: &str,
    ) -> CaptureDdl {
        let cl = self.qualified(&table.changelog());
        let target = self.qualified(table);
        let origin = quote_literal(origin);
        let json = |row: &str, cols: &[String]| {
            let parts = cols
                .iter()
                .map(|c| format!("{}, {row}.{}", quote_literal(c), self.quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("JSON_OBJECT({parts})")
        };
        let pk_text = |row: &str| {
            let parts = pk
                .iter()
                .map(|c| format!("{row}.{}", self.quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("CONCAT_WS('|', {parts})")
        };
        let clock = "CAST(UNIX_TIMESTAMP(NOW(6)) * 1000000 AS SIGNED)";

        let triggers = ["insert", "update", "delete"]
            .iter()
            .map(|verb| {
                let (row, image) = if *verb == "delete" {
                    ("OLD", "NULL".to_string())
                } else {
                    ("NEW", json("NEW", columns))
                };
                let body = format!(
                    "INSERT INTO {cl} ({CHANGELOG_COLUMNS}) VALUES ('{verb}', {}, {}, {image}, {origin}, {MYSQL_APPLYING_VAR}, {clock})",
                    pk_text(row),
                    json(row, pk),
                );
                let name = trigger_name(&table.name, verb);
                TriggerDef {
                    create_sql: format!(
                        "CREATE TRIGGER {} AFTER {} ON {target} FOR EACH ROW {body}",
                        self.quote(&name),
                        verb.to_ascii_uppercase()
                    ),
                    name,
                    expected_body: body,
                }
            })
            .collect();

        CaptureDdl {
            function_sql: None,
            triggers,
        }
    }

    fn sqlite_capture_ddl(
        &self,
        table: &TableName,
        columns: &[String],
        pk: &[String],
        origin: &str,
    ) -> CaptureDdl {
        let cl = self.qualified(&table.changelog());
        let target = self.qualified(table);
        let origin = quote_literal(origin);
        let json = |row: &str, cols: &[String]| {
            let parts = cols
                .iter()
                .map(|c| format!("{}, {row}.{}", quote_literal(c), self.quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("json_object({parts})")
        };
        let pk_text = |row: &str| {
            pk.iter()
                .map(|c| format!("CAST({row}.{} AS TEXT)", self.quote(c)))
                .collect::<Vec<_>>()
                .join(" || '|' || ")
        };
        let applied = format!(
            "(SELECT endpoint_id FROM {} LIMIT 1)",
            self.quote(MARKER_TABLE)
        );
        let clock = sqlite_clock_expr();

        let triggers = ["insert", "update", "delete"]
            .iter()
            .map(|verb| {
                let (row, image) = if *verb == "delete" {
                    ("OLD", "NULL".to_string())
                } else {
                    ("NEW", json("NEW", columns))
                };
                let name = trigger_name(&table.name, verb);
                let create_sql = format!(
                    "CREATE TRIGGER {} AFTER {} ON {target} FOR EACH ROW BEGIN INSERT INTO {cl} ({CHANGELOG_COLUMNS}) VALUES ('{verb}', {}, {}, {image}, {origin}, {applied}, {clock}); END",
                    self.quote(&name),
                    verb.to_ascii_uppercase(),
                    pk_text(row),
                    json(row, pk),
                );
                TriggerDef {
                    name,
                    expected_body: create_sql.clone(),
                    create_sql,
                }
            })
            .collect();

        CaptureDdl {
            function_sql: None,
            triggers,
        }
    }

    pub fn drop_trigger(&self, table: &TableName, trigger: &str) -> String {
        match self {
            Dialect::Postgres => format!(
                "DROP TRIGGER IF EXISTS {} ON {}",
                self.quote(trigger),
                self.qualified(table)
            ),
            Dialect::MySql | Dialect::Sqlite => {
                format!("DROP TRIGGER IF EXISTS {}", self.quote(trigger))
            }
        }
    }

    /// Drop and recreate `trigger` as one batch that takes effect as a whole.
    ///
    /// `None` on MySQL, where each DDL statement commits on its own.
    pub fn replace_trigger(&self, table: &TableName, trigger: &TriggerDef) -> Option<String> {
        match self {
            Dialect::MySql => None,
            Dialect::Postgres | Dialect::Sqlite => Some(format!(
                "{};\n{}",
                self.drop_trigger(table, &trigger.name),
                trigger.create_sql.trim_end().trim_end_matches(';')
            )),
        }
    }

    /// Statements removing triggers, trigger function, and changelog of `table`.
    pub fn teardown_ddl(&self, table: &TableName) -> Vec<String> {
        let mut statements: Vec<String> = ["insert", "update", "delete"]
            .iter()
            .map(|verb| self.drop_trigger(table, &trigger_name(&table.name, verb)))
            .collect();
        if *self == Dialect::Postgres {
            statements.push(format!(
                "DROP FUNCTION IF EXISTS {}()",
                self.qualified(&table.with_suffix("_bisync_capture"))
            ));
        }
        statements.push(format!(
            "DROP TABLE IF EXISTS {}",
            self.qualified(&table.changelog())
        ));
        statements
    }

    // ----- catalog -----

    /// Rows with `name` and `body` for every trigger on `table`.
    pub fn existing_triggers(&self, table: &TableName) -> Statement {
        match self {
            Dialect::Postgres => Statement::new(
                "SELECT t.tgname::text AS name, p.prosrc AS body
                 FROM pg_trigger t JOIN pg_proc p ON p.oid = t.tgfoid
                 WHERE t.tgrelid = to_regclass($1) AND NOT t.tgisinternal",
                vec![Value::String(self.qualified(table))],
            ),
            Dialect::MySql => Statement::new(
                "SELECT TRIGGER_NAME AS name, ACTION_STATEMENT AS body
                 FROM information_schema.TRIGGERS
                 WHERE TRIGGER_SCHEMA = DATABASE() AND EVENT_OBJECT_TABLE = ?",
                vec![Value::String(table.name.clone())],
            ),
            Dialect::Sqlite => Statement::new(
                "SELECT name, sql AS body FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?",
                vec![Value::String(table.name.clone())],
            ),
        }
    }

    /// One row with column `present` (non-zero / true when the table exists).
    pub fn table_exists(&self, table: &TableName) -> Statement {
        match self {
            Dialect::Postgres => Statement::new(
                "SELECT (to_regclass($1) IS NOT NULL) AS present",
                vec![Value::String(self.qualified(table))],
            ),
            Dialect::MySql => Statement::new(
                "SELECT COUNT(*) AS present FROM information_schema.TABLES
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
                vec![Value::String(table.name.clone())],
            ),
            Dialect::Sqlite => Statement::new(
                "SELECT COUNT(*) AS present FROM sqlite_master WHERE type = 'table' AND name = ?",
                vec![Value::String(table.name.clone())],
            ),
        }
    }

    /// Rows with column `name`, in ordinal order.
    pub fn columns(&self, table: &TableName) -> Statement {
        match self {
            Dialect::Postgres => Statement::new(
                "SELECT attname::text AS name FROM pg_attribute
                 WHERE attrelid = to_regclass($1) AND attnum > 0 AND NOT attisdropped
                 ORDER BY attnum",
                vec![Value::String(self.qualified(table))],
            ),
            Dialect::MySql => Statement::new(
                "SELECT COLUMN_NAME AS name FROM information_schema.COLUMNS
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
                 ORDER BY ORDINAL_POSITION",
                vec![Value::String(table.name.clone())],
            ),
            Dialect::Sqlite => Statement::new(
                "SELECT name FROM pragma_table_info(?) ORDER BY cid",
                vec![Value::String(table.name.clone())],
            ),
        }
    }

    /// Rows with column `name`, in primary key order.
    pub fn primary_key(&self, table: &TableName) -> Statement {
        match self {
            Dialect::Postgres => Statement::new(
                "SELECT a.attname::text AS name
                 FROM pg_index i
                 CROSS JOIN LATERAL unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
                 WHERE i.indrelid = to_regclass($1) AND i.indisprimary
                 ORDER BY k.ord",
                vec![Value::String(self.qualified(table))],
            ),
            Dialect::MySql => Statement::new(
                "SELECT COLUMN_NAME AS name FROM information_schema.KEY_COLUMN_USAGE
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
                 ORDER BY ORDINAL_POSITION",
                vec![Value::String(table.name.clone())],
            ),
            Dialect::Sqlite => Statement::new(
                "SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk",
                vec![Value::String(table.name.clone())],
            ),
        }
    }

    /// Rows with column `name` for every base table in the schema / database.
    pub fn list_tables(&self, schema: Option<&str>) -> Statement {
        match self {
            Dialect::Postgres => Statement::new(
                "SELECT tablename::text AS name FROM pg_tables WHERE schemaname = $1 ORDER BY tablename",
                vec![Value::String(schema.unwrap_or("public").to_string())],
            ),
            Dialect::MySql => Statement::new(
                "SELECT TABLE_NAME AS name FROM information_schema.TABLES
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'
                 ORDER BY TABLE_NAME",
                vec![],
            ),
            Dialect::Sqlite => Statement::new(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                vec![],
            ),
        }
    }

    /// One row with column `now_micros`: the database clock in microseconds since the epoch.
    pub fn clock(&self) -> Statement {
        let sql = match self {
            Dialect::Postgres => {
                "SELECT (extract(epoch FROM clock_timestamp()) * 1000000)::bigint AS now_micros"
                    .to_string()
            }
            Dialect::MySql => {
                "SELECT CAST(UNIX_TIMESTAMP(NOW(6)) * 1000000 AS SIGNED) AS now_micros".to_string()
            }
            Dialect::Sqlite => format!("SELECT {} AS now_micros", sqlite_clock_expr()),
        };
        Statement::new(sql, vec![])
    }

    // ----- changelog -----

    /// Pending changelog rows after `since`, JSON columns as text.
    pub fn read_changelog(&self, table: &TableName, since: i64, limit: usize) -> Statement {
        let cl = self.qualified(&table.changelog());
        let (pk, row) = match self {
            Dialect::Postgres => ("primary_key::text", "row_data::text"),
            Dialect::MySql => ("CAST(primary_key AS CHAR)", "CAST(row_data AS CHAR)"),
            Dialect::Sqlite => ("primary_key", "row_data"),
        };
        Statement::new(
            format!(
                "SELECT sequence_id, operation, pk_text, {pk} AS primary_key, {row} AS row_data,
                        origin, applied_from, changed_at
                 FROM {cl}
                 WHERE sequence_id > {}
                 ORDER BY sequence_id ASC
                 LIMIT {}",
                self.placeholder(1),
                self.placeholder(2)
            ),
            vec![Value::from(since), Value::from(limit as i64)],
        )
    }

    /// Delete changelog rows at or below `watermark`.
    pub fn compact_changelog(&self, table: &TableName, watermark: i64) -> Statement {
        Statement::new(
            format!(
                "DELETE FROM {} WHERE sequence_id <= {}",
                self.qualified(&table.changelog()),
                self.placeholder(1)
            ),
            vec![Value::from(watermark)],
        )
    }

    /// One row with column `pending`: genuine changelog rows after `since` for any of `keys`.
    ///
    /// Rows applied on behalf of `source` are echoes and do not count.
    pub fn concurrent_writes_guard(
        &self,
        table: &TableName,
        since: i64,
        source: &str,
        keys: &[String],
    ) -> Statement {
        let cl = self.qualified(&table.changelog());
        let mut params = vec![Value::from(since), Value::String(source.to_string())];
        params.extend(keys.iter().cloned().map(Value::String));
        Statement::new(
            format!(
                "SELECT COUNT(*) AS pending FROM {cl}
                 WHERE sequence_id > {}
                   AND (applied_from IS NULL OR applied_from <> {})
                   AND pk_text IN ({})",
                self.placeholder(1),
                self.placeholder(2),
                self.placeholders(3, keys.len())
            ),
            params,
        )
    }

    // ----- cursor -----

    pub fn read_cursor(&self, schema: Option<&str>, source: &str, table: &str) -> Statement {
        Statement::new(
            format!(
                "SELECT last_sequence_id FROM {} WHERE source_endpoint = {} AND table_name = {}",
                self.qualified(&TableName::new(schema, CURSOR_TABLE)),
                self.placeholder(1),
                self.placeholder(2)
            ),
            vec![
                Value::String(source.to_string()),
                Value::String(table.to_string()),
            ],
        )
    }

    pub fn delete_cursor(&self, schema: Option<&str>, source: &str, table: &str) -> Statement {
        Statement::new(
            format!(
                "DELETE FROM {} WHERE source_endpoint = {} AND table_name = {}",
                self.qualified(&TableName::new(schema, CURSOR_TABLE)),
                self.placeholder(1),
                self.placeholder(2)
            ),
            vec![
                Value::String(source.to_string()),
                Value::String(table.to_string()),
            ],
        )
    }

    /// Upsert that never moves the cursor backwards.
    pub fn advance_cursor(
        &self,
        schema: Option<&str>,
        source: &str,
        table: &str,
        sequence_id: i64,
    ) -> Statement {
        let cursor = self.qualified(&TableName::new(schema, CURSOR_TABLE));
        let sql = match self {
            Dialect::Postgres => format!(
                "INSERT INTO {cursor} (source_endpoint, table_name, last_sequence_id, updated_at)
                 VALUES ($1, $2, $3, now())
                 ON CONFLICT (source_endpoint, table_name) DO UPDATE SET
                    last_sequence_id = GREATEST({cursor}.last_sequence_id, EXCLUDED.last_sequence_id),
                    updated_at = EXCLUDED.updated_at"
            ),
            Dialect::MySql => format!(
                "INSERT INTO {cursor} (source_endpoint, table_name, last_sequence_id, updated_at)
                 VALUES (?, ?, ?, NOW(6))
                 ON DUPLICATE KEY UPDATE
                    last_sequence_id = GREATEST(last_sequence_id, VALUES(last_sequence_id)),
                    updated_at = VALUES(updated_at)"
            ),
            Dialect::Sqlite => format!(
                "INSERT INTO {cursor} (source_endpoint, table_name, last_sequence_id, updated_at)
                 VALUES (?, ?, ?, CURRENT_TIMESTAMP)
                 ON CONFLICT (source_endpoint, table_name) DO UPDATE SET
                    last_sequence_id = MAX(last_sequence_id, excluded.last_sequence_id),
                    updated_at = excluded.updated_at"
            ),
        };
        Statement::new(
            sql,
            vec![
                Value::String(source.to_string()),
                Value::String(table.to_string()),
                Value::from(sequence_id),
            ],
        )
    }

    // ----- row writes -----

    /// Insert-or-update of one row image whose keys are target column names.
    pub fn upsert_row(&self, table: &TableName, pk: &[String], row: &RowImage) -> Statement {
        let target = self.qualified(table);
        let columns: Vec<String> = row.keys().cloned().collect();
        let updates: Vec<&String> = columns.iter().filter(|c| !pk.contains(c)).collect();
        let column_list = self.quote_list(&columns);
        let pk_list = self.quote_list(pk);

        match self {
            Dialect::Postgres => {
                let conflict = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    let sets = updates
                        .iter()
                        .map(|c| format!("{0} = EXCLUDED.{0}", self.quote(c)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("DO UPDATE SET {sets}")
                };
                Statement::new(
                    format!(
                        "INSERT INTO {target} ({column_list})
                         SELECT {column_list} FROM jsonb_populate_record(NULL::{target}, $1::jsonb)
                         ON CONFLICT ({pk_list}) {conflict}"
                    ),
                    vec![Value::Object(row.clone())],
                )
            }
            Dialect::MySql => {
                let values = self.placeholders(1, columns.len());
                let sql = if updates.is_empty() {
                    format!("INSERT IGNORE INTO {target} ({column_list}) VALUES ({values})")
                } else {
                    let sets = updates
                        .iter()
                        .map(|c| format!("{0} = VALUES({0})", self.quote(c)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(
                        "INSERT INTO {target} ({column_list}) VALUES ({values}) ON DUPLICATE KEY UPDATE {sets}"
                    )
                };
                Statement::new(sql, row.values().cloned().collect())
            }
            Dialect::Sqlite => {
                let values = self.placeholders(1, columns.len());
                let conflict = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    let sets = updates
                        .iter()
                        .map(|c| format!("{0} = excluded.{0}", self.quote(c)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("DO UPDATE SET {sets}")
                };
                Statement::new(
                    format!(
                        "INSERT INTO {target} ({column_list}) VALUES ({values}) ON CONFLICT ({pk_list}) {conflict}"
                    ),
                    row.values().cloned().collect(),
                )
            }
        }
    }

    /// Delete by primary key; `key` maps target primary key columns to values.
    pub fn delete_row(&self, table: &TableName, pk: &[String], key: &RowImage) -> Statement {
        let target = self.qualified(table);
        match self {
            Dialect::Postgres => {
                let pk_list = self.quote_list(pk);
                Statement::new(
                    format!(
                        "DELETE FROM {target} WHERE ({pk_list}) IN
                         (SELECT {pk_list} FROM jsonb_populate_record(NULL::{target}, $1::jsonb))"
                    ),
                    vec![Value::Object(key.clone())],
                )
            }
            Dialect::MySql | Dialect::Sqlite => {
                let (predicate, params) = self.key_predicate(pk, key);
                Statement::new(format!("DELETE FROM {target} WHERE {predicate}"), params)
            }
        }
    }

    /// Select the current image of one row as JSON text in column `row_image`.
    pub fn select_row_image(
        &self,
        table: &TableName,
        columns: &[String],
        pk: &[String],
        key: &RowImage,
    ) -> Statement {
        let target = self.qualified(table);
        match self {
            Dialect::Postgres => {
                let pk_list = self.quote_list(pk);
                Statement::new(
                    format!(
                        "SELECT to_jsonb(src)::text AS row_image FROM {target} AS src
                         WHERE ({pk_list}) IN
                         (SELECT {pk_list} FROM jsonb_populate_record(NULL::{target}, $1::jsonb))"
                    ),
                    vec![Value::Object(key.clone())],
                )
            }
            Dialect::MySql | Dialect::Sqlite => {
                let function = if *self == Dialect::MySql {
                    "JSON_OBJECT"
                } else {
                    "json_object"
                };
                let parts = columns
                    .iter()
                    .map(|c| format!("{}, {}", quote_literal(c), self.quote(c)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let image = if *self == Dialect::MySql {
                    format!("CAST({function}({parts}) AS CHAR)")
                } else {
                    format!("{function}({parts})")
                };
                let (predicate, params) = self.key_predicate(pk, key);
                Statement::new(
                    format!("SELECT {image} AS row_image FROM {target} WHERE {predicate}"),
                    params,
                )
            }
        }
    }

    fn key_predicate(&self, pk: &[String], key: &RowImage) -> (String, Vec<Value>) {
        let predicate = pk
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote(c), self.placeholder(i + 1)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let params = pk
            .iter()
            .map(|c| key.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        (predicate, params)
    }
}

/// Current time in microseconds, rounded to the millisecond precision `julianday` offers.
fn sqlite_clock_expr() -> &'static str {
    "(CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER) * 1000)"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> RowImage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn pk() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn test_dsn_acceptance() {
        assert!(Dialect::Postgres.accepts_dsn("postgresql://u@h/db"));
        assert!(Dialect::MySql.accepts_dsn("mysql://u@h/db"));
        assert!(Dialect::Sqlite.accepts_dsn("/tmp/app.db"));
        assert!(Dialect::Sqlite.accepts_dsn("sqlite:///tmp/app.db"));
        assert!(!Dialect::Sqlite.accepts_dsn("postgres://u@h/db"));
        assert!(!Dialect::Postgres.accepts_dsn("/tmp/app.db"));
    }

    #[test]
    fn test_postgres_upsert_uses_populate_record() {
        let table = TableName::new(Some("sales"), "customers");
        let stmt = Dialect::Postgres.upsert_row(
            &table,
            &pk(),
            &row(&[("id", json!(5)), ("name", json!("Ada"))]),
        );
        assert!(stmt.sql.contains("jsonb_populate_record(NULL::\"sales\".\"customers\""));
        assert!(stmt.sql.contains("ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""));
        assert_eq!(stmt.params, vec![json!({"id": 5, "name": "Ada"})]);
    }

    #[test]
    fn test_mysql_upsert_binds_each_column() {
        let table = TableName::new(None, "customers");
        let stmt = Dialect::MySql.upsert_row(
            &table,
            &pk(),
            &row(&[("id", json!(5)), ("name", json!("Ada"))]),
        );
        assert_eq!(
            stmt.sql,
            "INSERT INTO `customers` (`id`, `name`) VALUES (?, ?) ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
        );
        assert_eq!(stmt.params, vec![json!(5), json!("Ada")]);
    }

    #[test]
    fn test_key_only_upsert_does_nothing_on_conflict() {
        let table = TableName::new(None, "tags");
        let stmt = Dialect::Sqlite.upsert_row(&table, &pk(), &row(&[("id", json!(1))]));
        assert!(stmt.sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
        let stmt = Dialect::MySql.upsert_row(&table, &pk(), &row(&[("id", json!(1))]));
        assert!(stmt.sql.starts_with("INSERT IGNORE"));
    }

    #[test]
    fn test_delete_by_composite_key() {
        let table = TableName::new(None, "lines");
        let key_cols = vec!["order_id".to_string(), "line_no".to_string()];
        let stmt = Dialect::Sqlite.delete_row(
            &table,
            &key_cols,
            &row(&[("line_no", json!(2)), ("order_id", json!(9))]),
        );
        assert_eq!(
            stmt.sql,
            "DELETE FROM \"lines\" WHERE \"order_id\" = ? AND \"line_no\" = ?"
        );
        assert_eq!(stmt.params, vec![json!(9), json!(2)]);
    }

    #[test]
    fn test_cursor_upsert_is_monotonic() {
        let pg = Dialect::Postgres.advance_cursor(Some("public"), "laptop", "customers", 42);
        assert!(pg.sql.contains("GREATEST("));
        let sqlite = Dialect::Sqlite.advance_cursor(None, "laptop", "customers", 42);
        assert!(sqlite.sql.contains("MAX(last_sequence_id, excluded.last_sequence_id)"));
        assert_eq!(sqlite.params[2], json!(42));
    }

    #[test]
    fn test_guard_lists_every_key() {
        let table = TableName::new(Some("public"), "customers");
        let stmt = Dialect::Postgres.concurrent_writes_guard(
            &table,
            10,
            "laptop",
            &["1".to_string(), "2".to_string()],
        );
        assert!(stmt.sql.contains("pk_text IN ($3, $4)"));
        assert_eq!(stmt.params.len(), 4);
    }

    #[test]
    fn test_sqlite_trigger_reads_marker() {
        let table = TableName::new(None, "customers");
        let ddl = Dialect::Sqlite.capture_ddl(
            &table,
            &["id".to_string(), "name".to_string()],
            &pk(),
            "laptop",
        );
        assert!(ddl.function_sql.is_none());
        assert_eq!(ddl.triggers.len(), 3);
        let insert = &ddl.triggers[0];
        assert_eq!(insert.name, "customers_bisync_insert");
        assert!(insert.create_sql.contains("json_object('id', NEW.\"id\", 'name', NEW.\"name\")"));
        assert!(insert.create_sql.contains("_bisync_apply_marker"));
        let delete = &ddl.triggers[2];
        assert!(delete.create_sql.contains("'delete', CAST(OLD.\"id\" AS TEXT)"));
        assert!(delete.create_sql.contains("NULL, 'laptop'"));
    }

    #[test]
    fn test_postgres_trigger_function_shared_by_all_verbs() {
        let table = TableName::new(Some("public"), "customers");
        let ddl = Dialect::Postgres.capture_ddl(&table, &[], &pk(), "cloud");
        let function = ddl.function_sql.unwrap();
        assert!(function.contains("\"public\".\"customers_bisync_capture\"()"));
        assert!(function.contains("to_jsonb(NEW)"));
        assert!(function.contains("current_setting('bisync.applying_from', true)"));
        assert!(ddl
            .triggers
            .iter()
            .all(|t| t.expected_body == ddl.triggers[0].expected_body));
        assert!(ddl.triggers[1].create_sql.contains("AFTER UPDATE"));
    }

    #[test]
    fn test_mysql_trigger_body_matches_create() {
        let table = TableName::new(None, "customers");
        let ddl = Dialect::MySql.capture_ddl(
            &table,
            &["id".to_string(), "name".to_string()],
            &pk(),
            "office",
        );
        for trigger in &ddl.triggers {
            assert!(trigger.create_sql.ends_with(&trigger.expected_body));
            assert!(trigger.expected_body.contains("@bisync_applying_from"));
        }
    }

    #[test]
    fn test_trigger_replacement_is_one_batch_except_on_mysql() {
        let table = TableName::new(None, "customers");
        let columns = ["id".to_string(), "name".to_string()];
        let sqlite = Dialect::Sqlite.capture_ddl(&table, &columns, &pk(), "laptop");
        let batch = Dialect::Sqlite
            .replace_trigger(&table, &sqlite.triggers[0])
            .unwrap();
        assert!(batch.starts_with("DROP TRIGGER IF EXISTS \"customers_bisync_insert\";\n"));
        assert!(batch.ends_with(&sqlite.triggers[0].create_sql));

        let pg_table = TableName::new(Some("public"), "customers");
        let pg = Dialect::Postgres.capture_ddl(&pg_table, &columns, &pk(), "cloud");
        let batch = Dialect::Postgres
            .replace_trigger(&pg_table, &pg.triggers[2])
            .unwrap();
        assert!(batch.contains("ON \"public\".\"customers\";\nCREATE TRIGGER"));

        let mysql = Dialect::MySql.capture_ddl(&table, &columns, &pk(), "office");
        assert!(Dialect::MySql
            .replace_trigger(&table, &mysql.triggers[0])
            .is_none());
    }

    #[test]
    fn test_support_tables_hidden() {
        assert!(is_support_table("customers_changelog"));
        assert!(is_support_table("_bisync_cursor"));
        assert!(!is_support_table("customers"));
    }

    #[test]
    fn test_teardown_drops_function_on_postgres_only() {
        let table = TableName::new(Some("public"), "customers");
        let pg = Dialect::Postgres.teardown_ddl(&table);
        assert!(pg.iter().any(|s| s.starts_with("DROP FUNCTION")));
        let sqlite = Dialect::Sqlite.teardown_ddl(&TableName::new(None, "customers"));
        assert_eq!(sqlite.len(), 4);
        assert_eq!(sqlite[3], "DROP TABLE IF EXISTS \"customers_changelog\"");
    }
}
