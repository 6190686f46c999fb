// ABOUTME: TOML configuration for endpoints, table pairs, schedule, and conflict policy
// ABOUTME: Loads and validates the engine configuration before any database is touched

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapter::Dialect;
use crate::error::{Result, SyncError};
use crate::model::Side;
use crate::utils::validate_identifier;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub conflict: ConflictStrategy,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum changelog rows read per endpoint per cycle.
    pub batch_size: usize,
    /// Number of pairs synchronized in parallel.
    pub worker_count: usize,
    pub statement_timeout_secs: u64,
    /// How long a sequence gap may stay open before it is treated as a rolled-back id.
    pub gap_grace_ms: u64,
    /// Journal database path. Defaults to `~/.database-bisync/journal.db`.
    pub state_path: Option<PathBuf>,
    /// Delete consumed changelog rows after each committed cycle.
    pub compact_after_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            worker_count: 4,
            statement_timeout_secs: 30,
            gap_grace_ms: 5_000,
            state_path: None,
            compact_after_sync: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub interval_seconds: Option<u64>,
    /// Six-field cron expression (seconds first), e.g. `0 */5 * * * *`.
    pub cron: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(std::time::Duration),
    Cron(Box<cron::Schedule>),
}

impl ScheduleConfig {
    pub fn schedule(&self) -> Result<Schedule> {
        match (&self.interval_seconds, &self.cron) {
            (Some(_), Some(_)) => Err(SyncError::config(
                "schedule.interval_seconds and schedule.cron are mutually exclusive",
            )),
            (_, Some(expr)) => cron::Schedule::from_str(expr)
                .map(|s| Schedule::Cron(Box::new(s)))
                .map_err(|e| SyncError::config(format!("invalid cron expression '{expr}': {e}"))),
            (Some(0), None) => Err(SyncError::config(
                "schedule.interval_seconds must be at least 1",
            )),
            (Some(secs), None) => Ok(Schedule::Interval(std::time::Duration::from_secs(*secs))),
            (None, None) => Ok(Schedule::Interval(std::time::Duration::from_secs(
                DEFAULT_INTERVAL_SECS,
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    OriginPriority { authoritative_endpoint: String },
    Manual,
}

impl ConflictStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::OriginPriority { .. } => "origin-priority",
            ConflictStrategy::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub id: String,
    pub dialect: Dialect,
    /// `postgres://..`, `mysql://..`, or a SQLite file path (optionally `sqlite://`-prefixed).
    pub dsn: String,
    /// PostgreSQL schema; defaults to `public`. Ignored by the other dialects.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl EndpointConfig {
    pub fn schema(&self) -> &str {
        self.schema.as_deref().unwrap_or("public")
    }

    /// DSN safe for logs.
    pub fn display_dsn(&self) -> String {
        crate::utils::sanitize_url(&self.dsn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    Bidirectional,
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    /// Whether changes captured on `side` are propagated to the other side.
    pub fn reads_from(&self, side: Side) -> bool {
        match self {
            Direction::Bidirectional => true,
            Direction::LocalToRemote => side == Side::Local,
            Direction::RemoteToLocal => side == Side::Remote,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairConfig {
    pub id: String,
    pub local_endpoint: String,
    pub remote_endpoint: String,
    pub local_table: String,
    pub remote_table: String,
    /// Primary key columns, in local column names.
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub direction: Direction,
    /// Local column name to remote column name. Unlisted columns keep their name.
    #[serde(default)]
    pub column_map: BTreeMap<String, String>,
    /// Overrides the engine-wide `[conflict]` strategy for this pair.
    #[serde(default)]
    pub conflict: Option<ConflictStrategy>,
}

impl PairConfig {
    pub fn endpoint(&self, side: Side) -> &str {
        match side {
            Side::Local => &self.local_endpoint,
            Side::Remote => &self.remote_endpoint,
        }
    }

    pub fn table(&self, side: Side) -> &str {
        match side {
            Side::Local => &self.local_table,
            Side::Remote => &self.remote_table,
        }
    }

    /// Primary key columns named as they are on `side`.
    pub fn primary_key_on(&self, side: Side) -> Vec<String> {
        match side {
            Side::Local => self.primary_key.clone(),
            Side::Remote => self
                .primary_key
                .iter()
                .map(|c| self.remote_column(c))
                .collect(),
        }
    }

    pub fn remote_column(&self, local: &str) -> String {
        self.column_map
            .get(local)
            .cloned()
            .unwrap_or_else(|| local.to_string())
    }

    pub fn local_column(&self, remote: &str) -> String {
        self.column_map
            .iter()
            .find(|(_, r)| r.as_str() == remote)
            .map(|(l, _)| l.clone())
            .unwrap_or_else(|| remote.to_string())
    }

    /// Translate a column name captured on `from` into the name used on the other side.
    pub fn map_column(&self, from: Side, column: &str) -> String {
        match from {
            Side::Local => self.remote_column(column),
            Side::Remote => self.local_column(column),
        }
    }

    pub fn strategy<'a>(&'a self, default: &'a ConflictStrategy) -> &'a ConflictStrategy {
        self.conflict.as_ref().unwrap_or(default)
    }

    /// Stable fingerprint of everything that shapes the installed infrastructure.
    pub fn fingerprint(&self, local: &EndpointConfig, remote: &EndpointConfig) -> String {
        let mut hasher = Sha256::new();
        for endpoint in [local, remote] {
            hasher.update(endpoint.id.as_bytes());
            hasher.update(b"|");
            hasher.update(endpoint.dialect.as_str().as_bytes());
            hasher.update(b"|");
            hasher.update(endpoint.schema().as_bytes());
            hasher.update(b"#");
        }
        hasher.update(self.local_table.as_bytes());
        hasher.update(b"|");
        hasher.update(self.remote_table.as_bytes());
        hasher.update(b"#");
        for column in &self.primary_key {
            hasher.update(column.as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"#");
        for (local, remote) in &self.column_map {
            hasher.update(local.as_bytes());
            hasher.update(b"=");
            hasher.update(remote.as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"#");
        hasher.update(format!("{:?}", self.direction).as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SyncError::config(format!("invalid configuration: {e}")))
    }

    pub fn endpoint(&self, id: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn pair(&self, id: &str) -> Option<&PairConfig> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn state_path(&self) -> PathBuf {
        self.engine.state_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".database-bisync")
                .join("journal.db")
        })
    }

    /// Static checks that need no database connection. All problems are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.engine.batch_size == 0 {
            problems.push("engine.batch_size must be at least 1".to_string());
        }
        if self.engine.worker_count == 0 {
            problems.push("engine.worker_count must be at least 1".to_string());
        }
        if self.engine.statement_timeout_secs == 0 {
            problems.push("engine.statement_timeout_secs must be at least 1".to_string());
        }
        if let Err(e) = self.schedule.schedule() {
            problems.push(e.to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            problems.push("retry.backoff_cap_ms must not be below retry.backoff_base_ms".into());
        }

        let mut endpoint_ids = HashSet::new();
        for endpoint in &self.endpoints {
            if !is_valid_id(&endpoint.id) {
                problems.push(format!(
                    "endpoint id '{}' must be 1-64 characters of [A-Za-z0-9_-]",
                    endpoint.id
                ));
            }
            if !endpoint_ids.insert(endpoint.id.as_str()) {
                problems.push(format!("duplicate endpoint id '{}'", endpoint.id));
            }
            if !endpoint.dialect.accepts_dsn(&endpoint.dsn) {
                problems.push(format!(
                    "endpoint '{}': dsn '{}' does not match dialect {}",
                    endpoint.id,
                    endpoint.display_dsn(),
                    endpoint.dialect.as_str()
                ));
            }
            if let Some(schema) = &endpoint.schema {
                if let Err(e) = validate_identifier(schema) {
                    problems.push(format!("endpoint '{}': {e}", endpoint.id));
                }
            }
        }

        let mut pair_ids = HashSet::new();
        let mut claimed: HashMap<(String, String), String> = HashMap::new();
        for pair in &self.pairs {
            if !is_valid_id(&pair.id) {
                problems.push(format!(
                    "pair id '{}' must be 1-64 characters of [A-Za-z0-9_-]",
                    pair.id
                ));
            }
            if !pair_ids.insert(pair.id.as_str()) {
                problems.push(format!("duplicate pair id '{}'", pair.id));
            }
            for side in [Side::Local, Side::Remote] {
                let endpoint = pair.endpoint(side);
                if !endpoint_ids.contains(endpoint) {
                    problems.push(format!(
                        "pair '{}': unknown {} endpoint '{}'",
                        pair.id, side, endpoint
                    ));
                }
                let table = pair.table(side);
                if let Err(e) = validate_identifier(table) {
                    problems.push(format!("pair '{}': {e}", pair.id));
                }
                let key = (endpoint.to_string(), table.to_string());
                if let Some(other) = claimed.insert(key, pair.id.clone()) {
                    if other != pair.id {
                        problems.push(format!(
                            "table '{}' on endpoint '{}' is claimed by pairs '{}' and '{}'",
                            table, endpoint, other, pair.id
                        ));
                    }
                }
            }
            if pair.local_endpoint == pair.remote_endpoint {
                problems.push(format!(
                    "pair '{}': local and remote endpoint must differ",
                    pair.id
                ));
            }
            if pair.primary_key.is_empty() {
                problems.push(format!("pair '{}': primary_key must not be empty", pair.id));
            }
            let mut seen_pk = HashSet::new();
            for column in &pair.primary_key {
                if !seen_pk.insert(column) {
                    problems.push(format!(
                        "pair '{}': primary key column '{}' listed twice",
                        pair.id, column
                    ));
                }
            }
            let mut targets = HashSet::new();
            for remote in pair.column_map.values() {
                if !targets.insert(remote) {
                    problems.push(format!(
                        "pair '{}': column_map maps two columns onto '{}'",
                        pair.id, remote
                    ));
                }
            }
            if let ConflictStrategy::OriginPriority {
                authoritative_endpoint,
            } = pair.strategy(&self.conflict)
            {
                if authoritative_endpoint != &pair.local_endpoint
                    && authoritative_endpoint != &pair.remote_endpoint
                {
                    problems.push(format!(
                        "pair '{}': authoritative endpoint '{}' is not part of the pair",
                        pair.id, authoritative_endpoint
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Config(problems.join("; ")))
        }
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
