use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Settled by an automatic strategy; kept for audit only.
    AutoResolved,
    /// Waiting for an external decision. The key stays held.
    Open,
    /// Settled by an external decision.
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::AutoResolved => "auto_resolved",
            ConflictStatus::Open => "open",
            ConflictStatus::Resolved => "resolved",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self> {
        match value {
            "auto_resolved" => Ok(ConflictStatus::AutoResolved),
            "open" => Ok(ConflictStatus::Open),
            "resolved" => Ok(ConflictStatus::Resolved),
            other => Err(anyhow!("unknown conflict status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalSide {
    Local,
    Remote,
}

impl JournalSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalSide::Local => "local",
            JournalSide::Remote => "remote",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(JournalSide::Local),
            "remote" => Ok(JournalSide::Remote),
            other => Err(anyhow!("unknown journal side: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConflict {
    pub pair_id: String,
    pub table_name: String,
    pub pk_text: String,
    pub local_sequence_id: i64,
    pub remote_sequence_id: i64,
    pub local_entry: Vec<u8>,
    pub remote_entry: Vec<u8>,
    pub strategy: String,
    pub winner: Option<JournalSide>,
    pub status: ConflictStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRow {
    pub conflict_id: i64,
    pub pair_id: String,
    pub table_name: String,
    pub pk_text: String,
    pub local_sequence_id: i64,
    pub remote_sequence_id: i64,
    pub local_entry: Vec<u8>,
    pub remote_entry: Vec<u8>,
    pub strategy: String,
    pub winner: Option<JournalSide>,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldEntry {
    pub conflict_id: i64,
    pub side: JournalSide,
    pub sequence_id: i64,
    pub entry: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairStateRow {
    pub pair_id: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub config_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionMark {
    pub endpoint_id: String,
    pub table_name: String,
    pub watermark: i64,
}
