// ABOUTME: Core data types shared by reader, resolver, and apply engine
// ABOUTME: Changelog entries, pair sides, and row images as JSON objects

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sync_journal::JournalSide;

/// A row as returned by any driver: column name to JSON value.
pub type RowImage = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

/// One side of a table pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

impl From<Side> for JournalSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Local => JournalSide::Local,
            Side::Remote => JournalSide::Remote,
        }
    }
}

impl From<JournalSide> for Side {
    fn from(side: JournalSide) -> Self {
        match side {
            JournalSide::Local => Side::Local,
            JournalSide::Remote => Side::Remote,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single captured row change, as written by the capture triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub sequence_id: i64,
    pub table: String,
    pub operation: Operation,
    /// Primary key values joined with `|`, identical on both sides for the same row.
    pub pk_text: String,
    pub primary_key: RowImage,
    /// Full post-image for inserts and updates; `None` for deletes.
    pub row: Option<RowImage>,
    pub origin: String,
    /// Set when the change was produced by the apply engine on behalf of this endpoint.
    pub applied_from: Option<String>,
    /// Database clock at capture, microseconds since the Unix epoch.
    pub logical_timestamp: i64,
}

impl ChangeLogEntry {
    /// True when this entry is the echo of a change applied from `peer`.
    pub fn is_echo_from(&self, peer: &str) -> bool {
        self.applied_from.as_deref() == Some(peer)
    }

    /// Two entries describe the same final row state.
    ///
    /// `rename` maps column names of `other` to the names used by `self`. Only columns present
    /// in both images are compared, so columns that exist on one side only never differ.
    pub fn same_image(&self, other: &ChangeLogEntry, rename: &BTreeMap<String, String>) -> bool {
        match (self.operation.is_delete(), other.operation.is_delete()) {
            (true, true) => true,
            (false, false) => match (&self.row, &other.row) {
                (Some(mine), Some(theirs)) => {
                    let mut shared = 0;
                    for (column, value) in theirs {
                        let name = rename.get(column).unwrap_or(column);
                        if let Some(own) = mine.get(name) {
                            if own != value {
                                return false;
                            }
                            shared += 1;
                        }
                    }
                    shared > 0
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Serialized form stored in the conflict journal.
    pub fn to_journal_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_journal_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    pub fn entry(
        seq: i64,
        op: Operation,
        id: i64,
        name: Option<&str>,
        origin: &str,
        ts: i64,
    ) -> ChangeLogEntry {
        let mut pk = RowImage::new();
        pk.insert("id".into(), json!(id));
        let row = name.map(|name| {
            let mut row = pk.clone();
            row.insert("name".into(), json!(name));
            row
        });
        ChangeLogEntry {
            sequence_id: seq,
            table: "customers".into(),
            operation: op,
            pk_text: id.to_string(),
            primary_key: pk,
            row: if op.is_delete() { None } else { row },
            origin: origin.into(),
            applied_from: None,
            logical_timestamp: ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::entry;
    use super::*;

    #[test]
    fn test_operation_parse() {
        assert_eq!(Operation::parse("INSERT"), Some(Operation::Insert));
        assert_eq!(Operation::parse("delete"), Some(Operation::Delete));
        assert_eq!(Operation::parse("truncate"), None);
    }

    #[test]
    fn test_same_image() {
        let a = entry(1, Operation::Update, 7, Some("Ada"), "a", 10);
        let b = entry(9, Operation::Update, 7, Some("Ada"), "b", 20);
        let c = entry(9, Operation::Update, 7, Some("Grace"), "b", 20);
        let d1 = entry(2, Operation::Delete, 7, None, "a", 10);
        let d2 = entry(3, Operation::Delete, 7, None, "b", 11);
        let same_names = BTreeMap::new();
        assert!(a.same_image(&b, &same_names));
        assert!(!a.same_image(&c, &same_names));
        assert!(d1.same_image(&d2, &same_names));
        assert!(!a.same_image(&d1, &same_names));
    }

    #[test]
    fn test_same_image_through_renamed_columns() {
        let mut local = entry(1, Operation::Update, 7, Some("Ada"), "a", 10);
        if let Some(row) = local.row.as_mut() {
            row.insert("notes".into(), Value::Null);
        }
        let mut remote = entry(4, Operation::Update, 7, None, "b", 12);
        let mut image = remote.primary_key.clone();
        image.insert("full_name".into(), Value::from("Ada"));
        remote.row = Some(image);

        let mut rename = BTreeMap::new();
        rename.insert("full_name".to_string(), "name".to_string());
        assert!(local.same_image(&remote, &rename));

        if let Some(row) = remote.row.as_mut() {
            row.insert("full_name".into(), Value::from("Grace"));
        }
        assert!(!local.same_image(&remote, &rename));
    }

    #[test]
    fn test_journal_bytes_preserve_entry() {
        let mut e = entry(4, Operation::Insert, 1, Some("x"), "cloud", 99);
        e.applied_from = Some("laptop".into());
        let restored = ChangeLogEntry::from_journal_bytes(&e.to_journal_bytes()).unwrap();
        assert_eq!(restored, e);
        assert!(restored.is_echo_from("laptop"));
        assert!(!restored.is_echo_from("cloud"));
    }
}
