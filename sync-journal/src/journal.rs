use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::record::{
    CompactionMark, ConflictRow, ConflictStatus, HeldEntry, JournalSide, NewConflict, PairStateRow,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conflicts (
    conflict_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    pair_id             TEXT NOT NULL,
    table_name          TEXT NOT NULL,
    pk_text             TEXT NOT NULL,
    local_sequence_id   INTEGER NOT NULL,
    remote_sequence_id  INTEGER NOT NULL,
    local_entry         BLOB NOT NULL,
    remote_entry        BLOB NOT NULL,
    strategy            TEXT NOT NULL,
    winner              TEXT,
    status              TEXT NOT NULL,
    created_at          TIMESTAMP NOT NULL,
    resolved_at         TIMESTAMP,
    UNIQUE (pair_id, local_sequence_id, remote_sequence_id)
);

CREATE INDEX IF NOT EXISTS conflicts_open_idx ON conflicts (pair_id, status, pk_text);

CREATE TABLE IF NOT EXISTS held_entries (
    conflict_id   INTEGER NOT NULL REFERENCES conflicts(conflict_id),
    side          TEXT NOT NULL,
    sequence_id   INTEGER NOT NULL,
    entry         BLOB NOT NULL,
    PRIMARY KEY (conflict_id, side, sequence_id)
);

CREATE TABLE IF NOT EXISTS pair_state (
    pair_id               TEXT PRIMARY KEY,
    last_success_at       TIMESTAMP,
    last_error            TEXT,
    last_error_at         TIMESTAMP,
    consecutive_failures  INTEGER NOT NULL DEFAULT 0,
    config_fingerprint    TEXT
);

CREATE TABLE IF NOT EXISTS compaction (
    endpoint_id  TEXT NOT NULL,
    table_name   TEXT NOT NULL,
    watermark    INTEGER NOT NULL DEFAULT 0,
    updated_at   TIMESTAMP NOT NULL,
    PRIMARY KEY (endpoint_id, table_name)
);
"#;

const CONFLICT_COLUMNS: &str = "conflict_id, pair_id, table_name, pk_text, local_sequence_id, \
     remote_sequence_id, local_entry, remote_entry, strategy, winner, status, created_at, resolved_at";

/// Append-only store for conflict audit records and per-pair bookkeeping.
///
/// Conflict rows are never deleted; an open conflict only moves to `resolved`.
pub struct Journal {
    path: PathBuf,
    conn: Connection,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create journal directory {}", parent.display())
                })?;
                // Only a directory created here is narrowed to the owner.
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open journal database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for journal")?;
        conn.pragma_update(None, "synchronous", "full").ok();
        Self::init(path.to_path_buf(), conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory journal")?;
        Self::init(PathBuf::from(":memory:"), conn)
    }

    fn init(path: PathBuf, conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize journal schema")?;
        Ok(Self { path, conn })
    }

    /// Record a conflict. Replaying the same `(pair, local seq, remote seq)` keeps the original
    /// row and returns its id with `false`.
    pub fn record_conflict(&self, conflict: &NewConflict) -> Result<(i64, bool)> {
        let inserted = self.conn.execute(
            "INSERT INTO conflicts(pair_id, table_name, pk_text, local_sequence_id, remote_sequence_id,
                                   local_entry, remote_entry, strategy, winner, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(pair_id, local_sequence_id, remote_sequence_id) DO NOTHING",
            params![
                conflict.pair_id,
                conflict.table_name,
                conflict.pk_text,
                conflict.local_sequence_id,
                conflict.remote_sequence_id,
                conflict.local_entry,
                conflict.remote_entry,
                conflict.strategy,
                conflict.winner.map(|side| side.as_str()),
                conflict.status.as_str(),
                Utc::now(),
            ],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT conflict_id FROM conflicts
             WHERE pair_id = ?1 AND local_sequence_id = ?2 AND remote_sequence_id = ?3",
            params![
                conflict.pair_id,
                conflict.local_sequence_id,
                conflict.remote_sequence_id
            ],
            |row| row.get(0),
        )?;
        Ok((id, inserted > 0))
    }

    /// Attach a changelog entry to a conflict. Returns `false` if it was already attached.
    pub fn hold_entry(&self, entry: &HeldEntry) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO held_entries(conflict_id, side, sequence_id, entry)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conflict_id, side, sequence_id) DO NOTHING",
            params![
                entry.conflict_id,
                entry.side.as_str(),
                entry.sequence_id,
                entry.entry,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn held_entries(&self, conflict_id: i64) -> Result<Vec<HeldEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT conflict_id, side, sequence_id, entry FROM held_entries
             WHERE conflict_id = ?1
             ORDER BY side ASC, sequence_id ASC",
        )?;
        let mut rows = stmt.query([conflict_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let side: String = row.get(1)?;
            out.push(HeldEntry {
                conflict_id: row.get(0)?,
                side: JournalSide::parse(&side)?,
                sequence_id: row.get(2)?,
                entry: row.get(3)?,
            });
        }
        Ok(out)
    }

    /// Keys of a pair that are held by an open conflict, as `(conflict_id, pk_text)`.
    pub fn open_conflict_keys(&self, pair_id: &str) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT conflict_id, pk_text FROM conflicts
             WHERE pair_id = ?1 AND status = 'open'
             ORDER BY conflict_id DESC",
        )?;
        let rows = stmt
            .query_map([pair_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(i64, String)>, _>>()?;
        Ok(rows)
    }

    pub fn get_conflict(&self, conflict_id: i64) -> Result<Option<ConflictRow>> {
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE conflict_id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([conflict_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(conflict_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_conflicts(
        &self,
        pair_id: Option<&str>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRow>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE (?1 IS NULL OR pair_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY conflict_id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![pair_id, status.map(|s| s.as_str())])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(conflict_from_row(row)?);
        }
        Ok(out)
    }

    pub fn count_open(&self, pair_id: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE pair_id = ?1 AND status = 'open'",
            [pair_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Close an open conflict. Returns `false` when it was not open.
    pub fn mark_resolved(&self, conflict_id: i64, winner: JournalSide) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE conflicts SET status = 'resolved', winner = ?2, resolved_at = ?3
             WHERE conflict_id = ?1 AND status = 'open'",
            params![conflict_id, winner.as_str(), Utc::now()],
        )?;
        Ok(updated > 0)
    }

    /// Lowest changelog sequence id on `side` still referenced by an open conflict of the pair.
    pub fn min_held_sequence(&self, pair_id: &str, side: JournalSide) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT MIN(h.sequence_id) FROM held_entries h
                 JOIN conflicts c ON c.conflict_id = h.conflict_id
                 WHERE c.pair_id = ?1 AND c.status = 'open' AND h.side = ?2",
                params![pair_id, side.as_str()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(Into::into)
    }

    pub fn pair_state(&self, pair_id: &str) -> Result<Option<PairStateRow>> {
        self.conn
            .prepare(
                "SELECT pair_id, last_success_at, last_error, last_error_at,
                        consecutive_failures, config_fingerprint
                 FROM pair_state WHERE pair_id = ?1",
            )?
            .query_row([pair_id], |row| {
                Ok(PairStateRow {
                    pair_id: row.get(0)?,
                    last_success_at: row.get(1)?,
                    last_error: row.get(2)?,
                    last_error_at: row.get(3)?,
                    consecutive_failures: row.get(4)?,
                    config_fingerprint: row.get(5)?,
                })
            })
            .optional()
            .map_err(Into::into)
    }

    pub fn record_success(&self, pair_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pair_state(pair_id, last_success_at, consecutive_failures)
             VALUES (?1, ?2, 0)
             ON CONFLICT(pair_id) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                consecutive_failures = 0",
            params![pair_id, Utc::now()],
        )?;
        Ok(())
    }

    pub fn record_failure(&self, pair_id: &str, error: &str) -> Result<i64> {
        let now: DateTime<Utc> = Utc::now();
        self.conn.execute(
            "INSERT INTO pair_state(pair_id, last_error, last_error_at, consecutive_failures)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(pair_id) DO UPDATE SET
                last_error = excluded.last_error,
                last_error_at = excluded.last_error_at,
                consecutive_failures = pair_state.consecutive_failures + 1",
            params![pair_id, error, now],
        )?;
        let failures: i64 = self.conn.query_row(
            "SELECT consecutive_failures FROM pair_state WHERE pair_id = ?1",
            [pair_id],
            |row| row.get(0),
        )?;
        Ok(failures)
    }

    /// Store the configuration fingerprint and return the previous one.
    pub fn swap_fingerprint(&self, pair_id: &str, fingerprint: &str) -> Result<Option<String>> {
        let previous = self
            .pair_state(pair_id)?
            .and_then(|state| state.config_fingerprint);
        self.conn.execute(
            "INSERT INTO pair_state(pair_id, config_fingerprint) VALUES (?1, ?2)
             ON CONFLICT(pair_id) DO UPDATE SET config_fingerprint = excluded.config_fingerprint",
            params![pair_id, fingerprint],
        )?;
        Ok(previous)
    }

    pub fn compaction_watermark(&self, endpoint_id: &str, table_name: &str) -> Result<i64> {
        let watermark = self
            .conn
            .query_row(
                "SELECT watermark FROM compaction WHERE endpoint_id = ?1 AND table_name = ?2",
                params![endpoint_id, table_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(watermark.unwrap_or(0))
    }

    /// Raise the compaction watermark; a lower value never replaces a higher one.
    pub fn advance_compaction(&self, mark: &CompactionMark) -> Result<()> {
        self.conn.execute(
            "INSERT INTO compaction(endpoint_id, table_name, watermark, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(endpoint_id, table_name) DO UPDATE SET
                watermark = MAX(compaction.watermark, excluded.watermark),
                updated_at = excluded.updated_at",
            params![mark.endpoint_id, mark.table_name, mark.watermark, Utc::now()],
        )?;
        Ok(())
    }

    /// Forget the watermark of a changelog that was dropped.
    pub fn reset_compaction(&self, endpoint_id: &str, table_name: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM compaction WHERE endpoint_id = ?1 AND table_name = ?2",
            params![endpoint_id, table_name],
        )?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn conflict_from_row(row: &Row<'_>) -> Result<ConflictRow> {
    let winner: Option<String> = row.get(9)?;
    let status: String = row.get(10)?;
    Ok(ConflictRow {
        conflict_id: row.get(0)?,
        pair_id: row.get(1)?,
        table_name: row.get(2)?,
        pk_text: row.get(3)?,
        local_sequence_id: row.get(4)?,
        remote_sequence_id: row.get(5)?,
        local_entry: row.get(6)?,
        remote_entry: row.get(7)?,
        strategy: row.get(8)?,
        winner: winner.as_deref().map(JournalSide::parse).transpose()?,
        status: ConflictStatus::parse(&status)?,
        created_at: row.get(11)?,
        resolved_at: row.get(12)?,
    })
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_perms(_path: &Path) -> Result<()> {
    Ok(())
}
