// ABOUTME: Async handle over the conflict journal used by the orchestrator
// ABOUTME: Runs blocking journal calls on the blocking pool and maps resolver output to records

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use sync_journal::{
    CompactionMark, ConflictRow, ConflictStatus, HeldEntry, Journal, JournalSide, NewConflict,
    PairStateRow,
};

use crate::error::{Result, SyncError};
use crate::model::{ChangeLogEntry, Side};
use crate::resolver::Resolution;

#[derive(Clone)]
pub struct JournalHandle {
    inner: Arc<Mutex<Journal>>,
}

/// Counts written for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedDecisions {
    /// Conflicts that were new in the journal (replays are not counted).
    pub conflicts: usize,
    pub opened: usize,
    pub held: usize,
    /// Conflict id and key of every open conflict this cycle touched, replays included.
    pub awaiting: Vec<(i64, String)>,
}

/// Which decisions of a resolution to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decisions {
    /// Open conflicts and the entries they hold. Written before anything is applied.
    Pending,
    /// Conflicts this side won. Written once the entries applied from it have committed.
    WonBy(Side),
}

impl JournalHandle {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Journal::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Journal::open_in_memory()?))
    }

    fn new(journal: Journal) -> Self {
        Self {
            inner: Arc::new(Mutex::new(journal)),
        }
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Journal) -> anyhow::Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let journal = inner
                .lock()
                .map_err(|_| anyhow!("journal mutex poisoned"))?;
            f(&*journal)
        })
        .await
        .map_err(|e| SyncError::Journal(anyhow!("journal task failed: {e}")))?
        .map_err(SyncError::Journal)
    }

    /// Open conflicts of a pair keyed by `pk_text`.
    pub async fn open_conflict_keys(&self, pair_id: &str) -> Result<HashMap<String, i64>> {
        let pair_id = pair_id.to_string();
        let keys = self
            .call(move |j| j.open_conflict_keys(&pair_id))
            .await?;
        Ok(keys.into_iter().map(|(id, pk)| (pk, id)).collect())
    }

    /// Persist the `which` part of a cycle's decisions.
    pub async fn record_resolution(
        &self,
        pair_id: &str,
        table: &str,
        strategy: &str,
        resolution: &Resolution,
        which: Decisions,
    ) -> Result<RecordedDecisions> {
        let conflicts: Vec<(NewConflict, Vec<(Side, ChangeLogEntry)>)> = resolution
            .conflicts
            .iter()
            .filter(|c| match which {
                Decisions::Pending => c.winner.is_none(),
                Decisions::WonBy(side) => c.winner == Some(side),
            })
            .map(|c| {
                let record = NewConflict {
                    pair_id: pair_id.to_string(),
                    table_name: table.to_string(),
                    pk_text: c.pk_text.clone(),
                    local_sequence_id: c.local.sequence_id,
                    remote_sequence_id: c.remote.sequence_id,
                    local_entry: c.local.to_journal_bytes(),
                    remote_entry: c.remote.to_journal_bytes(),
                    strategy: strategy.to_string(),
                    winner: c.winner.map(JournalSide::from),
                    status: if c.winner.is_some() {
                        ConflictStatus::AutoResolved
                    } else {
                        ConflictStatus::Open
                    },
                };
                (record, c.parked.clone())
            })
            .collect();
        let held: Vec<(HeldEntry, String)> = match which {
            Decisions::Pending => resolution
                .held
                .iter()
                .map(|h| {
                    (
                        held_entry(h.conflict_id, h.side, &h.entry),
                        h.entry.pk_text.clone(),
                    )
                })
                .collect(),
            Decisions::WonBy(_) => Vec::new(),
        };

        self.call(move |j| {
            let mut recorded = RecordedDecisions::default();
            for (record, parked) in &conflicts {
                let (conflict_id, inserted) = j.record_conflict(record)?;
                if inserted {
                    recorded.conflicts += 1;
                    if record.status == ConflictStatus::Open {
                        recorded.opened += 1;
                    }
                }
                if record.status == ConflictStatus::Open {
                    recorded.await_key(conflict_id, &record.pk_text);
                }
                for (side, entry) in parked {
                    if j.hold_entry(&held_entry(conflict_id, *side, entry))? {
                        recorded.held += 1;
                    }
                }
            }
            for (entry, pk_text) in &held {
                if j.hold_entry(entry)? {
                    recorded.held += 1;
                }
                recorded.await_key(entry.conflict_id, pk_text);
            }
            Ok(recorded)
        })
        .await
    }

    pub async fn get_conflict(&self, conflict_id: i64) -> Result<Option<ConflictRow>> {
        self.call(move |j| j.get_conflict(conflict_id)).await
    }

    pub async fn list_conflicts(
        &self,
        pair_id: Option<&str>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRow>> {
        let pair_id = pair_id.map(str::to_string);
        self.call(move |j| j.list_conflicts(pair_id.as_deref(), status))
            .await
    }

    pub async fn count_open(&self, pair_id: &str) -> Result<u64> {
        let pair_id = pair_id.to_string();
        self.call(move |j| j.count_open(&pair_id)).await
    }

    pub async fn mark_resolved(&self, conflict_id: i64, winner: Side) -> Result<bool> {
        self.call(move |j| j.mark_resolved(conflict_id, winner.into()))
            .await
    }

    pub async fn min_held_sequence(&self, pair_id: &str, side: Side) -> Result<Option<i64>> {
        let pair_id = pair_id.to_string();
        self.call(move |j| j.min_held_sequence(&pair_id, side.into()))
            .await
    }

    pub async fn pair_state(&self, pair_id: &str) -> Result<Option<PairStateRow>> {
        let pair_id = pair_id.to_string();
        self.call(move |j| j.pair_state(&pair_id)).await
    }

    pub async fn record_success(&self, pair_id: &str) -> Result<()> {
        let pair_id = pair_id.to_string();
        self.call(move |j| j.record_success(&pair_id)).await
    }

    pub async fn record_failure(&self, pair_id: &str, error: &str) -> Result<i64> {
        let pair_id = pair_id.to_string();
        let error = error.to_string();
        self.call(move |j| j.record_failure(&pair_id, &error)).await
    }

    /// Store the new fingerprint and return the previous one.
    pub async fn swap_fingerprint(&self, pair_id: &str, fingerprint: &str) -> Result<Option<String>> {
        let pair_id = pair_id.to_string();
        let fingerprint = fingerprint.to_string();
        self.call(move |j| j.swap_fingerprint(&pair_id, &fingerprint))
            .await
    }

    pub async fn compaction_watermark(&self, endpoint_id: &str, table: &str) -> Result<i64> {
        let endpoint_id = endpoint_id.to_string();
        let table = table.to_string();
        self.call(move |j| j.compaction_watermark(&endpoint_id, &table))
            .await
    }

    pub async fn advance_compaction(&self, endpoint_id: &str, table: &str, watermark: i64) -> Result<()> {
        let mark = CompactionMark {
            endpoint_id: endpoint_id.to_string(),
            table_name: table.to_string(),
            watermark,
        };
        self.call(move |j| j.advance_compaction(&mark)).await
    }

    pub async fn reset_compaction(&self, endpoint_id: &str, table: &str) -> Result<()> {
        let endpoint_id = endpoint_id.to_string();
        let table = table.to_string();
        self.call(move |j| j.reset_compaction(&endpoint_id, &table))
            .await
    }
}

impl RecordedDecisions {
    fn await_key(&mut self, conflict_id: i64, pk_text: &str) {
        if !self.awaiting.iter().any(|(id, _)| *id == conflict_id) {
            self.awaiting.push((conflict_id, pk_text.to_string()));
        }
    }
}

fn held_entry(conflict_id: i64, side: Side, entry: &ChangeLogEntry) -> HeldEntry {
    HeldEntry {
        conflict_id,
        side: side.into(),
        sequence_id: entry.sequence_id,
        entry: entry.to_journal_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictStrategy;
    use crate::model::fixtures::entry;
    use crate::model::Operation;
    use crate::resolver::{resolve, ResolveInput};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_manual_conflict_holds_key_until_resolved() {
        let journal = JournalHandle::in_memory().unwrap();
        let local = vec![entry(3, Operation::Update, 5, Some("A"), "laptop", 100)];
        let remote = vec![entry(8, Operation::Update, 5, Some("B"), "cloud", 200)];
        let none = HashMap::new();
        let resolution = resolve(ResolveInput {
            local_endpoint: "laptop",
            remote_endpoint: "cloud",
            strategy: &ConflictStrategy::Manual,
            local: &local,
            remote: &remote,
            column_map: &BTreeMap::new(),
            open_conflicts: &none,
        });

        let recorded = journal
            .record_resolution("customers", "customers", "manual", &resolution, Decisions::Pending)
            .await
            .unwrap();
        assert_eq!(recorded.conflicts, 1);
        assert_eq!(recorded.opened, 1);
        assert_eq!(recorded.held, 2);

        let open = journal.open_conflict_keys("customers").await.unwrap();
        let conflict_id = open["5"];
        assert_eq!(recorded.awaiting, vec![(conflict_id, "5".to_string())]);

        // Replaying the same cycle adds nothing, but the key still waits.
        let replay = journal
            .record_resolution("customers", "customers", "manual", &resolution, Decisions::Pending)
            .await
            .unwrap();
        assert_eq!((replay.conflicts, replay.opened, replay.held), (0, 0, 0));
        assert_eq!(replay.awaiting, recorded.awaiting);

        assert_eq!(
            journal.min_held_sequence("customers", Side::Remote).await.unwrap(),
            Some(8)
        );

        assert!(journal.mark_resolved(conflict_id, Side::Local).await.unwrap());
        assert!(journal.open_conflict_keys("customers").await.unwrap().is_empty());
        assert_eq!(
            journal.min_held_sequence("customers", Side::Remote).await.unwrap(),
            None
        );
        let row = journal.get_conflict(conflict_id).await.unwrap().unwrap();
        assert_eq!(row.status, ConflictStatus::Resolved);
        assert_eq!(row.winner, Some(JournalSide::Local));
    }

    #[tokio::test]
    async fn test_auto_resolved_conflict_is_audit_only() {
        let journal = JournalHandle::in_memory().unwrap();
        let local = vec![entry(1, Operation::Update, 5, Some("A"), "laptop", 100)];
        let remote = vec![entry(1, Operation::Update, 5, Some("B"), "cloud", 200)];
        let none = HashMap::new();
        let resolution = resolve(ResolveInput {
            local_endpoint: "laptop",
            remote_endpoint: "cloud",
            strategy: &ConflictStrategy::LastWriteWins,
            local: &local,
            remote: &remote,
            column_map: &BTreeMap::new(),
            open_conflicts: &none,
        });
        // Nothing is pending, and the loser's side never records the audit row.
        for which in [Decisions::Pending, Decisions::WonBy(Side::Local)] {
            let recorded = journal
                .record_resolution("customers", "customers", "last-write-wins", &resolution, which)
                .await
                .unwrap();
            assert_eq!(recorded, RecordedDecisions::default());
        }
        assert!(journal.list_conflicts(None, None).await.unwrap().is_empty());

        let recorded = journal
            .record_resolution(
                "customers",
                "customers",
                "last-write-wins",
                &resolution,
                Decisions::WonBy(Side::Remote),
            )
            .await
            .unwrap();
        assert_eq!(recorded.conflicts, 1);
        assert_eq!(recorded.opened, 0);
        assert!(recorded.awaiting.is_empty());
        assert_eq!(journal.count_open("customers").await.unwrap(), 0);

        let rows = journal
            .list_conflicts(Some("customers"), Some(ConflictStatus::AutoResolved))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].winner, Some(JournalSide::Remote));
        let loser = ChangeLogEntry::from_journal_bytes(&rows[0].local_entry).unwrap();
        assert_eq!(loser.row.unwrap()["name"], serde_json::json!("A"));
    }
}
