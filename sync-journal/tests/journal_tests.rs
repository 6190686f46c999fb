use sync_journal::{
    CompactionMark, ConflictStatus, HeldEntry, Journal, JournalSide, NewConflict,
};
use tempfile::tempdir;

fn open_conflict(pair: &str, pk: &str, local_seq: i64, remote_seq: i64) -> NewConflict {
    NewConflict {
        pair_id: pair.to_string(),
        table_name: "customers".to_string(),
        pk_text: pk.to_string(),
        local_sequence_id: local_seq,
        remote_sequence_id: remote_seq,
        local_entry: format!("local-{pk}").into_bytes(),
        remote_entry: format!("remote-{pk}").into_bytes(),
        strategy: "manual".to_string(),
        winner: None,
        status: ConflictStatus::Open,
    }
}

#[test]
fn conflict_recording_is_idempotent_and_durable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("journal.db");
    let journal = Journal::open(&path).unwrap();

    let conflict = open_conflict("crm", "7", 11, 4);
    let (id, inserted) = journal.record_conflict(&conflict).unwrap();
    assert!(inserted);

    let (again, inserted) = journal.record_conflict(&conflict).unwrap();
    assert_eq!(again, id);
    assert!(!inserted);
    assert_eq!(journal.count_open("crm").unwrap(), 1);
    drop(journal);

    let journal = Journal::open(&path).unwrap();
    let row = journal.get_conflict(id).unwrap().unwrap();
    assert_eq!(row.pk_text, "7");
    assert_eq!(row.status, ConflictStatus::Open);
    assert_eq!(row.local_entry, b"local-7".to_vec());
    assert!(row.resolved_at.is_none());
}

#[test]
fn held_entries_gate_min_sequence_until_resolved() {
    let journal = Journal::open_in_memory().unwrap();
    let (id, _) = journal
        .record_conflict(&open_conflict("crm", "7", 11, 4))
        .unwrap();

    for (side, seq) in [
        (JournalSide::Local, 11),
        (JournalSide::Local, 15),
        (JournalSide::Remote, 4),
    ] {
        assert!(journal
            .hold_entry(&HeldEntry {
                conflict_id: id,
                side,
                sequence_id: seq,
                entry: vec![1, 2, 3],
            })
            .unwrap());
    }
    let duplicate = HeldEntry {
        conflict_id: id,
        side: JournalSide::Local,
        sequence_id: 15,
        entry: vec![],
    };
    assert!(!journal.hold_entry(&duplicate).unwrap());

    assert_eq!(journal.held_entries(id).unwrap().len(), 3);
    assert_eq!(
        journal.min_held_sequence("crm", JournalSide::Local).unwrap(),
        Some(11)
    );
    assert_eq!(
        journal.min_held_sequence("crm", JournalSide::Remote).unwrap(),
        Some(4)
    );
    assert_eq!(
        journal.open_conflict_keys("crm").unwrap(),
        vec![(id, "7".to_string())]
    );

    assert!(journal.mark_resolved(id, JournalSide::Remote).unwrap());
    assert!(!journal.mark_resolved(id, JournalSide::Local).unwrap());

    let row = journal.get_conflict(id).unwrap().unwrap();
    assert_eq!(row.status, ConflictStatus::Resolved);
    assert_eq!(row.winner, Some(JournalSide::Remote));
    assert!(row.resolved_at.is_some());
    assert_eq!(
        journal.min_held_sequence("crm", JournalSide::Local).unwrap(),
        None
    );
    assert!(journal.open_conflict_keys("crm").unwrap().is_empty());
}

#[test]
fn list_conflicts_filters_by_pair_and_status() {
    let journal = Journal::open_in_memory().unwrap();
    journal
        .record_conflict(&open_conflict("crm", "1", 1, 1))
        .unwrap();
    let mut auto = open_conflict("crm", "2", 2, 2);
    auto.status = ConflictStatus::AutoResolved;
    auto.winner = Some(JournalSide::Local);
    auto.strategy = "last-writer-wins".to_string();
    journal.record_conflict(&auto).unwrap();
    journal
        .record_conflict(&open_conflict("billing", "1", 1, 1))
        .unwrap();

    let all = journal.list_conflicts(None, None).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].pair_id, "billing", "newest conflict comes first");
    assert!(all[0].conflict_id > all[2].conflict_id);
    assert_eq!(journal.list_conflicts(Some("crm"), None).unwrap().len(), 2);
    let open = journal
        .list_conflicts(Some("crm"), Some(ConflictStatus::Open))
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].pk_text, "1");
    let auto_rows = journal
        .list_conflicts(None, Some(ConflictStatus::AutoResolved))
        .unwrap();
    assert_eq!(auto_rows[0].winner, Some(JournalSide::Local));
}

#[test]
fn pair_state_tracks_failures_and_fingerprint() {
    let journal = Journal::open_in_memory().unwrap();
    assert!(journal.pair_state("crm").unwrap().is_none());

    assert_eq!(journal.record_failure("crm", "timeout").unwrap(), 1);
    assert_eq!(journal.record_failure("crm", "timeout again").unwrap(), 2);
    let state = journal.pair_state("crm").unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 2);
    assert_eq!(state.last_error.as_deref(), Some("timeout again"));

    journal.record_success("crm").unwrap();
    let state = journal.pair_state("crm").unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 0);
    assert!(state.last_success_at.is_some());

    assert_eq!(journal.swap_fingerprint("crm", "abc").unwrap(), None);
    assert_eq!(
        journal.swap_fingerprint("crm", "def").unwrap(),
        Some("abc".to_string())
    );
}

#[test]
fn compaction_watermark_only_moves_forward() {
    let journal = Journal::open_in_memory().unwrap();
    assert_eq!(journal.compaction_watermark("pg", "customers").unwrap(), 0);

    let mark = |watermark| CompactionMark {
        endpoint_id: "pg".to_string(),
        table_name: "customers".to_string(),
        watermark,
    };
    journal.advance_compaction(&mark(40)).unwrap();
    journal.advance_compaction(&mark(12)).unwrap();
    assert_eq!(journal.compaction_watermark("pg", "customers").unwrap(), 40);
    assert_eq!(journal.compaction_watermark("pg", "orders").unwrap(), 0);
}

#[test]
fn reset_compaction_starts_over() {
    let journal = Journal::open_in_memory().unwrap();
    journal
        .advance_compaction(&CompactionMark {
            endpoint_id: "pg".to_string(),
            table_name: "customers".to_string(),
            watermark: 40,
        })
        .unwrap();
    journal.reset_compaction("pg", "customers").unwrap();
    assert_eq!(journal.compaction_watermark("pg", "customers").unwrap(), 0);
}

#[cfg(unix)]
#[test]
fn open_leaves_existing_directory_permissions_alone() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let shared = dir.path().join("shared");
    std::fs::create_dir(&shared).unwrap();
    std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o755)).unwrap();
    Journal::open(shared.join("journal.db")).unwrap();
    let mode = std::fs::metadata(&shared).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);

    let created = dir.path().join("state").join("bisync");
    Journal::open(created.join("journal.db")).unwrap();
    let mode = std::fs::metadata(&created).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o700);
}
