// ABOUTME: Conflict resolver - decides which captured change wins for every key of a cycle
// ABOUTME: Pure function over both sides' entries; the strategy is dispatched in one match

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::config::ConflictStrategy;
use crate::model::{ChangeLogEntry, Side};

/// Everything the resolver looks at for one pair and one cycle.
#[derive(Debug, Clone, Copy)]
pub struct ResolveInput<'a> {
    pub local_endpoint: &'a str,
    pub remote_endpoint: &'a str,
    pub strategy: &'a ConflictStrategy,
    pub local: &'a [ChangeLogEntry],
    pub remote: &'a [ChangeLogEntry],
    /// Local column name to remote column name, for renamed columns only.
    pub column_map: &'a BTreeMap<String, String>,
    /// `pk_text` to id of the conflict that holds it.
    pub open_conflicts: &'a HashMap<String, i64>,
}

impl ResolveInput<'_> {
    fn endpoint(&self, side: Side) -> &str {
        match side {
            Side::Local => self.local_endpoint,
            Side::Remote => self.remote_endpoint,
        }
    }
}

/// A key changed on both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDecision {
    pub pk_text: String,
    pub local: ChangeLogEntry,
    pub remote: ChangeLogEntry,
    /// `None` when the key waits for an external decision.
    pub winner: Option<Side>,
    /// Genuine entries parked with an open conflict.
    pub parked: Vec<(Side, ChangeLogEntry)>,
}

/// An entry attached to a conflict that is already open.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldDecision {
    pub conflict_id: i64,
    pub side: Side,
    pub entry: ChangeLogEntry,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Local entries to apply on the remote endpoint.
    pub to_remote: Vec<ChangeLogEntry>,
    /// Remote entries to apply on the local endpoint.
    pub to_local: Vec<ChangeLogEntry>,
    pub conflicts: Vec<ConflictDecision>,
    pub held: Vec<HeldDecision>,
    /// Keys changed on both sides to the same final state.
    pub convergent: usize,
}

impl Resolution {
    pub fn apply_to(&self, target: Side) -> &[ChangeLogEntry] {
        match target {
            Side::Local => &self.to_local,
            Side::Remote => &self.to_remote,
        }
    }

    pub fn open_conflicts(&self) -> usize {
        self.conflicts.iter().filter(|c| c.winner.is_none()).count()
    }
}

#[derive(Default)]
struct KeyChanges<'a> {
    local: Vec<&'a ChangeLogEntry>,
    remote: Vec<&'a ChangeLogEntry>,
}

impl<'a> KeyChanges<'a> {
    fn side(&self, side: Side) -> &[&'a ChangeLogEntry] {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

/// Decide the outcome for every key touched in this cycle.
///
/// Per side only the last entry of a key matters. A side whose last entry is an echo of the peer
/// already holds the peer's state and does not take part.
pub fn resolve(input: ResolveInput<'_>) -> Resolution {
    let mut keys: BTreeMap<&str, KeyChanges<'_>> = BTreeMap::new();
    for entry in input.local {
        keys.entry(entry.pk_text.as_str()).or_default().local.push(entry);
    }
    for entry in input.remote {
        keys.entry(entry.pk_text.as_str()).or_default().remote.push(entry);
    }

    let remote_to_local: BTreeMap<String, String> = input
        .column_map
        .iter()
        .map(|(local, remote)| (remote.clone(), local.clone()))
        .collect();

    let mut resolution = Resolution::default();
    for (pk_text, changes) in keys {
        if let Some(&conflict_id) = input.open_conflicts.get(pk_text) {
            for side in [Side::Local, Side::Remote] {
                let peer = input.endpoint(side.opposite());
                for entry in changes.side(side) {
                    if !entry.is_echo_from(peer) {
                        resolution.held.push(HeldDecision {
                            conflict_id,
                            side,
                            entry: (*entry).clone(),
                        });
                    }
                }
            }
            continue;
        }

        let local = active_net(changes.side(Side::Local), input.remote_endpoint);
        let remote = active_net(changes.side(Side::Remote), input.local_endpoint);

        match (local, remote) {
            (None, None) => {}
            (Some(local), None) => resolution.to_remote.push(local.clone()),
            (None, Some(remote)) => resolution.to_local.push(remote.clone()),
            (Some(local), Some(remote)) => {
                if local.same_image(remote, &remote_to_local) {
                    resolution.convergent += 1;
                    continue;
                }
                let winner = pick_winner(&input, local, remote);
                match winner {
                    Some(Side::Local) => resolution.to_remote.push(local.clone()),
                    Some(Side::Remote) => resolution.to_local.push(remote.clone()),
                    None => {}
                }
                let parked = if winner.is_none() {
                    genuine_entries(&input, &changes)
                } else {
                    Vec::new()
                };
                resolution.conflicts.push(ConflictDecision {
                    pk_text: pk_text.to_string(),
                    local: local.clone(),
                    remote: remote.clone(),
                    winner,
                    parked,
                });
            }
        }
    }

    resolution.to_remote.sort_by_key(|e| e.sequence_id);
    resolution.to_local.sort_by_key(|e| e.sequence_id);
    resolution
}

fn active_net<'a>(entries: &[&'a ChangeLogEntry], peer: &str) -> Option<&'a ChangeLogEntry> {
    let net = entries.iter().max_by_key(|e| e.sequence_id)?;
    if net.is_echo_from(peer) {
        None
    } else {
        Some(net)
    }
}

fn genuine_entries(input: &ResolveInput<'_>, changes: &KeyChanges<'_>) -> Vec<(Side, ChangeLogEntry)> {
    let mut parked = Vec::new();
    for side in [Side::Local, Side::Remote] {
        let peer = input.endpoint(side.opposite());
        parked.extend(
            changes
                .side(side)
                .iter()
                .filter(|e| !e.is_echo_from(peer))
                .map(|e| (side, (*e).clone())),
        );
    }
    parked
}

fn pick_winner(
    input: &ResolveInput<'_>,
    local: &ChangeLogEntry,
    remote: &ChangeLogEntry,
) -> Option<Side> {
    match input.strategy {
        ConflictStrategy::LastWriteWins => Some(last_write_wins(input, local, remote)),
        ConflictStrategy::OriginPriority {
            authoritative_endpoint,
        } => {
            if authoritative_endpoint == input.remote_endpoint {
                Some(Side::Remote)
            } else {
                Some(Side::Local)
            }
        }
        ConflictStrategy::Manual => None,
    }
}

/// Later timestamp wins. A delete wins at an equal or later timestamp so a row that one side
/// removed is not resurrected by a concurrent update. Exact ties go to the greater origin id.
fn last_write_wins(input: &ResolveInput<'_>, local: &ChangeLogEntry, remote: &ChangeLogEntry) -> Side {
    let by_time = local.logical_timestamp.cmp(&remote.logical_timestamp);
    match (local.operation.is_delete(), remote.operation.is_delete(), by_time) {
        (true, false, Ordering::Greater | Ordering::Equal) => Side::Local,
        (false, true, Ordering::Less | Ordering::Equal) => Side::Remote,
        (_, _, Ordering::Greater) => Side::Local,
        (_, _, Ordering::Less) => Side::Remote,
        (_, _, Ordering::Equal) => {
            if input.local_endpoint >= input.remote_endpoint {
                Side::Local
            } else {
                Side::Remote
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::entry;
    use crate::model::Operation;

    const LOCAL: &str = "laptop";
    const REMOTE: &str = "cloud";

    fn run(
        strategy: &ConflictStrategy,
        local: &[ChangeLogEntry],
        remote: &[ChangeLogEntry],
        open: &HashMap<String, i64>,
    ) -> Resolution {
        resolve(ResolveInput {
            local_endpoint: LOCAL,
            remote_endpoint: REMOTE,
            strategy,
            local,
            remote,
            column_map: &BTreeMap::new(),
            open_conflicts: open,
        })
    }

    fn echo(mut e: ChangeLogEntry, from: &str) -> ChangeLogEntry {
        e.applied_from = Some(from.to_string());
        e
    }

    #[test]
    fn test_one_sided_change_passes_through() {
        let local = vec![entry(1, Operation::Insert, 5, Some("Ada"), LOCAL, 100)];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &[], &HashMap::new());
        assert_eq!(r.to_remote, local);
        assert!(r.to_local.is_empty());
        assert!(r.conflicts.is_empty());
    }

    #[test]
    fn test_only_last_entry_per_key_is_applied() {
        let local = vec![
            entry(1, Operation::Insert, 5, Some("Ada"), LOCAL, 100),
            entry(2, Operation::Update, 5, Some("Ada L."), LOCAL, 110),
            entry(3, Operation::Insert, 6, Some("Bob"), LOCAL, 120),
        ];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &[], &HashMap::new());
        let seqs: Vec<i64> = r.to_remote.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_echo_side_is_quiet() {
        let local = vec![entry(4, Operation::Update, 5, Some("new"), LOCAL, 200)];
        let remote = vec![echo(
            entry(9, Operation::Update, 5, Some("old"), REMOTE, 150),
            LOCAL,
        )];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &remote, &HashMap::new());
        assert_eq!(r.to_remote.len(), 1);
        assert!(r.to_local.is_empty());
        assert!(r.conflicts.is_empty());

        // An echo alone produces nothing.
        let r = run(&ConflictStrategy::LastWriteWins, &[], &remote, &HashMap::new());
        assert_eq!(r, Resolution::default());
    }

    #[test]
    fn test_last_write_wins_later_timestamp() {
        let local = vec![entry(1, Operation::Update, 5, Some("from A"), LOCAL, 100)];
        let remote = vec![entry(1, Operation::Update, 5, Some("from B"), REMOTE, 200)];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &remote, &HashMap::new());
        assert_eq!(r.to_local, remote);
        assert!(r.to_remote.is_empty());
        assert_eq!(r.conflicts.len(), 1);
        assert_eq!(r.conflicts[0].winner, Some(Side::Remote));
        assert_eq!(r.open_conflicts(), 0);
    }

    #[test]
    fn test_later_delete_beats_update() {
        let local = vec![entry(3, Operation::Delete, 5, None, LOCAL, 300)];
        let remote = vec![entry(2, Operation::Update, 5, Some("B"), REMOTE, 200)];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &remote, &HashMap::new());
        assert_eq!(r.to_remote, local);
        assert_eq!(r.conflicts[0].winner, Some(Side::Local));
    }

    #[test]
    fn test_delete_wins_timestamp_tie() {
        let local = vec![entry(3, Operation::Update, 5, Some("A"), LOCAL, 300)];
        let remote = vec![entry(2, Operation::Delete, 5, None, REMOTE, 300)];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &remote, &HashMap::new());
        assert_eq!(r.conflicts[0].winner, Some(Side::Remote));
        assert!(r.to_local[0].operation.is_delete());
    }

    #[test]
    fn test_earlier_delete_loses_to_update() {
        let local = vec![entry(3, Operation::Delete, 5, None, LOCAL, 100)];
        let remote = vec![entry(2, Operation::Update, 5, Some("B"), REMOTE, 200)];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &remote, &HashMap::new());
        assert_eq!(r.conflicts[0].winner, Some(Side::Remote));
    }

    #[test]
    fn test_exact_tie_is_deterministic() {
        let local = vec![entry(1, Operation::Update, 5, Some("A"), LOCAL, 100)];
        let remote = vec![entry(1, Operation::Update, 5, Some("B"), REMOTE, 100)];
        let first = run(&ConflictStrategy::LastWriteWins, &local, &remote, &HashMap::new());
        for _ in 0..10 {
            assert_eq!(
                run(&ConflictStrategy::LastWriteWins, &local, &remote, &HashMap::new()),
                first
            );
        }
        // "laptop" sorts after "cloud"
        assert_eq!(first.conflicts[0].winner, Some(Side::Local));
    }

    #[test]
    fn test_convergent_changes_are_not_conflicts() {
        let local = vec![entry(1, Operation::Update, 5, Some("same"), LOCAL, 100)];
        let remote = vec![entry(7, Operation::Update, 5, Some("same"), REMOTE, 300)];
        let r = run(&ConflictStrategy::Manual, &local, &remote, &HashMap::new());
        assert_eq!(r.convergent, 1);
        assert!(r.conflicts.is_empty());
        assert!(r.to_local.is_empty() && r.to_remote.is_empty());

        let local = vec![entry(1, Operation::Delete, 5, None, LOCAL, 100)];
        let remote = vec![entry(7, Operation::Delete, 5, None, REMOTE, 300)];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &remote, &HashMap::new());
        assert_eq!(r.convergent, 1);
    }

    #[test]
    fn test_identical_edits_through_renamed_column_converge() {
        let local = vec![entry(2, Operation::Update, 5, Some("Same"), LOCAL, 100)];
        let mut theirs = entry(6, Operation::Update, 5, None, REMOTE, 200);
        let mut image = theirs.primary_key.clone();
        image.insert("full_name".into(), serde_json::json!("Same"));
        theirs.row = Some(image);
        let remote = vec![theirs];

        let mut column_map = BTreeMap::new();
        column_map.insert("name".to_string(), "full_name".to_string());
        let r = resolve(ResolveInput {
            local_endpoint: LOCAL,
            remote_endpoint: REMOTE,
            strategy: &ConflictStrategy::Manual,
            local: &local,
            remote: &remote,
            column_map: &column_map,
            open_conflicts: &HashMap::new(),
        });
        assert_eq!(r.convergent, 1);
        assert!(r.conflicts.is_empty());
        assert!(r.to_local.is_empty() && r.to_remote.is_empty());
    }

    #[test]
    fn test_origin_priority() {
        let strategy = ConflictStrategy::OriginPriority {
            authoritative_endpoint: REMOTE.into(),
        };
        let local = vec![entry(1, Operation::Update, 5, Some("A"), LOCAL, 900)];
        let remote = vec![entry(1, Operation::Update, 5, Some("B"), REMOTE, 100)];
        let r = run(&strategy, &local, &remote, &HashMap::new());
        assert_eq!(r.conflicts[0].winner, Some(Side::Remote));
        assert_eq!(r.to_local, remote);
    }

    #[test]
    fn test_manual_parks_both_sides_and_lets_other_keys_through() {
        let local = vec![
            entry(1, Operation::Update, 5, Some("A"), LOCAL, 100),
            entry(2, Operation::Insert, 6, Some("other"), LOCAL, 100),
        ];
        let remote = vec![entry(1, Operation::Update, 5, Some("B"), REMOTE, 200)];
        let r = run(&ConflictStrategy::Manual, &local, &remote, &HashMap::new());
        assert_eq!(r.open_conflicts(), 1);
        assert_eq!(r.conflicts[0].winner, None);
        assert_eq!(r.conflicts[0].parked.len(), 2);
        assert!(r.to_local.is_empty());
        assert_eq!(r.to_remote.len(), 1);
        assert_eq!(r.to_remote[0].pk_text, "6");
    }

    #[test]
    fn test_open_conflict_holds_new_entries() {
        let mut open = HashMap::new();
        open.insert("5".to_string(), 42);
        let local = vec![
            entry(3, Operation::Update, 5, Some("A2"), LOCAL, 300),
            echo(entry(4, Operation::Update, 5, Some("x"), LOCAL, 310), REMOTE),
        ];
        let r = run(&ConflictStrategy::LastWriteWins, &local, &[], &open);
        assert!(r.to_remote.is_empty());
        assert_eq!(r.held.len(), 1);
        assert_eq!(r.held[0].conflict_id, 42);
        assert_eq!(r.held[0].side, Side::Local);
        assert_eq!(r.held[0].entry.sequence_id, 3);
    }
}
