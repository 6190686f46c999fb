// ABOUTME: Sync orchestrator - owns connections, per-pair job slots, the worker pool, and the journal
// ABOUTME: Exposes the control surface used by the CLI: scheduling, manual runs, status, conflicts

mod job;
mod scheduler;
pub mod status;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sync_journal::{ConflictRow, ConflictStatus};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::adapter::{self, Connection, TableName};
use crate::apply::{self, TableSide};
use crate::config::{PairConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::installer::{self, InstallResult};
use crate::journal::JournalHandle;
use crate::model::{ChangeLogEntry, Operation, Side};
use crate::utils::retry_with_backoff;

pub use status::{
    CycleReport, EngineStatus, JobState, PairStatus, StatisticsSnapshot, TriggerOutcome,
};
use status::Statistics;

const CONNECT_ATTEMPTS: u32 = 2;

/// Columns of both tables of a pair, introspected when the infrastructure is installed.
#[derive(Debug, Clone)]
pub(crate) struct PairSchema {
    pub local_columns: Vec<String>,
    pub remote_columns: Vec<String>,
}

impl PairSchema {
    fn columns(&self, side: Side) -> &[String] {
        match side {
            Side::Local => &self.local_columns,
            Side::Remote => &self.remote_columns,
        }
    }
}

struct PairSlot {
    /// Held for the whole duration of a job; one job per pair.
    lock: Arc<tokio::sync::Mutex<()>>,
    status: Mutex<PairStatus>,
    schema: Mutex<Option<Arc<PairSchema>>>,
}

struct EngineInner {
    config: SyncConfig,
    journal: JournalHandle,
    connections: tokio::sync::Mutex<HashMap<String, Arc<dyn Connection>>>,
    slots: BTreeMap<String, PairSlot>,
    workers: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    stats: Statistics,
}

/// Live-check results for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCheck {
    pub endpoint: String,
    pub dialect: String,
    pub dsn: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Rows removed from each changelog of a pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionReport {
    pub pair_id: String,
    pub local_watermark: Option<i64>,
    pub remote_watermark: Option<i64>,
    pub deleted: u64,
}

/// The sync engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Validate `config` and open the journal at its state path.
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let journal = JournalHandle::open(&config.state_path())?;
        Ok(Self::with_journal(config, journal))
    }

    pub fn with_journal(config: SyncConfig, journal: JournalHandle) -> Self {
        let slots = config
            .pairs
            .iter()
            .map(|pair| {
                (
                    pair.id.clone(),
                    PairSlot {
                        lock: Arc::new(tokio::sync::Mutex::new(())),
                        status: Mutex::new(PairStatus::new(&pair.id)),
                        schema: Mutex::new(None),
                    },
                )
            })
            .collect();
        let workers = Arc::new(Semaphore::new(config.engine.worker_count.max(1)));
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                config,
                journal,
                connections: tokio::sync::Mutex::new(HashMap::new()),
                slots,
                workers,
                stop_tx,
                scheduler: Mutex::new(None),
                stats: Statistics::default(),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn journal(&self) -> &JournalHandle {
        &self.inner.journal
    }

    fn pair(&self, pair_id: &str) -> Result<(&PairConfig, &PairSlot)> {
        let pair = self
            .inner
            .config
            .pair(pair_id)
            .ok_or_else(|| SyncError::UnknownPair(pair_id.to_string()))?;
        let slot = self
            .inner
            .slots
            .get(pair_id)
            .ok_or_else(|| SyncError::UnknownPair(pair_id.to_string()))?;
        Ok((pair, slot))
    }

    /// Cached connection to `endpoint_id`, opened on first use.
    pub async fn connection(&self, endpoint_id: &str) -> Result<Arc<dyn Connection>> {
        let mut cache = self.inner.connections.lock().await;
        if let Some(conn) = cache.get(endpoint_id) {
            return Ok(Arc::clone(conn));
        }
        let endpoint = self.inner.config.endpoint(endpoint_id).ok_or_else(|| {
            SyncError::config(format!("unknown endpoint '{endpoint_id}'"))
        })?;
        let timeout = self.statement_timeout();
        let conn = retry_with_backoff(
            || adapter::connect(endpoint, timeout),
            CONNECT_ATTEMPTS,
            Duration::from_millis(500),
            Duration::from_secs(5),
        )
        .await?;
        cache.insert(endpoint_id.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Drop a cached connection so the next use reconnects.
    async fn evict(&self, endpoint_id: &str) {
        if self
            .inner
            .connections
            .lock()
            .await
            .remove(endpoint_id)
            .is_some()
        {
            tracing::debug!("Dropped cached connection to '{}'", endpoint_id);
        }
    }

    fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.inner.config.engine.statement_timeout_secs.max(1))
    }

    fn stop_requested(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    fn set_state(&self, slot: &PairSlot, state: JobState) {
        if let Ok(mut status) = slot.status.lock() {
            status.state = state;
        }
    }

    // ----- infrastructure -----

    /// Install (or repair) changelogs, triggers and support tables for every pair.
    pub async fn setup_infrastructure(&self) -> Result<Vec<InstallResult>> {
        let mut results = Vec::new();
        for pair in &self.inner.config.pairs {
            let (_, slot) = self.pair(&pair.id)?;
            let _guard = slot.lock.lock().await;
            let (schema, installed) = self.install_pair(pair).await?;
            if let Ok(mut cached) = slot.schema.lock() {
                *cached = Some(Arc::new(schema));
            }
            results.extend(installed);
        }
        Ok(results)
    }

    async fn install_pair(&self, pair: &PairConfig) -> Result<(PairSchema, Vec<InstallResult>)> {
        let mut installed = Vec::with_capacity(2);
        for side in [Side::Local, Side::Remote] {
            let conn = self.connection(pair.endpoint(side)).await?;
            let table = TableName::new(conn.schema(), pair.table(side));
            let result = installer::ensure_infrastructure(
                conn.as_ref(),
                &table,
                &pair.primary_key_on(side),
                pair.direction.reads_from(side),
            )
            .await?;
            installed.push(result);
        }
        self.check_fingerprint(pair).await?;
        let schema = PairSchema {
            local_columns: installed[0].columns.clone(),
            remote_columns: installed[1].columns.clone(),
        };
        Ok((schema, installed))
    }

    async fn check_fingerprint(&self, pair: &PairConfig) -> Result<()> {
        let (Some(local), Some(remote)) = (
            self.inner.config.endpoint(&pair.local_endpoint),
            self.inner.config.endpoint(&pair.remote_endpoint),
        ) else {
            return Ok(());
        };
        let fingerprint = pair.fingerprint(local, remote);
        match self
            .inner
            .journal
            .swap_fingerprint(&pair.id, &fingerprint)
            .await?
        {
            Some(previous) if previous != fingerprint => tracing::warn!(
                "Pair '{}' configuration changed since the last run (tables, key, mapping or direction); \
                 existing cursors are kept",
                pair.id
            ),
            _ => {}
        }
        Ok(())
    }

    /// Columns of a pair, installing the infrastructure on first use.
    async fn pair_schema(&self, pair: &PairConfig, slot: &PairSlot) -> Result<Arc<PairSchema>> {
        if let Some(schema) = slot.schema.lock().ok().and_then(|s| s.clone()) {
            return Ok(schema);
        }
        let (schema, _) = self.install_pair(pair).await?;
        let schema = Arc::new(schema);
        if let Ok(mut cached) = slot.schema.lock() {
            *cached = Some(Arc::clone(&schema));
        }
        Ok(schema)
    }

    fn forget_schema(&self, slot: &PairSlot) {
        if let Ok(mut cached) = slot.schema.lock() {
            *cached = None;
        }
    }

    /// Drop triggers, trigger functions and changelogs of every pair, and clear the
    /// cursors that pointed into the dropped changelogs. Cursor tables themselves stay.
    pub async fn teardown_infrastructure(&self) -> Result<()> {
        for pair in &self.inner.config.pairs {
            let (_, slot) = self.pair(&pair.id)?;
            let _guard = slot.lock.lock().await;
            for side in [Side::Local, Side::Remote] {
                let conn = self.connection(pair.endpoint(side)).await?;
                let table = TableName::new(conn.schema(), pair.table(side));
                installer::teardown_infrastructure(conn.as_ref(), &table).await?;
                self.inner
                    .journal
                    .reset_compaction(conn.endpoint_id(), &table.name)
                    .await?;
            }
            for side in [Side::Local, Side::Remote] {
                let peer = self.connection(pair.endpoint(side.opposite())).await?;
                apply::reset_cursor(
                    peer.as_ref(),
                    pair.endpoint(side),
                    pair.table(side.opposite()),
                )
                .await?;
            }
            self.forget_schema(slot);
        }
        Ok(())
    }

    /// Static checks plus live checks against every endpoint. Returns every problem found.
    pub async fn validate_configuration(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = self.inner.config.validate() {
            problems.push(e.to_string());
        }

        for pair in &self.inner.config.pairs {
            for side in [Side::Local, Side::Remote] {
                let conn = match self.connection(pair.endpoint(side)).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        problems.push(format!("pair '{}': {}", pair.id, e));
                        continue;
                    }
                };
                let table = TableName::new(conn.schema(), pair.table(side));
                match installer::check_table(conn.as_ref(), &table, &pair.primary_key_on(side))
                    .await
                {
                    Ok(columns) => {
                        for column in mapped_columns(pair, side) {
                            if !columns.contains(&column) {
                                problems.push(format!(
                                    "pair '{}': column '{}' is mapped but missing from {} table '{}'",
                                    pair.id, column, side, table.name
                                ));
                            }
                        }
                    }
                    Err(e) => {
                        problems.push(format!("pair '{}': {}", pair.id, e));
                        continue;
                    }
                }
                let capture = pair.direction.reads_from(side);
                match installer::verify_infrastructure(
                    conn.as_ref(),
                    &table,
                    &pair.primary_key_on(side),
                )
                .await
                {
                    Ok(report) if !report.is_complete(capture) => problems.push(format!(
                        "pair '{}': sync infrastructure on {} table '{}' is incomplete \
                         (missing triggers: {:?}, outdated triggers: {:?}); run setup",
                        pair.id, side, table.name, report.missing_triggers, report.stale_triggers
                    )),
                    Ok(_) => {}
                    Err(e) => problems.push(format!("pair '{}': {}", pair.id, e)),
                }
            }
        }
        problems
    }

    /// Try to connect to every configured endpoint.
    pub async fn check_connections(&self) -> Vec<ConnectionCheck> {
        let mut checks = Vec::new();
        for endpoint in &self.inner.config.endpoints {
            self.evict(&endpoint.id).await;
            let outcome = match self.connection(&endpoint.id).await {
                Ok(conn) => adapter::database_clock(conn.as_ref()).await.map(|_| ()),
                Err(e) => Err(e),
            };
            checks.push(ConnectionCheck {
                endpoint: endpoint.id.clone(),
                dialect: endpoint.dialect.as_str().to_string(),
                dsn: endpoint.display_dsn(),
                ok: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
        checks
    }

    /// User tables of an endpoint, without changelogs and support tables.
    pub async fn list_tables(&self, endpoint_id: &str) -> Result<Vec<String>> {
        let conn = self.connection(endpoint_id).await?;
        adapter::list_user_tables(conn.as_ref()).await
    }

    // ----- jobs -----

    /// Run one job for `pair_id` now and wait for it. Waits for an in-flight job first.
    pub async fn run_pair_now(&self, pair_id: &str) -> Result<CycleReport> {
        let (_, slot) = self.pair(pair_id)?;
        let guard = Arc::clone(&slot.lock).lock_owned().await;
        let report = self.run_job(pair_id).await;
        drop(guard);
        report
    }

    /// Start a job for `pair_id` in the background unless one is already in flight.
    pub fn trigger_manual_sync(&self, pair_id: &str) -> Result<TriggerOutcome> {
        let (_, slot) = self.pair(pair_id)?;
        let guard = match Arc::clone(&slot.lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Sync for '{}' already in flight; coalesced", pair_id);
                return Ok(TriggerOutcome::Coalesced);
            }
        };
        let engine = self.clone();
        let pair_id = pair_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.run_job(&pair_id).await {
                tracing::error!("Sync job for '{}' failed: {:?}", pair_id, e);
            }
            drop(guard);
        });
        Ok(TriggerOutcome::Started)
    }

    /// Start the background scheduler. No-op when it is already running.
    pub fn start_scheduler(&self) -> Result<()> {
        let schedule = self.inner.config.schedule.schedule()?;
        let mut handle = self
            .inner
            .scheduler
            .lock()
            .map_err(|_| SyncError::config("scheduler state poisoned"))?;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        self.inner.stop_tx.send_replace(false);
        let engine = self.clone();
        let stop = self.inner.stop_tx.subscribe();
        *handle = Some(tokio::spawn(scheduler::run(engine, schedule, stop)));
        tracing::info!("Scheduler started for {} pair(s)", self.inner.slots.len());
        Ok(())
    }

    /// Stop the scheduler and wait for in-flight jobs to finish their current phase.
    pub async fn stop_scheduler(&self) {
        self.inner.stop_tx.send_replace(true);
        let handle = self
            .inner
            .scheduler
            .lock()
            .ok()
            .and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        for slot in self.inner.slots.values() {
            let _drained = slot.lock.lock().await;
        }
        self.inner.stop_tx.send_replace(false);
        tracing::info!("Scheduler stopped");
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.inner
            .scheduler
            .lock()
            .ok()
            .is_some_and(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
    }

    pub async fn get_status(&self) -> Result<EngineStatus> {
        let mut pairs = Vec::with_capacity(self.inner.slots.len());
        for (pair_id, slot) in &self.inner.slots {
            let mut status = slot
                .status
                .lock()
                .map(|s| s.clone())
                .unwrap_or_else(|_| PairStatus::new(pair_id));
            if let Some(state) = self.inner.journal.pair_state(pair_id).await? {
                status.last_success_at = state.last_success_at;
                status.consecutive_failures = state.consecutive_failures;
                if status.last_error.is_none() && state.consecutive_failures > 0 {
                    status.last_error = state.last_error;
                }
            }
            status.open_conflicts = self.inner.journal.count_open(pair_id).await?;
            pairs.push(status);
        }
        Ok(EngineStatus {
            scheduler_running: self.is_scheduler_running(),
            pairs,
            statistics: self.inner.stats.snapshot(),
        })
    }

    // ----- conflicts -----

    pub async fn list_conflicts(
        &self,
        pair_id: Option<&str>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRow>> {
        if let Some(pair_id) = pair_id {
            self.pair(pair_id)?;
        }
        self.inner.journal.list_conflicts(pair_id, status).await
    }

    /// Settle an open conflict in favour of `winner`.
    ///
    /// The winner's current row (or its absence) is written to the other side with the echo
    /// marker, then the conflict is closed and the key released. Returns `false` when the
    /// conflict was already settled.
    pub async fn resolve_conflict(&self, conflict_id: i64, winner: Side) -> Result<bool> {
        let conflict = self
            .inner
            .journal
            .get_conflict(conflict_id)
            .await?
            .ok_or(SyncError::UnknownConflict(conflict_id))?;
        if conflict.status != ConflictStatus::Open {
            return Ok(false);
        }
        let (pair, slot) = self.pair(&conflict.pair_id)?;
        let _guard = slot.lock.lock().await;
        let schema = self.pair_schema(pair, slot).await?;

        let winner_bytes = match winner {
            Side::Local => &conflict.local_entry,
            Side::Remote => &conflict.remote_entry,
        };
        let recorded = ChangeLogEntry::from_journal_bytes(winner_bytes).ok_or_else(|| {
            SyncError::Journal(anyhow::anyhow!(
                "conflict {conflict_id} has an unreadable {winner} entry"
            ))
        })?;

        let source_conn = self.connection(pair.endpoint(winner)).await?;
        let target_conn = self.connection(pair.endpoint(winner.opposite())).await?;
        let source = table_side(pair, winner, source_conn.as_ref(), &schema);
        let target = table_side(pair, winner.opposite(), target_conn.as_ref(), &schema);

        let mut settled = recorded.clone();
        match apply::read_row(&source, &recorded.primary_key).await? {
            Some(row) => {
                settled.operation = Operation::Update;
                settled.row = Some(row);
            }
            None => {
                settled.operation = Operation::Delete;
                settled.row = None;
            }
        }

        let rows = apply::write_resolution(
            &target,
            source_conn.endpoint_id(),
            &column_map_from(pair, winner),
            &settled,
        )
        .await?;
        let closed = self.inner.journal.mark_resolved(conflict_id, winner).await?;
        self.inner.stats.record_manual_resolution(rows);
        tracing::info!(
            "Conflict {} on '{}' key '{}' resolved for {} side ({})",
            conflict_id,
            pair.id,
            conflict.pk_text,
            winner,
            settled.operation.as_str()
        );
        Ok(closed)
    }

    // ----- compaction -----

    /// Delete changelog rows of `pair_id` that every consumer has applied and no open conflict
    /// still references.
    pub async fn compact(&self, pair_id: &str) -> Result<CompactionReport> {
        let (pair, slot) = self.pair(pair_id)?;
        let _guard = slot.lock.lock().await;
        self.compact_locked(pair).await
    }

    async fn compact_locked(&self, pair: &PairConfig) -> Result<CompactionReport> {
        let mut report = CompactionReport {
            pair_id: pair.id.clone(),
            ..Default::default()
        };
        for side in [Side::Local, Side::Remote] {
            if !pair.direction.reads_from(side) {
                continue;
            }
            let conn = self.connection(pair.endpoint(side)).await?;
            let peer = self.connection(pair.endpoint(side.opposite())).await?;
            let table = TableName::new(conn.schema(), pair.table(side));

            let consumed =
                apply::read_cursor(peer.as_ref(), conn.endpoint_id(), pair.table(side.opposite()))
                    .await?;
            let held = self.inner.journal.min_held_sequence(&pair.id, side).await?;
            let watermark = compaction_watermark(consumed, held);
            let previous = self
                .inner
                .journal
                .compaction_watermark(conn.endpoint_id(), &table.name)
                .await?;
            match side {
                Side::Local => report.local_watermark = Some(watermark),
                Side::Remote => report.remote_watermark = Some(watermark),
            }
            if watermark <= previous {
                continue;
            }

            let stmt = conn.dialect().compact_changelog(&table, watermark);
            let deleted = conn.execute_write(&stmt.sql, &stmt.params).await?;
            self.inner
                .journal
                .advance_compaction(conn.endpoint_id(), &table.name, watermark)
                .await?;
            report.deleted += deleted;
            tracing::debug!(
                "Compacted {} changelog row(s) of '{}' on '{}' up to {}",
                deleted,
                table.name,
                conn.endpoint_id(),
                watermark
            );
        }
        Ok(report)
    }
}

/// Highest sequence id that may be deleted: consumed by the peer and not held by a conflict.
fn compaction_watermark(consumed: i64, min_held: Option<i64>) -> i64 {
    match min_held {
        Some(held) => consumed.min(held - 1),
        None => consumed,
    }
}

/// Columns named in the pair's column mapping, in `side`'s names.
fn mapped_columns(pair: &PairConfig, side: Side) -> Vec<String> {
    match side {
        Side::Local => pair.column_map.keys().cloned().collect(),
        Side::Remote => pair.column_map.values().cloned().collect(),
    }
}

/// Renames applied to rows captured on `from`.
fn column_map_from(pair: &PairConfig, from: Side) -> BTreeMap<String, String> {
    match from {
        Side::Local => pair.column_map.clone(),
        Side::Remote => pair
            .column_map
            .iter()
            .map(|(local, remote)| (remote.clone(), local.clone()))
            .collect(),
    }
}

fn table_side<'a>(
    pair: &PairConfig,
    side: Side,
    conn: &'a dyn Connection,
    schema: &PairSchema,
) -> TableSide<'a> {
    TableSide {
        conn,
        table: TableName::new(conn.schema(), pair.table(side)),
        primary_key: pair.primary_key_on(side),
        columns: schema.columns(side).to_vec(),
        capture: pair.direction.reads_from(side),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Direction;

    fn pair() -> PairConfig {
        let mut column_map = BTreeMap::new();
        column_map.insert("full_name".to_string(), "name".to_string());
        PairConfig {
            id: "customers".into(),
            local_endpoint: "laptop".into(),
            remote_endpoint: "cloud".into(),
            local_table: "customers".into(),
            remote_table: "clients".into(),
            primary_key: vec!["id".into()],
            direction: Direction::Bidirectional,
            column_map,
            conflict: None,
        }
    }

    #[test]
    fn test_compaction_watermark_respects_held_entries() {
        assert_eq!(compaction_watermark(40, None), 40);
        assert_eq!(compaction_watermark(40, Some(12)), 11);
        assert_eq!(compaction_watermark(10, Some(30)), 10);
    }

    #[test]
    fn test_column_map_inverts_for_remote_source() {
        let p = pair();
        assert_eq!(column_map_from(&p, Side::Local)["full_name"], "name");
        assert_eq!(column_map_from(&p, Side::Remote)["name"], "full_name");
        assert_eq!(mapped_columns(&p, Side::Remote), vec!["name".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_pair_is_reported() {
        let engine = SyncEngine::with_journal(
            SyncConfig::from_toml("").unwrap(),
            JournalHandle::in_memory().unwrap(),
        );
        assert!(matches!(
            engine.trigger_manual_sync("nope"),
            Err(SyncError::UnknownPair(_))
        ));
        assert!(matches!(
            engine.resolve_conflict(7, Side::Local).await,
            Err(SyncError::UnknownConflict(7))
        ));
        let status = engine.get_status().await.unwrap();
        assert!(status.pairs.is_empty());
        assert!(!status.scheduler_running);
    }
}
