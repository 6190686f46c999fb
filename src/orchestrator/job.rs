// ABOUTME: One sync job for a table pair: read, resolve, journal, apply, with retry and backoff
// ABOUTME: Phases run in order; a stop request is honoured between phases, never mid-statement

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{column_map_from, table_side, CycleReport, JobState, PairSlot, SyncEngine};
use crate::apply::{self, ApplyPlan};
use crate::config::PairConfig;
use crate::error::{Result, SyncError};
use crate::journal::Decisions;
use crate::model::Side;
use crate::reader::{ChangeReader, PendingBatch};
use crate::resolver::{resolve, ResolveInput};
use crate::utils::backoff_delay;

impl SyncEngine {
    /// Run cycles for `pair_id` until one commits, a fatal error occurs, or attempts run out.
    ///
    /// The caller holds the pair's job lock.
    pub(super) async fn run_job(&self, pair_id: &str) -> Result<CycleReport> {
        let (pair, slot) = self.pair(pair_id)?;
        let retry = &self.inner.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let _permit = self
            .inner
            .workers
            .acquire()
            .await
            .map_err(|_| SyncError::config("worker pool closed"))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_cycle(pair, slot).await {
                Ok(report) => {
                    if report.stopped {
                        self.set_state(slot, JobState::Idle);
                        return Ok(report);
                    }
                    self.inner.journal.record_success(&pair.id).await?;
                    self.inner.stats.record_cycle(&report);
                    if let Ok(mut status) = slot.status.lock() {
                        status.state = JobState::Committed;
                        status.degraded = false;
                        status.last_error = None;
                        status.last_cycle = Some(report.clone());
                    }
                    tracing::info!(
                        "Pair '{}' committed: {} to local, {} to remote, {} conflict(s), {} held in {}ms",
                        pair.id,
                        report.applied_to_local,
                        report.applied_to_remote,
                        report.conflicts,
                        report.held,
                        report.duration_ms
                    );
                    return Ok(report);
                }
                Err(e) => {
                    if let Some(endpoint) = e.endpoint() {
                        if matches!(e, SyncError::Connectivity { .. } | SyncError::Timeout { .. }) {
                            self.evict(endpoint).await;
                        }
                    }
                    if matches!(e, SyncError::Schema { .. } | SyncError::ApplyEscalated { .. }) {
                        self.forget_schema(slot);
                    }

                    let retryable = e.is_retryable();
                    if retryable && attempt < max_attempts && !self.stop_requested() {
                        let delay = backoff_delay(
                            attempt - 1,
                            Duration::from_millis(retry.backoff_base_ms),
                            Duration::from_millis(retry.backoff_cap_ms),
                        );
                        tracing::warn!(
                            "Pair '{}' attempt {}/{} failed: {}; retrying in {:?}",
                            pair.id,
                            attempt,
                            max_attempts,
                            e,
                            delay
                        );
                        self.set_state(slot, JobState::Failed { retryable: true });
                        if self.wait_or_stop(delay).await {
                            self.set_state(slot, JobState::Idle);
                            return Err(e);
                        }
                        self.set_state(slot, JobState::Idle);
                        continue;
                    }

                    self.inner.stats.record_failure();
                    let failures = self
                        .inner
                        .journal
                        .record_failure(&pair.id, &e.to_string())
                        .await?;
                    if let Ok(mut status) = slot.status.lock() {
                        status.state = JobState::Failed { retryable };
                        status.degraded = retryable;
                        status.last_error = Some(e.to_string());
                    }
                    if retryable {
                        tracing::warn!(
                            "Pair '{}' degraded after {} attempt(s) ({} consecutive failures): {}",
                            pair.id,
                            attempt,
                            failures,
                            e
                        );
                    } else {
                        tracing::error!("Pair '{}' failed: {:?}", pair.id, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Sleep for `delay` unless a stop arrives first. Returns true when stopped.
    async fn wait_or_stop(&self, delay: Duration) -> bool {
        let mut stop = self.inner.stop_tx.subscribe();
        if *stop.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = stop.changed() => changed.is_ok() && *stop.borrow(),
        }
    }

    async fn run_cycle(&self, pair: &PairConfig, slot: &PairSlot) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport {
            pair_id: pair.id.clone(),
            ..Default::default()
        };
        let engine = &self.inner.config.engine;

        // Reading
        self.set_state(slot, JobState::Reading);
        let local_conn = self.connection(&pair.local_endpoint).await?;
        let remote_conn = self.connection(&pair.remote_endpoint).await?;
        let schema = self.pair_schema(pair, slot).await?;
        let local = table_side(pair, Side::Local, local_conn.as_ref(), &schema);
        let remote = table_side(pair, Side::Remote, remote_conn.as_ref(), &schema);
        let grace = Duration::from_millis(engine.gap_grace_ms);

        let local_batch = if local.capture {
            let since =
                apply::read_cursor(remote.conn, local.endpoint_id(), &remote.table.name).await?;
            ChangeReader::new(local.conn, engine.batch_size, grace)
                .read_pending(&local.table, since)
                .await?
        } else {
            PendingBatch::default()
        };
        let remote_batch = if remote.capture {
            let since =
                apply::read_cursor(local.conn, remote.endpoint_id(), &local.table.name).await?;
            ChangeReader::new(remote.conn, engine.batch_size, grace)
                .read_pending(&remote.table, since)
                .await?
        } else {
            PendingBatch::default()
        };
        report.local_high_water = local_batch.high_water;
        report.remote_high_water = remote_batch.high_water;
        tracing::debug!(
            "Pair '{}' read {} local and {} remote change(s)",
            pair.id,
            local_batch.entries.len(),
            remote_batch.entries.len()
        );
        if self.stop_requested() {
            return Ok(stopped(report, started));
        }

        // Resolving
        self.set_state(slot, JobState::Resolving);
        let open_conflicts: HashMap<String, i64> =
            self.inner.journal.open_conflict_keys(&pair.id).await?;
        let strategy = pair.strategy(&self.inner.config.conflict);
        let resolution = resolve(ResolveInput {
            local_endpoint: local.endpoint_id(),
            remote_endpoint: remote.endpoint_id(),
            strategy,
            local: &local_batch.entries,
            remote: &remote_batch.entries,
            column_map: &pair.column_map,
            open_conflicts: &open_conflicts,
        });
        let recorded = self
            .inner
            .journal
            .record_resolution(
                &pair.id,
                &local.table.name,
                strategy.name(),
                &resolution,
                Decisions::Pending,
            )
            .await?;
        report.conflicts = recorded.conflicts;
        report.opened = recorded.opened;
        report.held = recorded.held;
        report.convergent = resolution.convergent;
        for (conflict_id, pk_text) in recorded.awaiting {
            let waiting = SyncError::ConflictUnresolved {
                pair_id: pair.id.clone(),
                pk_text,
                conflict_id,
            };
            tracing::warn!("{}", waiting);
            report.unresolved.push(waiting.to_string());
        }
        if self.stop_requested() {
            return Ok(stopped(report, started));
        }

        // Applying. Each direction commits on its own; a concurrent-change rejection on one
        // side does not hold back the other.
        self.set_state(slot, JobState::Applying);
        let mut deferred: Option<SyncError> = None;
        for source_side in [Side::Local, Side::Remote] {
            let (source, target, batch, peer_batch) = match source_side {
                Side::Local => (&local, &remote, &local_batch, &remote_batch),
                Side::Remote => (&remote, &local, &remote_batch, &local_batch),
            };
            if !source.capture {
                continue;
            }
            let plan = ApplyPlan {
                source_endpoint: source.endpoint_id().to_string(),
                entries: resolution.apply_to(source_side.opposite()).to_vec(),
                source_high_water: batch.high_water,
                target_high_water: peer_batch.high_water,
                column_map: column_map_from(pair, source_side),
            };
            match apply::apply(source, target, &plan).await {
                Ok(result) => {
                    report.skipped += result.skipped;
                    match source_side {
                        Side::Local => report.applied_to_remote = result.applied,
                        Side::Remote => report.applied_to_local = result.applied,
                    }
                    // Audit rows only for wins that are now durable on the target.
                    let won = self
                        .inner
                        .journal
                        .record_resolution(
                            &pair.id,
                            &local.table.name,
                            strategy.name(),
                            &resolution,
                            Decisions::WonBy(source_side),
                        )
                        .await?;
                    report.conflicts += won.conflicts;
                }
                Err(e @ SyncError::ConcurrentChange { .. }) => {
                    tracing::warn!("Pair '{}': {}", pair.id, e);
                    deferred = Some(e);
                }
                Err(e) => return Err(e),
            }
            if self.stop_requested() {
                return Ok(stopped(report, started));
            }
        }
        if let Some(e) = deferred {
            return Err(e);
        }

        if engine.compact_after_sync {
            match self.compact_locked(pair).await {
                Ok(compaction) => report.compacted = compaction.deleted,
                Err(e) => tracing::warn!("Compaction of '{}' failed: {}", pair.id, e),
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }
}

fn stopped(mut report: CycleReport, started: Instant) -> CycleReport {
    tracing::info!("Pair '{}' stopping between phases", report.pair_id);
    report.stopped = true;
    report.duration_ms = started.elapsed().as_millis() as u64;
    report
}
