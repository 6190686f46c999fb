// ABOUTME: Scheduler loop that starts pair jobs on a fixed interval or a cron schedule
// ABOUTME: Ticks coalesce with in-flight jobs; fatal pairs wait for a manual run

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::{JobState, SyncEngine, TriggerOutcome};
use crate::config::Schedule;

pub(super) async fn run(engine: SyncEngine, schedule: Schedule, mut stop: watch::Receiver<bool>) {
    let mut ticks = 0u64;
    match schedule {
        Schedule::Interval(every) => {
            tracing::info!("Scheduling sync every {:?}", every);
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    _ = interval.tick() => {
                        ticks += 1;
                        start_due_pairs(&engine, ticks);
                    }
                }
            }
        }
        Schedule::Cron(cron) => loop {
            let Some(delay) = until_next(&cron, Utc::now()) else {
                tracing::warn!("Cron schedule has no upcoming run; scheduler exiting");
                break;
            };
            tracing::debug!("Next scheduled sync in {:?}", delay);
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                _ = tokio::time::sleep(delay) => {
                    ticks += 1;
                    start_due_pairs(&engine, ticks);
                }
            }
        },
    }
    tracing::debug!("Scheduler loop exited after {} tick(s)", ticks);
}

/// Resolves once the stop flag is set.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

fn start_due_pairs(engine: &SyncEngine, tick: u64) {
    tracing::debug!("Scheduler tick {}", tick);
    for (pair_id, slot) in &engine.inner.slots {
        let state = slot.status.lock().map(|s| s.state).unwrap_or(JobState::Idle);
        if state == (JobState::Failed { retryable: false }) {
            tracing::debug!("Skipping '{}' until it is run manually", pair_id);
            continue;
        }
        match engine.trigger_manual_sync(pair_id) {
            Ok(TriggerOutcome::Started) => {}
            Ok(TriggerOutcome::Coalesced) => {
                tracing::debug!("Pair '{}' still running; tick coalesced", pair_id)
            }
            Err(e) => tracing::error!("Failed to start '{}': {}", pair_id, e),
        }
    }
}

/// Time until the next cron occurrence after `now`.
fn until_next(schedule: &cron::Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    #[test]
    fn test_until_next_cron_occurrence() {
        let every_five = cron::Schedule::from_str("0 */5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 2, 30).unwrap();
        assert_eq!(until_next(&every_five, now), Some(Duration::from_secs(150)));
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_flag() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { stopped(&mut rx).await });
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
