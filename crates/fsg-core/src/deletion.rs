//! Deferred deletion of delivered content.
//!
//! The durable `pending_deletes.json` record, not the in-process timer, is what
//! says a deletion is still owed. `schedule` persists before it arms;
//! `recover_on_startup` re-arms (or fires) whatever a previous process left
//! behind. Removal is best-effort; bookkeeping cleanup is not.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    delivery::port::DeliveryPort,
    domain::{ChatId, MessageId, MessageRef},
    retention::RetentionPolicies,
    store::Collection,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeletion {
    pub destination: ChatId,
    pub message: MessageId,
    /// Unix seconds.
    pub fire_at: i64,
}

impl PendingDeletion {
    pub fn key(&self) -> String {
        pending_key(self.destination, self.message)
    }

    pub fn delivered(&self) -> MessageRef {
        MessageRef {
            chat_id: self.destination,
            message_id: self.message,
        }
    }
}

fn pending_key(dest: ChatId, msg: MessageId) -> String {
    format!("{}:{}", dest.0, msg.0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireOutcome {
    Removed,
    /// The removal attempt failed; the obligation is still considered met.
    RemovalFailed,
    /// Nothing owed (already fired, cancelled, or a duplicate fire in flight).
    NothingPending,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub fired: usize,
    pub rearmed: usize,
}

#[derive(Clone)]
pub struct DeletionScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    pending: Collection<PendingDeletion>,
    delivery: Arc<dyn DeliveryPort>,
    retention: Arc<RetentionPolicies>,
    clock: Arc<dyn Clock>,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    timers: HashMap<String, TimerEntry>,
    in_flight: HashSet<String>,
}

struct TimerEntry {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeletionScheduler {
    pub fn new(
        data_dir: &std::path::Path,
        delivery: Arc<dyn DeliveryPort>,
        retention: Arc<RetentionPolicies>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                pending: Collection::open(data_dir, "pending_deletes"),
                delivery,
                retention,
                clock,
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Remove `message` from `dest` after `minutes`. `0` is a no-op.
    ///
    /// Scheduling the same message again replaces the earlier deadline.
    pub async fn schedule(
        &self,
        dest: ChatId,
        message: MessageId,
        minutes: u32,
    ) -> Result<Option<PendingDeletion>> {
        if minutes == 0 {
            return Ok(None);
        }

        let entry = PendingDeletion {
            destination: dest,
            message,
            fire_at: self.inner.clock.unix_now() + i64::from(minutes) * 60,
        };

        // Durable first: a crash after this line is recovered on startup.
        self.inner.pending.insert(&entry.key(), entry).await?;
        self.arm(entry).await;

        info!(
            "[DELETE] scheduled {} in {minutes} min",
            entry.delivered()
        );
        Ok(Some(entry))
    }

    /// `schedule` with the destination's retention policy.
    pub async fn schedule_with_policy(
        &self,
        dest: ChatId,
        message: MessageId,
    ) -> Result<Option<PendingDeletion>> {
        let minutes = self.inner.retention.minutes_for(dest).await;
        self.schedule(dest, message, minutes).await
    }

    /// Execute the deletion owed for `(dest, message)`, if any.
    ///
    /// At most one removal attempt per pending record: a duplicate fire finds
    /// either the key in flight or the record already gone.
    pub async fn on_fire(&self, dest: ChatId, message: MessageId) -> FireOutcome {
        let key = pending_key(dest, message);

        {
            let mut st = self.inner.state.lock().await;
            if !st.in_flight.insert(key.clone()) {
                debug!("[DELETE] {key} already firing");
                return FireOutcome::NothingPending;
            }
        }

        let outcome = self.fire_locked(&key, dest, message).await;

        let mut st = self.inner.state.lock().await;
        st.in_flight.remove(&key);
        outcome
    }

    async fn fire_locked(&self, key: &str, dest: ChatId, message: MessageId) -> FireOutcome {
        let owed = match self.inner.pending.get(key).await {
            Ok(Some(p)) => Some(p),
            Ok(None) => {
                debug!("[DELETE] {key} has nothing pending");
                self.drop_timer(key).await;
                return FireOutcome::NothingPending;
            }
            Err(e) => {
                // Cannot tell; attempt the removal rather than leave content up.
                error!("[DELETE] pending store unreadable for {key}: {e}");
                None
            }
        };

        let delivered = MessageRef {
            chat_id: dest,
            message_id: message,
        };
        let outcome = match self.inner.delivery.remove(delivered).await {
            Ok(()) => {
                info!("[DELETE] removed {delivered}");
                FireOutcome::Removed
            }
            Err(e) => {
                warn!("[DELETE] removal of {delivered} failed, treating as done: {e}");
                FireOutcome::RemovalFailed
            }
        };

        // Only clear the obligation that was fired; a newer deadline stays.
        let fired_at = owed.map(|p| p.fire_at);
        let cleared = self
            .inner
            .pending
            .upsert(key, |cur| match cur {
                Some(p) if fired_at.is_none() || Some(p.fire_at) == fired_at => None,
                other => other,
            })
            .await;
        match cleared {
            Ok(Some(_)) => debug!("[DELETE] {key} was rescheduled meanwhile, keeping it"),
            Ok(None) => self.drop_timer(key).await,
            Err(e) => error!("[DELETE] failed to clear pending record {key}: {e}"),
        }

        outcome
    }

    /// Load every persisted deletion: fire the overdue ones now, re-arm the rest.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let entries = self.inner.pending.entries().await?;
        let now = self.inner.clock.unix_now();

        let mut report = RecoveryReport::default();
        for (_, entry) in entries {
            if entry.fire_at <= now {
                self.on_fire(entry.destination, entry.message).await;
                report.fired += 1;
            } else {
                self.arm(entry).await;
                report.rearmed += 1;
            }
        }

        info!(
            "[DELETE] recovered pending deletions: {} fired, {} re-armed",
            report.fired, report.rearmed
        );
        Ok(report)
    }

    /// Administrative purge of one pending deletion. The content stays up.
    pub async fn cancel(&self, dest: ChatId, message: MessageId) -> Result<bool> {
        let key = pending_key(dest, message);
        let existed = self.inner.pending.remove(&key).await?.is_some();
        self.drop_timer(&key).await;
        if existed {
            info!("[DELETE] cancelled {key}");
        }
        Ok(existed)
    }

    pub async fn pending(&self) -> Result<Vec<PendingDeletion>> {
        Ok(self
            .inner
            .pending
            .entries()
            .await?
            .into_iter()
            .map(|(_, p)| p)
            .collect())
    }

    pub async fn armed_count(&self) -> usize {
        self.inner.state.lock().await.timers.len()
    }

    /// Stop every in-process timer. Persisted records stay for the next start.
    pub async fn shutdown(&self) {
        let mut st = self.inner.state.lock().await;
        for (_, timer) in st.timers.drain() {
            timer.cancel.cancel();
            timer.handle.abort(); // best-effort
        }
    }

    pub(crate) fn collection(&self) -> &Collection<PendingDeletion> {
        &self.inner.pending
    }

    async fn arm(&self, entry: PendingDeletion) {
        let key = entry.key();
        let delay = (entry.fire_at - self.inner.clock.unix_now()).max(0) as u64;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {
                    scheduler.on_fire(entry.destination, entry.message).await;
                }
            }
        });

        let mut st = self.inner.state.lock().await;
        if let Some(prev) = st.timers.insert(key, TimerEntry { cancel, handle }) {
            prev.cancel.cancel();
        }
    }

    async fn drop_timer(&self, key: &str) {
        let mut st = self.inner.state.lock().await;
        if let Some(timer) = st.timers.remove(key) {
            // The firing task may be the caller; cancelling after its sleep
            // completed is a no-op.
            timer.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::{
        clock::ManualClock,
        testkit::{config_handle, tmp_dir, RecordingDelivery},
    };

    struct Fixture {
        scheduler: DeletionScheduler,
        delivery: Arc<RecordingDelivery>,
        clock: Arc<ManualClock>,
        dir: std::path::PathBuf,
    }

    fn fixture_in(dir: &std::path::Path, clock: Arc<ManualClock>) -> Fixture {
        let delivery = Arc::new(RecordingDelivery::default());
        let retention = Arc::new(RetentionPolicies::new(
            dir,
            config_handle(dir, &[("AUTO_DELETE", "5")]),
        ));
        Fixture {
            scheduler: DeletionScheduler::new(dir, delivery.clone(), retention, clock.clone()),
            delivery,
            clock,
            dir: dir.to_path_buf(),
        }
    }

    fn fixture(prefix: &str) -> Fixture {
        fixture_in(&tmp_dir(prefix), Arc::new(ManualClock::at_unix(1_000)))
    }

    const DEST: ChatId = ChatId(42);

    #[tokio::test(start_paused = true)]
    async fn zero_minutes_is_a_noop() {
        let f = fixture("fsg-delete-zero");
        assert_eq!(f.scheduler.schedule(DEST, MessageId(1), 0).await.unwrap(), None);
        assert!(f.scheduler.pending().await.unwrap().is_empty());
        assert_eq!(f.scheduler.armed_count().await, 0);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_before_the_timer_fires_then_cleared() {
        let f = fixture("fsg-delete-fire");
        let entry = f.scheduler.schedule(DEST, MessageId(7), 1).await.unwrap().unwrap();
        assert_eq!(entry.fire_at, 1_060);
        assert_eq!(f.scheduler.pending().await.unwrap(), vec![entry]);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(f.delivery.removals().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.delivery.removals(), vec![MessageRef::new(42, 7)]);
        assert!(f.scheduler.pending().await.unwrap().is_empty());
        assert_eq!(f.scheduler.armed_count().await, 0);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_deletion_survives_restart() {
        let dir = tmp_dir("fsg-delete-restart");
        let clock = Arc::new(ManualClock::at_unix(1_000));

        let before = fixture_in(&dir, clock.clone());
        before.scheduler.schedule(DEST, MessageId(3), 1).await.unwrap();
        // Process dies: no timers survive.
        before.scheduler.shutdown().await;
        drop(before);

        clock.advance(ChronoDuration::seconds(61));
        let after = fixture_in(&dir, clock.clone());
        let report = after.scheduler.recover_on_startup().await.unwrap();
        assert_eq!(report, RecoveryReport { fired: 1, rearmed: 0 });
        assert_eq!(after.delivery.removals(), vec![MessageRef::new(42, 3)]);
        assert!(after.scheduler.pending().await.unwrap().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn future_deletion_is_rearmed_on_restart() {
        let dir = tmp_dir("fsg-delete-rearm");
        let clock = Arc::new(ManualClock::at_unix(1_000));

        let before = fixture_in(&dir, clock.clone());
        before.scheduler.schedule(DEST, MessageId(4), 2).await.unwrap();
        before.scheduler.shutdown().await;
        drop(before);

        clock.advance(ChronoDuration::seconds(30));
        let after = fixture_in(&dir, clock.clone());
        let report = after.scheduler.recover_on_startup().await.unwrap();
        assert_eq!(report, RecoveryReport { fired: 0, rearmed: 1 });
        assert!(after.delivery.removals().is_empty());

        // 120s deadline, 30s already elapsed.
        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(after.delivery.removals(), vec![MessageRef::new(42, 4)]);
        assert!(after.scheduler.pending().await.unwrap().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_fire_removes_at_most_once() {
        let f = fixture("fsg-delete-dup");
        f.scheduler.schedule(DEST, MessageId(5), 10).await.unwrap();

        assert_eq!(f.scheduler.on_fire(DEST, MessageId(5)).await, FireOutcome::Removed);
        assert_eq!(
            f.scheduler.on_fire(DEST, MessageId(5)).await,
            FireOutcome::NothingPending
        );
        assert_eq!(f.delivery.removals().len(), 1);
        assert!(f.scheduler.pending().await.unwrap().is_empty());

        // The armed timer was dropped with the record.
        tokio::time::sleep(Duration::from_secs(11 * 60)).await;
        assert_eq!(f.delivery.removals().len(), 1);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicate_fires_remove_once() {
        let f = fixture("fsg-delete-dup-concurrent");
        f.scheduler.schedule(DEST, MessageId(6), 10).await.unwrap();

        let (a, b) = tokio::join!(
            f.scheduler.on_fire(DEST, MessageId(6)),
            f.scheduler.on_fire(DEST, MessageId(6))
        );
        assert!(matches!(
            (a, b),
            (FireOutcome::Removed, FireOutcome::NothingPending)
                | (FireOutcome::NothingPending, FireOutcome::Removed)
        ));
        assert_eq!(f.delivery.removals().len(), 1);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_removal_still_clears_the_record() {
        let f = fixture("fsg-delete-fail");
        f.delivery.fail_removals(true);
        f.scheduler.schedule(DEST, MessageId(8), 1).await.unwrap();

        assert_eq!(
            f.scheduler.on_fire(DEST, MessageId(8)).await,
            FireOutcome::RemovalFailed
        );
        assert!(f.scheduler.pending().await.unwrap().is_empty());
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_purges_record_and_timer() {
        let f = fixture("fsg-delete-cancel");
        f.scheduler.schedule(DEST, MessageId(9), 1).await.unwrap();
        assert!(f.scheduler.cancel(DEST, MessageId(9)).await.unwrap());
        assert!(!f.scheduler.cancel(DEST, MessageId(9)).await.unwrap());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(f.delivery.removals().is_empty());
        assert!(f.scheduler.pending().await.unwrap().is_empty());
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_collapses_to_one_record() {
        let f = fixture("fsg-delete-collapse");
        f.scheduler.schedule(DEST, MessageId(2), 1).await.unwrap();
        f.scheduler.schedule(DEST, MessageId(2), 3).await.unwrap();

        let pending = f.scheduler.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fire_at, 1_000 + 180);
        assert_eq!(f.scheduler.armed_count().await, 1);

        // The replaced one-minute timer does not fire.
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(f.delivery.removals().is_empty());
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(f.delivery.removals().len(), 1);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn policy_override_is_consulted_before_default() {
        let f = fixture("fsg-delete-policy");
        let entry = f
            .scheduler
            .schedule_with_policy(DEST, MessageId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.fire_at, 1_000 + 5 * 60);

        f.scheduler.inner.retention.set(ChatId(43), 0).await.unwrap();
        assert_eq!(
            f.scheduler.schedule_with_policy(ChatId(43), MessageId(1)).await.unwrap(),
            None
        );
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_jump_does_not_fire_early_timers_but_recovery_does() {
        let f = fixture("fsg-delete-jump");
        f.scheduler.schedule(DEST, MessageId(11), 5).await.unwrap();
        f.clock.advance(ChronoDuration::minutes(10));
        // The in-process timer follows tokio time; recovery follows the clock.
        assert!(f.delivery.removals().is_empty());
        let report = f.scheduler.recover_on_startup().await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(f.delivery.removals().len(), 1);
        let _ = fs::remove_dir_all(&f.dir);
    }
}
