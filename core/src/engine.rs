use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::collections::{
    CardioSessions, CollectionReport, DailyLogs, Meals, Phases, Profiles, Routines,
    StrengthSets, sync_collection,
};
use crate::db::LocalStore;
use crate::models::{SyncStatus, Timestamp, epoch, format_timestamp};
use crate::monitor::{Signal, SignalSender};
use crate::remote::{RemoteClient, RemoteError};
use crate::tracker::ChangeTracker;

/// Timing knobs for the monitor.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last local edit before a pass starts.
    pub debounce: Duration,
    pub periodic_interval: Duration,
    /// Delay before retrying a pass the remote rejected.
    pub retry_backoff: Duration,
    pub probe_interval: Duration,
    /// How often to look for dirty markers written by other processes.
    pub marker_poll: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            periodic_interval: Duration::from_secs(5 * 60),
            retry_backoff: Duration::from_secs(10),
            probe_interval: Duration::from_secs(15),
            marker_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("offline: no network reachable")]
    Offline,
    #[error("{collection}: {source}")]
    Remote {
        collection: &'static str,
        #[source]
        source: RemoteError,
    },
    #[error("{collection}: local store failed: {source}")]
    Local {
        collection: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SyncError {
    pub fn remote(collection: &'static str, source: RemoteError) -> Self {
        Self::Remote { collection, source }
    }

    pub fn local(collection: &'static str, source: anyhow::Error) -> Self {
        Self::Local {
            collection,
            source: source.into(),
        }
    }

    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Offline => true,
            Self::Remote { source, .. } => source.is_connectivity(),
            Self::Local { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoUser,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Watermark the pass started from.
    pub since: Timestamp,
    /// Start of the pass; the new watermark.
    pub started: Timestamp,
    pub collections: Vec<CollectionReport>,
}

impl SyncReport {
    pub fn pushed(&self) -> usize {
        self.collections.iter().map(|c| c.pushed).sum()
    }

    pub fn pulled(&self) -> usize {
        self.collections.iter().map(|c| c.pulled).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

/// Clears the in-progress flag however the pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs synchronization passes between the local store and the remote.
/// Construct once and share behind an `Arc`.
pub struct SyncEngine {
    store: Arc<Mutex<LocalStore>>,
    remote: RemoteClient,
    tracker: ChangeTracker,
    clock: Arc<dyn Clock>,
    signals: SignalSender,
    online: AtomicBool,
    in_progress: AtomicBool,
    last_sync: Mutex<Option<Timestamp>>,
    user: Mutex<Option<String>>,
}

impl SyncEngine {
    /// Picks up the persisted watermark and signed-in user from the store.
    pub fn new(
        store: Arc<Mutex<LocalStore>>,
        remote: RemoteClient,
        tracker: ChangeTracker,
        clock: Arc<dyn Clock>,
        signals: SignalSender,
    ) -> Result<Self> {
        let (last_sync, user) = {
            let store = store.lock().unwrap_or_else(PoisonError::into_inner);
            (store.last_sync()?, store.session_user()?)
        };
        Ok(Self {
            store,
            remote,
            tracker,
            clock,
            signals,
            online: AtomicBool::new(true),
            in_progress: AtomicBool::new(false),
            last_sync: Mutex::new(last_sync),
            user: Mutex::new(user),
        })
    }

    pub fn store(&self) -> &Arc<Mutex<LocalStore>> {
        &self.store
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn signals(&self) -> &SignalSender {
        &self.signals
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    // --- Identity ---

    pub fn user_id(&self) -> Option<String> {
        self.user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Use `user_id` for this process only.
    pub fn set_user(&self, user_id: Option<String>) {
        *self.user.lock().unwrap_or_else(PoisonError::into_inner) = user_id;
    }

    /// Remember `user_id` across runs and sync on their behalf.
    pub fn sign_in(&self, user_id: &str) -> Result<()> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_session_user(Some(user_id))?;
        self.set_user(Some(user_id.to_string()));
        info!(user_id, "signed in");
        Ok(())
    }

    pub fn sign_out(&self) -> Result<()> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_session_user(None)?;
        self.set_user(None);
        Ok(())
    }

    // --- Connectivity ---

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    /// Whether the remote answers right now. Does not change the online flag.
    pub async fn probe(&self) -> bool {
        match self.remote.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "remote probe failed");
                false
            }
        }
    }

    /// Probe and record the result.
    pub async fn refresh_connectivity(&self) -> bool {
        let online = self.probe().await;
        self.set_online(online);
        online
    }

    // --- Public contract ---

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.is_online(),
            last_sync: *self
                .last_sync
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            pending_changes: self.tracker.pending(),
            sync_in_progress: self.in_progress.load(Ordering::SeqCst),
        }
    }

    /// Record a local mutation and schedule a debounced pass.
    pub fn mark_pending_changes(&self) {
        self.tracker.mark();
    }

    /// Ask the monitor for a debounced pass. Never fails.
    pub fn request_sync(&self) {
        self.signals.send(Signal::SyncRequested);
    }

    /// Run a pass now and report how it ended.
    pub async fn force_sync(&self) -> Result<SyncOutcome, SyncError> {
        self.run_pass().await
    }

    /// Run a pass, logging instead of returning failures.
    pub async fn sync_in_background(&self) {
        match self.run_pass().await {
            Ok(SyncOutcome::Completed(report)) => {
                debug!(
                    pushed = report.pushed(),
                    pulled = report.pulled(),
                    "background sync finished"
                );
            }
            Ok(SyncOutcome::Skipped(reason)) => debug!(?reason, "background sync skipped"),
            Err(e) => debug!(error = %e, "background sync failed"),
        }
    }

    async fn run_pass(&self) -> Result<SyncOutcome, SyncError> {
        let Some(user_id) = self.user_id() else {
            return Ok(SyncOutcome::Skipped(SkipReason::NoUser));
        };
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let started = self.clock.now();
        let pending_at_start = self.tracker.pending();
        let since = self
            .last_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or_else(epoch);
        debug!(user_id, watermark = %format_timestamp(&since), "sync pass started");

        match self.sync_all(&user_id, &since).await {
            Ok(collections) => {
                self.advance_watermark(&started)?;
                let remaining = self.tracker.settle(pending_at_start);
                let report = SyncReport {
                    since,
                    started,
                    collections,
                };
                info!(
                    pushed = report.pushed(),
                    pulled = report.pulled(),
                    remaining,
                    watermark = %format_timestamp(&started),
                    "sync pass complete"
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                self.handle_failure(&e);
                Err(e)
            }
        }
    }

    /// Every collection in dependency order, stopping at the first failure.
    async fn sync_all(
        &self,
        user_id: &str,
        since: &Timestamp,
    ) -> Result<Vec<CollectionReport>, SyncError> {
        let store = self.store.as_ref();
        let remote = &self.remote;
        Ok(vec![
            sync_collection(&Profiles, store, remote, user_id, since).await?,
            sync_collection(&DailyLogs, store, remote, user_id, since).await?,
            sync_collection(&Meals, store, remote, user_id, since).await?,
            sync_collection(&StrengthSets, store, remote, user_id, since).await?,
            sync_collection(&CardioSessions, store, remote, user_id, since).await?,
            sync_collection(&Phases, store, remote, user_id, since).await?,
            sync_collection(&Routines, store, remote, user_id, since).await?,
        ])
    }

    fn advance_watermark(&self, started: &Timestamp) -> Result<(), SyncError> {
        let persisted = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_last_sync(started);
        if let Err(e) = persisted {
            let err = SyncError::local("sync_state", e);
            self.handle_failure(&err);
            return Err(err);
        }
        *self
            .last_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(*started);
        Ok(())
    }

    fn handle_failure(&self, err: &SyncError) {
        if err.is_connectivity() {
            if self.set_online(false) {
                warn!(error = %err, "sync pass failed, remote unreachable");
            }
        } else {
            warn!(error = %err, "sync pass failed, will retry");
            self.signals.send(Signal::RetryLater);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DailyLog, DailyLogRecord, MealType, NewMeal, NewStrengthSet, ProfileSettings,
        ProfileUpdate, StrengthSet, UserProfile,
    };
    use crate::monitor::signal_channel;
    use crate::testing::{Harness, date, strength_set, ts};
    use crate::tracker::DirtyMarker;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_no_user_is_a_silent_noop() {
        let (harness, _rx) = Harness::new();
        let outcome = harness.engine.force_sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::NoUser));
        assert_eq!(harness.remote.passes(), 0);
    }

    #[tokio::test]
    async fn test_second_pass_while_running_is_skipped() {
        let (harness, _rx) = Harness::signed_in("u1");
        let _guard = PassGuard::acquire(&harness.engine.in_progress).unwrap();
        assert!(harness.engine.status().sync_in_progress);

        let outcome = harness.engine.force_sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_pass_guard_released_after_failure() {
        let (harness, _rx) = Harness::signed_in("u1");
        harness.remote.fail_on(Some("profile"));
        assert!(harness.engine.force_sync().await.is_err());
        assert!(!harness.engine.status().sync_in_progress);
    }

    #[tokio::test]
    async fn test_second_identical_pass_changes_nothing() {
        let (harness, _rx) = Harness::signed_in("u1");
        let service = harness.service("u1");
        service
            .log_metrics(
                date("2026-01-05"),
                &crate::models::DailyMetrics {
                    weight_kg: Some(80.0),
                    ..Default::default()
                },
            )
            .unwrap();
        harness
            .remote_client()
            .table::<StrengthSet>()
            .upsert_batch(&[strength_set("s1", "u1", "2026-01-04", "2026-01-04T18:00:00Z")])
            .await
            .unwrap();

        harness.engine.force_sync().await.unwrap();
        let local_before = harness.local_snapshot("u1");
        let remote_before = harness.remote_snapshot().await;
        let watermark_before = harness.engine.status().last_sync;

        let SyncOutcome::Completed(report) = harness.engine.force_sync().await.unwrap() else {
            panic!("second pass did not run");
        };
        assert_eq!(harness.local_snapshot("u1"), local_before);
        assert_eq!(harness.remote_snapshot().await, remote_before);
        // the clock has not moved, so the watermark is rewritten to the same instant
        assert_eq!(harness.engine.status().last_sync, watermark_before);
        assert_eq!(report.since, watermark_before.unwrap());
    }

    #[tokio::test]
    async fn test_remote_newer_daily_log_wins() {
        let (harness, _rx) = Harness::signed_in("u1");
        {
            let store = harness.engine.store().lock().unwrap();
            let mut local = DailyLog::empty("u1", date("2026-01-05"), ts("2026-01-05T08:00:00Z"));
            local.metrics.weight_kg = Some(80.0);
            store.put_daily_log(&local).unwrap();
        }
        let mut remote = DailyLog::empty("u1", date("2026-01-05"), ts("2026-01-05T09:00:00Z"));
        remote.metrics.weight_kg = Some(81.0);
        harness
            .remote_client()
            .table::<crate::models::DailyLogRecord>()
            .upsert_batch(&[remote.record()])
            .await
            .unwrap();

        harness.engine.force_sync().await.unwrap();

        let merged = harness
            .engine
            .store()
            .lock()
            .unwrap()
            .get_daily_log("u1", date("2026-01-05"))
            .unwrap()
            .unwrap();
        assert_eq!(merged.metrics.weight_kg, Some(81.0));
        assert_eq!(merged.updated_at, ts("2026-01-05T09:00:00Z"));
    }

    #[tokio::test]
    async fn test_local_newer_record_is_pushed() {
        let (harness, _rx) = Harness::signed_in("u1");
        harness
            .remote_client()
            .table::<StrengthSet>()
            .upsert_batch(&[strength_set("s1", "u1", "2026-01-05", "2026-01-05T08:00:00Z")])
            .await
            .unwrap();
        let mut local = strength_set("s1", "u1", "2026-01-05", "2026-01-05T09:00:00Z");
        local.actual_reps = vec![12, 12, 10];
        harness
            .engine
            .store()
            .lock()
            .unwrap()
            .put_strength_set(&local)
            .unwrap();

        harness.engine.force_sync().await.unwrap();

        let remote = harness
            .remote_client()
            .table::<StrengthSet>()
            .get("u1", "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remote, local);
    }

    #[tokio::test]
    async fn test_failure_leaves_watermark_untouched() {
        let (harness, _rx) = Harness::signed_in("u1");
        harness.engine.force_sync().await.unwrap();
        let before = harness.engine.status().last_sync;
        assert!(before.is_some());

        harness.clock.advance(ChronoDuration::minutes(5));
        harness.engine.mark_pending_changes();
        harness.remote.fail_on(Some("cardio_logs"));

        let err = harness.engine.force_sync().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Remote {
                collection: "cardio_logs",
                ..
            }
        ));
        assert!(!err.is_connectivity());
        assert_eq!(harness.engine.status().last_sync, before);
        assert_eq!(
            harness.engine.store().lock().unwrap().last_sync().unwrap(),
            before
        );
        assert_eq!(harness.engine.status().pending_changes, 1);
        // earlier collections were still pushed before the failure
        assert_eq!(harness.remote.calls_on("cardio_logs"), 1);
    }

    #[tokio::test]
    async fn test_meal_on_unsynced_day_keeps_remote_metrics() {
        let (harness, _rx) = Harness::signed_in("u1");
        harness.engine.force_sync().await.unwrap();

        let mut other_device =
            DailyLog::empty("u1", date("2026-01-05"), ts("2026-01-05T12:30:00Z"));
        other_device.metrics.weight_kg = Some(80.0);
        harness
            .remote_client()
            .table::<DailyLogRecord>()
            .upsert_batch(&[other_device.record()])
            .await
            .unwrap();

        harness.clock.set(ts("2026-01-05T13:00:00Z"));
        let meal = harness
            .service("u1")
            .add_meal(
                date("2026-01-05"),
                &NewMeal {
                    meal_type: MealType::Lunch,
                    protein_g: 40.0,
                    carbs_g: 60.0,
                    fat_g: 15.0,
                    note: None,
                },
            )
            .unwrap();
        harness.engine.force_sync().await.unwrap();

        let remote = harness
            .remote_client()
            .table::<DailyLogRecord>()
            .get_all("u1")
            .await
            .unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].metrics.weight_kg, Some(80.0));

        let local = harness
            .engine
            .store()
            .lock()
            .unwrap()
            .get_daily_log("u1", date("2026-01-05"))
            .unwrap()
            .unwrap();
        assert_eq!(local.metrics.weight_kg, Some(80.0));
        assert_eq!(local.meals, vec![meal]);
        assert_eq!(harness.remote_meal_count("u1").await, 1);
    }

    #[tokio::test]
    async fn test_profile_edited_before_first_sync_yields_to_remote() {
        let (harness, _rx) = Harness::signed_in("u1");
        let existing = UserProfile {
            id: "u1".to_string(),
            email: "ana@example.com".to_string(),
            name: "Ana".to_string(),
            settings: ProfileSettings::default(),
            updated_at: ts("2026-01-04T09:00:00Z"),
        };
        harness
            .remote_client()
            .table::<UserProfile>()
            .upsert_batch(std::slice::from_ref(&existing))
            .await
            .unwrap();

        harness
            .service("u1")
            .update_profile(&ProfileUpdate {
                target_weight_kg: Some(75.0),
                ..ProfileUpdate::default()
            })
            .unwrap();
        harness.engine.force_sync().await.unwrap();

        let remote = harness
            .remote_client()
            .table::<UserProfile>()
            .get_all("u1")
            .await
            .unwrap();
        assert_eq!(remote, vec![existing.clone()]);
        let local = harness.service("u1").profile().unwrap();
        assert_eq!(local, Some(existing));
    }

    #[tokio::test]
    async fn test_local_store_failure_schedules_retry() {
        let (harness, mut rx) = Harness::signed_in("u1");
        harness.engine.force_sync().await.unwrap();
        let before = harness.engine.status().last_sync;
        while rx.try_recv().is_ok() {}

        harness.clock.advance(ChronoDuration::minutes(5));
        let set = harness
            .service("u1")
            .log_strength_set(&NewStrengthSet {
                date: date("2026-01-05"),
                muscle_group: "legs".to_string(),
                exercise: "Squat".to_string(),
                planned_sets: 3,
                planned_reps: 8,
                actual_reps: Vec::new(),
                rir: None,
                tempo: None,
                avg_hr: None,
                estimated_calories: None,
                notes: None,
            })
            .unwrap();
        harness
            .engine
            .store()
            .lock()
            .unwrap()
            .in_transaction(|conn| {
                conn.execute(
                    "UPDATE strength_sets SET updated_at = 'not a timestamp' WHERE id = ?1",
                    [&set.id],
                )?;
                Ok(())
            })
            .unwrap();

        let err = harness.engine.force_sync().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Local {
                collection: "strength_logs",
                ..
            }
        ));
        assert!(!err.is_connectivity());

        let status = harness.engine.status();
        assert_eq!(status.last_sync, before);
        assert_eq!(
            harness.engine.store().lock().unwrap().last_sync().unwrap(),
            before
        );
        assert_eq!(status.pending_changes, 1);
        assert!(status.is_online);
        assert!(!status.sync_in_progress);

        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        assert!(signals.contains(&Signal::RetryLater));
    }

    #[tokio::test]
    async fn test_rejection_schedules_retry() {
        let (harness, mut rx) = Harness::signed_in("u1");
        harness.remote.fail_on(Some("daily_logs"));
        assert!(harness.engine.force_sync().await.is_err());

        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        assert!(signals.contains(&Signal::RetryLater));
        assert!(harness.engine.is_online());
    }

    #[tokio::test]
    async fn test_force_sync_without_network() {
        let (harness, mut rx) = Harness::signed_in("u1");
        let service = harness.service("u1");
        service
            .add_meal(
                date("2026-01-05"),
                &NewMeal {
                    meal_type: MealType::Breakfast,
                    protein_g: 20.0,
                    carbs_g: 30.0,
                    fat_g: 5.0,
                    note: None,
                },
            )
            .unwrap();
        assert_eq!(harness.engine.status().pending_changes, 1);
        harness.remote.set_reachable(false);

        let err = harness.engine.force_sync().await.unwrap_err();
        assert!(err.is_connectivity());
        let status = harness.engine.status();
        assert!(!status.is_online);
        assert_eq!(status.pending_changes, 1);
        assert!(status.last_sync.is_none());
        assert_eq!(status.label(), "Offline");

        // no timed retry while offline
        while let Ok(signal) = rx.try_recv() {
            assert_ne!(signal, Signal::RetryLater);
        }

        // once offline, the pass does not even reach the remote
        let calls = harness.remote.total_calls();
        assert!(matches!(
            harness.engine.force_sync().await.unwrap_err(),
            SyncError::Offline
        ));
        assert_eq!(harness.remote.total_calls(), calls);
    }

    #[tokio::test]
    async fn test_changes_during_pass_stay_pending() {
        let (harness, _rx) = Harness::signed_in("u1");
        harness.engine.mark_pending_changes();
        harness.engine.mark_pending_changes();

        let tracker = harness.engine.tracker().clone();
        harness.remote.on_first_call(move || tracker.mark());
        harness.engine.force_sync().await.unwrap();

        assert_eq!(harness.engine.status().pending_changes, 1);
        assert!(harness.marker.read().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_collections_run_in_fixed_order() {
        let (harness, _rx) = Harness::signed_in("u1");
        let SyncOutcome::Completed(report) = harness.engine.force_sync().await.unwrap() else {
            panic!("pass skipped");
        };
        let names: Vec<&str> = report.collections.iter().map(|c| c.collection).collect();
        assert_eq!(
            names,
            vec![
                "profile",
                "daily_logs",
                "meal_logs",
                "strength_logs",
                "cardio_logs",
                "protocol_phases",
                "protocol_routines",
            ]
        );
        assert_eq!(harness.remote.selected_tables(), names);
    }

    #[tokio::test]
    async fn test_sign_in_persists_user() {
        let (harness, _rx) = Harness::new();
        harness.engine.sign_in("u1").unwrap();
        assert_eq!(
            harness
                .engine
                .store()
                .lock()
                .unwrap()
                .session_user()
                .unwrap()
                .as_deref(),
            Some("u1")
        );

        let (tx, _rx2) = signal_channel();
        let reopened = SyncEngine::new(
            Arc::clone(harness.engine.store()),
            harness.remote_client(),
            ChangeTracker::in_memory(tx.clone()),
            Arc::clone(harness.engine.clock()),
            tx,
        )
        .unwrap();
        assert_eq!(reopened.user_id().as_deref(), Some("u1"));

        harness.engine.sign_out().unwrap();
        assert!(harness.engine.user_id().is_none());
    }
}
