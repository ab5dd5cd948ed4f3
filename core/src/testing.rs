//! Fixtures and an instrumented remote shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::clock::FixedClock;
use crate::db::LocalStore;
use crate::engine::SyncEngine;
use crate::models::{
    CardioSession, DailyLog, MealEntry, MealLog, MealType, ProtocolPhase, ProtocolRoutine,
    StrengthSet, Timestamp, UserProfile, epoch, meal_calories, parse_date, parse_timestamp,
};
use crate::monitor::{SignalReceiver, signal_channel};
use crate::remote::{RemoteClient, RemoteError, RemoteStore, RemoteTable, RowQuery};
use crate::service::FitstatService;
use crate::tables::{EmbeddedRemote, TableStore};
use crate::tracker::{ChangeTracker, MemoryMarker};

pub(crate) fn ts(value: &str) -> Timestamp {
    parse_timestamp(value).unwrap()
}

pub(crate) fn date(value: &str) -> NaiveDate {
    parse_date(value).unwrap()
}

pub(crate) fn meal(id: &str, meal_type: MealType, updated_at: &str) -> MealEntry {
    MealEntry {
        id: id.to_string(),
        meal_type,
        protein_g: 20.0,
        carbs_g: 30.0,
        fat_g: 10.0,
        calories: meal_calories(20.0, 30.0, 10.0),
        note: None,
        updated_at: ts(updated_at),
    }
}

pub(crate) fn strength_set(id: &str, user_id: &str, day: &str, updated_at: &str) -> StrengthSet {
    StrengthSet {
        id: id.to_string(),
        user_id: user_id.to_string(),
        date: date(day),
        muscle_group: "legs".to_string(),
        exercise: "Squat".to_string(),
        planned_sets: 3,
        planned_reps: 10,
        actual_reps: vec![10, 10, 9],
        rir: Some(2),
        tempo: None,
        avg_hr: None,
        estimated_calories: Some(40.0),
        notes: None,
        updated_at: ts(updated_at),
    }
}

pub(crate) fn cardio_session(id: &str, user_id: &str, day: &str, updated_at: &str) -> CardioSession {
    CardioSession {
        id: id.to_string(),
        user_id: user_id.to_string(),
        date: date(day),
        activity_type: "run".to_string(),
        duration_minutes: 30.0,
        distance_km: Some(5.5),
        calories_burned: Some(320.0),
        avg_hr: Some(148),
        max_hr: Some(171),
        notes: None,
        updated_at: ts(updated_at),
    }
}

pub(crate) fn phase(id: &str, user_id: &str, start: &str, updated_at: &str) -> ProtocolPhase {
    ProtocolPhase {
        id: id.to_string(),
        user_id: user_id.to_string(),
        name: format!("Phase {id}"),
        description: None,
        start_date: date(start),
        end_date: None,
        is_active: true,
        updated_at: ts(updated_at),
    }
}

pub(crate) fn routine(
    id: &str,
    user_id: &str,
    phase_id: &str,
    day_of_week: u8,
    updated_at: &str,
) -> ProtocolRoutine {
    ProtocolRoutine {
        id: id.to_string(),
        user_id: user_id.to_string(),
        phase_id: phase_id.to_string(),
        day_of_week,
        exercise: "Bench press".to_string(),
        sets: 4,
        reps: 6,
        intensity: 0.75,
        rest_minutes: 2.5,
        notes: None,
        updated_at: ts(updated_at),
    }
}

/// A client over a fresh in-memory table store whose clock reads `now`.
pub(crate) fn embedded_remote(now: &str) -> (RemoteClient, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(ts(now)));
    let tables = Arc::new(Mutex::new(TableStore::open_in_memory().unwrap()));
    let remote = EmbeddedRemote::new(tables, clock.clone());
    (RemoteClient::new(Arc::new(remote)), clock)
}

type Hook = Box<dyn FnOnce() + Send>;

/// Wraps an [`EmbeddedRemote`] and records every call that reaches it.
pub(crate) struct CountingRemote {
    inner: EmbeddedRemote,
    reachable: AtomicBool,
    failing: Mutex<Option<String>>,
    calls: Mutex<Vec<(RemoteTable, &'static str)>>,
    hook: Mutex<Option<Hook>>,
}

impl CountingRemote {
    fn new(inner: EmbeddedRemote) -> Self {
        Self {
            inner,
            reachable: AtomicBool::new(true),
            failing: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        }
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Reject every call on `table` with a server error.
    pub(crate) fn fail_on(&self, table: Option<&str>) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = table.map(str::to_string);
    }

    /// Run `f` during the next call, before it is served.
    pub(crate) fn on_first_call(&self, f: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(f));
    }

    fn calls(&self) -> Vec<(RemoteTable, &'static str)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn tables_for(&self, op: &str) -> Vec<&'static str> {
        self.calls()
            .into_iter()
            .filter(|(_, o)| *o == op)
            .map(|(t, _)| t.name())
            .collect()
    }

    /// Every pass starts by selecting profiles.
    pub(crate) fn passes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|(t, o)| *t == RemoteTable::Profile && *o == "select")
            .count()
    }

    pub(crate) fn pushed_tables(&self) -> Vec<&'static str> {
        self.tables_for("upsert")
    }

    pub(crate) fn selected_tables(&self) -> Vec<&'static str> {
        self.tables_for("select")
    }

    pub(crate) fn calls_on(&self, table: &str) -> usize {
        self.calls().iter().filter(|(t, _)| t.name() == table).count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls().len()
    }

    fn enter(&self, table: RemoteTable, op: &'static str) -> Result<(), RemoteError> {
        let hook = self.hook.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(hook) = hook {
            hook();
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("connection refused".to_string()));
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((table, op));
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.as_deref() == Some(table.name()) {
            return Err(RemoteError::Rejected {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for CountingRemote {
    async fn ping(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("connection refused".to_string()))
        }
    }

    async fn select(&self, table: RemoteTable, query: &RowQuery) -> Result<Vec<Value>, RemoteError> {
        self.enter(table, "select")?;
        self.inner.select(table, query).await
    }

    async fn insert(&self, table: RemoteTable, row: Value) -> Result<Value, RemoteError> {
        self.enter(table, "insert")?;
        self.inner.insert(table, row).await
    }

    async fn upsert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError> {
        self.enter(table, "upsert")?;
        self.inner.upsert(table, rows).await
    }

    async fn update(
        &self,
        table: RemoteTable,
        query: &RowQuery,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        self.enter(table, "update")?;
        self.inner.update(table, query, patch).await
    }

    async fn delete(&self, table: RemoteTable, query: &RowQuery) -> Result<Vec<Value>, RemoteError> {
        self.enter(table, "delete")?;
        self.inner.delete(table, query).await
    }
}

/// Everything one user has in the local store.
#[derive(Debug, PartialEq)]
pub(crate) struct LocalSnapshot {
    profiles: Vec<UserProfile>,
    daily_logs: Vec<DailyLog>,
    meals: Vec<MealLog>,
    strength: Vec<StrengthSet>,
    cardio: Vec<CardioSession>,
    phases: Vec<ProtocolPhase>,
    routines: Vec<ProtocolRoutine>,
}

/// An engine wired to in-memory stores, a fixed clock and a counting remote.
pub(crate) struct Harness {
    pub(crate) engine: Arc<SyncEngine>,
    pub(crate) remote: Arc<CountingRemote>,
    pub(crate) clock: Arc<FixedClock>,
    pub(crate) marker: Arc<MemoryMarker>,
}

impl Harness {
    pub(crate) fn new() -> (Self, SignalReceiver) {
        let clock = Arc::new(FixedClock::new(ts("2026-01-05T12:00:00Z")));
        let (tx, rx) = signal_channel();
        let marker = Arc::new(MemoryMarker::default());
        let tracker = ChangeTracker::new(Box::new(Arc::clone(&marker)), tx.clone());
        let tables = Arc::new(Mutex::new(TableStore::open_in_memory().unwrap()));
        let remote = Arc::new(CountingRemote::new(EmbeddedRemote::new(
            tables,
            clock.clone(),
        )));
        let engine = SyncEngine::new(
            Arc::new(Mutex::new(LocalStore::open_in_memory().unwrap())),
            RemoteClient::new(remote.clone()),
            tracker,
            clock.clone(),
            tx,
        )
        .unwrap();
        let harness = Harness {
            engine: Arc::new(engine),
            remote,
            clock,
            marker,
        };
        (harness, rx)
    }

    pub(crate) fn signed_in(user_id: &str) -> (Self, SignalReceiver) {
        let (harness, rx) = Self::new();
        harness.engine.sign_in(user_id).unwrap();
        (harness, rx)
    }

    pub(crate) fn service(&self, user_id: &str) -> FitstatService {
        FitstatService::for_engine(&self.engine, user_id)
    }

    pub(crate) fn remote_client(&self) -> RemoteClient {
        self.engine.remote().clone()
    }

    pub(crate) fn local_snapshot(&self, user_id: &str) -> LocalSnapshot {
        let since = epoch();
        let store = self.engine.store().lock().unwrap();
        LocalSnapshot {
            profiles: store.profiles_since(user_id, &since).unwrap(),
            daily_logs: store.daily_logs_since(user_id, &since).unwrap(),
            meals: store.meals_since(user_id, &since).unwrap(),
            strength: store.strength_sets_since(user_id, &since).unwrap(),
            cardio: store.cardio_sessions_since(user_id, &since).unwrap(),
            phases: store.phases_since(user_id, &since).unwrap(),
            routines: store.routines_since(user_id, &since).unwrap(),
        }
    }

    /// Every remote row, read around the call counters.
    pub(crate) async fn remote_snapshot(&self) -> Vec<(RemoteTable, Vec<Value>)> {
        let mut snapshot = Vec::new();
        for table in RemoteTable::ALL {
            let rows = self.remote.inner.select(table, &RowQuery::new()).await.unwrap();
            snapshot.push((table, rows));
        }
        snapshot
    }

    pub(crate) async fn remote_meal_count(&self, user_id: &str) -> usize {
        self.remote_client()
            .table::<MealLog>()
            .get_all(user_id)
            .await
            .unwrap()
            .len()
    }
}
