//! One synchronization step, written once and instantiated per collection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::db::LocalStore;
use crate::engine::SyncError;
use crate::models::{
    CardioSession, DailyLog, DailyLogRecord, MealLog, ProtocolPhase, ProtocolRoutine,
    StrengthSet, Timestamp, UserProfile, epoch,
};
use crate::remote::{RemoteClient, RemoteRecord};

/// Which side each record of a pair of deltas ends up on.
#[derive(Debug)]
pub struct Resolution<T> {
    pub push: Vec<T>,
    pub pull: Vec<T>,
}

/// Last-write-wins per natural key. The local copy wins only when strictly
/// newer; equal timestamps go to the remote copy.
pub fn resolve<T: RemoteRecord>(local: Vec<T>, remote: Vec<T>) -> Resolution<T> {
    let remote_stamps: HashMap<String, Timestamp> =
        remote.iter().map(|r| (r.key(), r.updated_at())).collect();
    let local_stamps: HashMap<String, Timestamp> =
        local.iter().map(|l| (l.key(), l.updated_at())).collect();

    let push = local
        .into_iter()
        .filter(|l| {
            remote_stamps
                .get(&l.key())
                .is_none_or(|r| l.updated_at() > *r)
        })
        .collect();
    let pull = remote
        .into_iter()
        .filter(|r| {
            local_stamps
                .get(&r.key())
                .is_none_or(|l| r.updated_at() >= *l)
        })
        .collect();
    Resolution { push, pull }
}

/// How one entity collection is read from and merged into the local store.
pub trait SyncCollection: Send + Sync {
    type Record: RemoteRecord;

    const NAME: &'static str;

    fn local_delta(
        &self,
        store: &LocalStore,
        user_id: &str,
        since: &Timestamp,
    ) -> Result<Vec<Self::Record>>;

    fn merge_into_local(&self, store: &LocalStore, records: &[Self::Record]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub collection: &'static str,
    pub pushed: usize,
    pub pulled: usize,
}

/// Remote delta, local delta, resolve, push winners, merge pulled records.
pub async fn sync_collection<C: SyncCollection>(
    collection: &C,
    store: &Mutex<LocalStore>,
    remote: &RemoteClient,
    user_id: &str,
    since: &Timestamp,
) -> Result<CollectionReport, SyncError> {
    let table = remote.table::<C::Record>();

    let remote_delta = table
        .get_since(user_id, since)
        .await
        .map_err(|e| SyncError::remote(C::NAME, e))?;

    let local_delta = {
        let store = store.lock().unwrap_or_else(PoisonError::into_inner);
        collection.local_delta(&store, user_id, since)
    }
    .map_err(|e| SyncError::local(C::NAME, e))?;

    let Resolution { push, pull } = resolve(local_delta, remote_delta);

    table
        .upsert_batch(&push)
        .await
        .map_err(|e| SyncError::remote(C::NAME, e))?;

    if !pull.is_empty() {
        let store = store.lock().unwrap_or_else(PoisonError::into_inner);
        collection
            .merge_into_local(&store, &pull)
            .map_err(|e| SyncError::local(C::NAME, e))?;
    }

    debug!(
        collection = C::NAME,
        pushed = push.len(),
        pulled = pull.len(),
        "collection synced"
    );
    Ok(CollectionReport {
        collection: C::NAME,
        pushed: push.len(),
        pulled: pull.len(),
    })
}

pub struct Profiles;

impl SyncCollection for Profiles {
    type Record = UserProfile;
    const NAME: &'static str = "profile";

    fn local_delta(&self, store: &LocalStore, user_id: &str, since: &Timestamp) -> Result<Vec<UserProfile>> {
        store.profiles_since(user_id, since)
    }

    fn merge_into_local(&self, store: &LocalStore, records: &[UserProfile]) -> Result<()> {
        store.bulk_put_profiles(records)
    }
}

/// Daily log scalars. Incoming records overwrite the day's metrics and keep
/// its meals.
pub struct DailyLogs;

impl SyncCollection for DailyLogs {
    type Record = DailyLogRecord;
    const NAME: &'static str = "daily_logs";

    fn local_delta(&self, store: &LocalStore, user_id: &str, since: &Timestamp) -> Result<Vec<DailyLogRecord>> {
        Ok(store
            .daily_logs_since(user_id, since)?
            .iter()
            .map(DailyLog::record)
            .collect())
    }

    fn merge_into_local(&self, store: &LocalStore, records: &[DailyLogRecord]) -> Result<()> {
        store.in_transaction(|conn| {
            for record in records {
                let log = match LocalStore::read_daily_log(conn, &record.user_id, record.date)? {
                    Some(mut log) => {
                        log.metrics.clone_from(&record.metrics);
                        log.updated_at = record.updated_at;
                        log
                    }
                    None => DailyLog {
                        user_id: record.user_id.clone(),
                        date: record.date,
                        metrics: record.metrics.clone(),
                        meals: Vec::new(),
                        updated_at: record.updated_at,
                    },
                };
                LocalStore::write_daily_log(conn, &log)?;
            }
            Ok(())
        })
    }
}

/// Meal entries, merged by id into their day's meal list. Meals for a day
/// with no local log land in a placeholder log stamped at the epoch so it
/// never outranks a real remote log.
pub struct Meals;

impl SyncCollection for Meals {
    type Record = MealLog;
    const NAME: &'static str = "meal_logs";

    fn local_delta(&self, store: &LocalStore, user_id: &str, since: &Timestamp) -> Result<Vec<MealLog>> {
        store.meals_since(user_id, since)
    }

    fn merge_into_local(&self, store: &LocalStore, records: &[MealLog]) -> Result<()> {
        let mut by_day: BTreeMap<(&str, NaiveDate), Vec<&MealLog>> = BTreeMap::new();
        for record in records {
            by_day
                .entry((record.user_id.as_str(), record.date))
                .or_default()
                .push(record);
        }

        store.in_transaction(|conn| {
            for ((user_id, date), meals) in by_day {
                let mut log = LocalStore::read_daily_log(conn, user_id, date)?
                    .unwrap_or_else(|| DailyLog::empty(user_id, date, epoch()));
                for record in meals {
                    log.upsert_meal(record.meal.clone());
                }
                LocalStore::write_daily_log(conn, &log)?;
            }
            Ok(())
        })
    }
}

pub struct StrengthSets;

impl SyncCollection for StrengthSets {
    type Record = StrengthSet;
    const NAME: &'static str = "strength_logs";

    fn local_delta(&self, store: &LocalStore, user_id: &str, since: &Timestamp) -> Result<Vec<StrengthSet>> {
        store.strength_sets_since(user_id, since)
    }

    fn merge_into_local(&self, store: &LocalStore, records: &[StrengthSet]) -> Result<()> {
        store.bulk_put_strength_sets(records)
    }
}

pub struct CardioSessions;

impl SyncCollection for CardioSessions {
    type Record = CardioSession;
    const NAME: &'static str = "cardio_logs";

    fn local_delta(&self, store: &LocalStore, user_id: &str, since: &Timestamp) -> Result<Vec<CardioSession>> {
        store.cardio_sessions_since(user_id, since)
    }

    fn merge_into_local(&self, store: &LocalStore, records: &[CardioSession]) -> Result<()> {
        store.bulk_put_cardio_sessions(records)
    }
}

pub struct Phases;

impl SyncCollection for Phases {
    type Record = ProtocolPhase;
    const NAME: &'static str = "protocol_phases";

    fn local_delta(&self, store: &LocalStore, user_id: &str, since: &Timestamp) -> Result<Vec<ProtocolPhase>> {
        store.phases_since(user_id, since)
    }

    fn merge_into_local(&self, store: &LocalStore, records: &[ProtocolPhase]) -> Result<()> {
        store.bulk_put_phases(records)
    }
}

pub struct Routines;

impl SyncCollection for Routines {
    type Record = ProtocolRoutine;
    const NAME: &'static str = "protocol_routines";

    fn local_delta(&self, store: &LocalStore, user_id: &str, since: &Timestamp) -> Result<Vec<ProtocolRoutine>> {
        store.routines_since(user_id, since)
    }

    fn merge_into_local(&self, store: &LocalStore, records: &[ProtocolRoutine]) -> Result<()> {
        store.bulk_put_routines(records)
    }
}
