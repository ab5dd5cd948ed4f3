use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use chrono::NaiveDate;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::LocalStore;
use crate::engine::SyncEngine;
use crate::models::{
    CardioSession, DailyLog, DailyMetrics, MealEntry, NewCardioSession, NewMeal,
    NewProtocolPhase, NewProtocolRoutine, NewStrengthSet, ProfileSettings, ProfileUpdate,
    ProtocolPhase, ProtocolRoutine, StrengthSet, UpdateMeal, UserProfile, epoch, meal_calories,
    validate_day_of_week, validate_macros,
};
use crate::tracker::ChangeTracker;

/// User-facing reads and writes for one signed-in user. Every write lands in
/// the local store with a fresh `updated_at` and is reported to the change
/// tracker; nothing here touches the network.
pub struct FitstatService {
    store: Arc<Mutex<LocalStore>>,
    tracker: ChangeTracker,
    clock: Arc<dyn Clock>,
    user_id: String,
}

impl FitstatService {
    pub fn new(
        store: Arc<Mutex<LocalStore>>,
        tracker: ChangeTracker,
        clock: Arc<dyn Clock>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tracker,
            clock,
            user_id: user_id.into(),
        }
    }

    pub fn for_engine(engine: &SyncEngine, user_id: impl Into<String>) -> Self {
        Self::new(
            Arc::clone(engine.store()),
            engine.tracker().clone(),
            Arc::clone(engine.clock()),
            user_id,
        )
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn store(&self) -> MutexGuard<'_, LocalStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    // --- Daily logs ---

    /// Overlay the given metrics onto the day's log, creating it if needed.
    pub fn log_metrics(&self, date: NaiveDate, metrics: &DailyMetrics) -> Result<DailyLog> {
        let now = self.clock.now();
        let log = self.store().update_daily_log(&self.user_id, date, |existing| {
            let mut log =
                existing.unwrap_or_else(|| DailyLog::empty(&self.user_id, date, now));
            log.metrics.apply(metrics);
            log.updated_at = now;
            Ok(log)
        })?;
        self.tracker.mark();
        Ok(log)
    }

    pub fn day(&self, date: NaiveDate) -> Result<Option<DailyLog>> {
        self.store().get_daily_log(&self.user_id, date)
    }

    pub fn days(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyLog>> {
        self.store().daily_logs_between(&self.user_id, from, to)
    }

    // --- Meals ---

    pub fn add_meal(&self, date: NaiveDate, meal: &NewMeal) -> Result<MealEntry> {
        validate_macros(meal.protein_g, meal.carbs_g, meal.fat_g)?;
        let now = self.clock.now();
        let entry = MealEntry {
            id: Self::new_id(),
            meal_type: meal.meal_type,
            protein_g: meal.protein_g,
            carbs_g: meal.carbs_g,
            fat_g: meal.fat_g,
            calories: meal_calories(meal.protein_g, meal.carbs_g, meal.fat_g),
            note: meal.note.clone(),
            updated_at: now,
        };
        // The day's metrics are untouched, so a log created here is stamped at
        // the epoch and never outranks a remote log for the same date.
        self.store().update_daily_log(&self.user_id, date, |existing| {
            let mut log =
                existing.unwrap_or_else(|| DailyLog::empty(&self.user_id, date, epoch()));
            log.upsert_meal(entry.clone());
            Ok(log)
        })?;
        self.tracker.mark();
        Ok(entry)
    }

    pub fn update_meal(&self, date: NaiveDate, id: &str, update: &UpdateMeal) -> Result<MealEntry> {
        let now = self.clock.now();
        let mut updated = None;
        self.store().update_daily_log(&self.user_id, date, |existing| {
            let Some(mut log) = existing else {
                bail!("No daily log for {date}");
            };
            let Some(meal) = log.meals.iter_mut().find(|m| m.id == id) else {
                bail!("Meal {id} not found on {date}");
            };
            if let Some(meal_type) = update.meal_type {
                meal.meal_type = meal_type;
            }
            if let Some(p) = update.protein_g {
                meal.protein_g = p;
            }
            if let Some(c) = update.carbs_g {
                meal.carbs_g = c;
            }
            if let Some(f) = update.fat_g {
                meal.fat_g = f;
            }
            if update.note.is_some() {
                meal.note.clone_from(&update.note);
            }
            validate_macros(meal.protein_g, meal.carbs_g, meal.fat_g)?;
            meal.calories = meal_calories(meal.protein_g, meal.carbs_g, meal.fat_g);
            meal.updated_at = now;
            updated = Some(meal.clone());
            Ok(log)
        })?;
        self.tracker.mark();
        updated.ok_or_else(|| anyhow::anyhow!("Meal {id} not found on {date}"))
    }

    pub fn meals(&self, date: NaiveDate) -> Result<Vec<MealEntry>> {
        self.store().meals_for_date(&self.user_id, date)
    }

    // --- Strength ---

    pub fn log_strength_set(&self, set: &NewStrengthSet) -> Result<StrengthSet> {
        if set.exercise.trim().is_empty() {
            bail!("Exercise name cannot be empty");
        }
        let record = StrengthSet {
            id: Self::new_id(),
            user_id: self.user_id.clone(),
            date: set.date,
            muscle_group: set.muscle_group.clone(),
            exercise: set.exercise.clone(),
            planned_sets: set.planned_sets,
            planned_reps: set.planned_reps,
            actual_reps: set.actual_reps.clone(),
            rir: set.rir,
            tempo: set.tempo.clone(),
            avg_hr: set.avg_hr,
            estimated_calories: set.estimated_calories,
            notes: set.notes.clone(),
            updated_at: self.clock.now(),
        };
        self.store().put_strength_set(&record)?;
        self.tracker.mark();
        Ok(record)
    }

    /// Record what was actually performed for a planned set.
    pub fn record_reps(&self, id: &str, actual_reps: Vec<u32>, rir: Option<u32>) -> Result<StrengthSet> {
        let store = self.store();
        let Some(mut set) = store.get_strength_set(id)? else {
            bail!("Strength set {id} not found");
        };
        if set.user_id != self.user_id {
            bail!("Strength set {id} not found");
        }
        set.actual_reps = actual_reps;
        if rir.is_some() {
            set.rir = rir;
        }
        set.updated_at = self.clock.now();
        store.put_strength_set(&set)?;
        drop(store);
        self.tracker.mark();
        Ok(set)
    }

    pub fn strength_for(&self, date: NaiveDate) -> Result<Vec<StrengthSet>> {
        self.store().strength_sets_for_date(&self.user_id, date)
    }

    // --- Cardio ---

    pub fn log_cardio(&self, session: &NewCardioSession) -> Result<CardioSession> {
        if session.duration_minutes <= 0.0 {
            bail!("Duration must be positive");
        }
        let record = CardioSession {
            id: Self::new_id(),
            user_id: self.user_id.clone(),
            date: session.date,
            activity_type: session.activity_type.clone(),
            duration_minutes: session.duration_minutes,
            distance_km: session.distance_km,
            calories_burned: session.calories_burned,
            avg_hr: session.avg_hr,
            max_hr: session.max_hr,
            notes: session.notes.clone(),
            updated_at: self.clock.now(),
        };
        self.store().put_cardio_session(&record)?;
        self.tracker.mark();
        Ok(record)
    }

    pub fn cardio_for(&self, date: NaiveDate) -> Result<Vec<CardioSession>> {
        self.store().cardio_sessions_for_date(&self.user_id, date)
    }

    // --- Protocol ---

    /// Create a phase. Activating it deactivates whichever phase was active.
    pub fn save_phase(&self, phase: &NewProtocolPhase) -> Result<ProtocolPhase> {
        if let Some(end) = phase.end_date
            && end < phase.start_date
        {
            bail!("Phase cannot end before it starts");
        }
        let now = self.clock.now();
        let record = ProtocolPhase {
            id: Self::new_id(),
            user_id: self.user_id.clone(),
            name: phase.name.clone(),
            description: phase.description.clone(),
            start_date: phase.start_date,
            end_date: phase.end_date,
            is_active: phase.is_active,
            updated_at: now,
        };

        let store = self.store();
        let mut changed = vec![record.clone()];
        if record.is_active {
            for mut other in store.list_phases(&self.user_id)? {
                if other.is_active {
                    other.is_active = false;
                    other.updated_at = now;
                    changed.push(other);
                }
            }
        }
        store.bulk_put_phases(&changed)?;
        drop(store);
        self.tracker.mark();
        Ok(record)
    }

    pub fn phases(&self) -> Result<Vec<ProtocolPhase>> {
        self.store().list_phases(&self.user_id)
    }

    pub fn active_phase(&self) -> Result<Option<ProtocolPhase>> {
        self.store().active_phase(&self.user_id)
    }

    pub fn save_routine(&self, routine: &NewProtocolRoutine) -> Result<ProtocolRoutine> {
        validate_day_of_week(routine.day_of_week)?;
        let store = self.store();
        match store.get_phase(&routine.phase_id)? {
            Some(phase) if phase.user_id == self.user_id => {}
            _ => bail!("Phase {} not found", routine.phase_id),
        }
        let record = ProtocolRoutine {
            id: Self::new_id(),
            user_id: self.user_id.clone(),
            phase_id: routine.phase_id.clone(),
            day_of_week: routine.day_of_week,
            exercise: routine.exercise.clone(),
            sets: routine.sets,
            reps: routine.reps,
            intensity: routine.intensity,
            rest_minutes: routine.rest_minutes,
            notes: routine.notes.clone(),
            updated_at: self.clock.now(),
        };
        store.put_routine(&record)?;
        drop(store);
        self.tracker.mark();
        Ok(record)
    }

    pub fn routines_for(&self, phase_id: &str) -> Result<Vec<ProtocolRoutine>> {
        self.store().routines_for_phase(phase_id)
    }

    // --- Profile ---

    pub fn profile(&self) -> Result<Option<UserProfile>> {
        self.store().get_profile(&self.user_id)
    }

    /// Until this device has synced once, a profile created here stays at the
    /// epoch so an existing remote profile replaces it instead of being
    /// overwritten by blank fields.
    pub fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile> {
        let store = self.store();
        let synced = store.last_sync()?.is_some();
        let mut profile = store.get_profile(&self.user_id)?.unwrap_or_else(|| UserProfile {
            id: self.user_id.clone(),
            email: String::new(),
            name: String::new(),
            settings: ProfileSettings::default(),
            updated_at: epoch(),
        });
        if let Some(email) = &update.email {
            profile.email.clone_from(email);
        }
        if let Some(name) = &update.name {
            profile.name.clone_from(name);
        }
        let settings = &mut profile.settings;
        if update.target_weight_kg.is_some() {
            settings.target_weight_kg = update.target_weight_kg;
        }
        if update.target_body_fat.is_some() {
            settings.target_body_fat = update.target_body_fat;
        }
        if update.activity_level.is_some() {
            settings.activity_level = update.activity_level;
        }
        if update.measurement_system.is_some() {
            settings.measurement_system = update.measurement_system;
        }
        if synced || profile.updated_at != epoch() {
            profile.updated_at = self.clock.now();
        }
        store.put_profile(&profile)?;
        drop(store);
        self.tracker.mark();
        Ok(profile)
    }
}
