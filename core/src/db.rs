use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{
    CardioSession, DailyLog, DailyMetrics, MealEntry, MealLog, ProtocolPhase, ProtocolRoutine,
    StrengthSet, Timestamp, UserProfile, format_date, format_timestamp, parse_timestamp,
};

/// Bumped whenever the on-disk shape changes. A store written by a newer
/// build is refused rather than guessed at.
pub const STORE_VERSION: i64 = 1;

const LAST_SYNC_KEY: &str = "last_sync";
const SESSION_USER_KEY: &str = "session_user";

/// The device-side copy of every synced collection.
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open local store: {}", path.display()))?;
        let store = LocalStore { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = LocalStore { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version > STORE_VERSION {
            anyhow::bail!(
                "Local store has schema version {version}, this build understands up to {STORE_VERSION}"
            );
        }

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS user_profiles (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL,
                    name TEXT NOT NULL,
                    settings TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS daily_logs (
                    user_id TEXT NOT NULL,
                    date TEXT NOT NULL,
                    weight_kg REAL,
                    water_ml INTEGER,
                    steps INTEGER,
                    sleep_hours REAL,
                    training_done INTEGER,
                    training_type TEXT,
                    training_calories REAL,
                    training_avg_hr INTEGER,
                    walk_distance_km REAL,
                    walk_duration_min REAL,
                    walk_avg_hr INTEGER,
                    walk_calories REAL,
                    notes TEXT,
                    meals TEXT NOT NULL DEFAULT '[]',
                    meals_updated_at TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, date)
                );

                CREATE TABLE IF NOT EXISTS strength_sets (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    date TEXT NOT NULL,
                    muscle_group TEXT NOT NULL,
                    exercise TEXT NOT NULL,
                    planned_sets INTEGER NOT NULL,
                    planned_reps INTEGER NOT NULL,
                    actual_reps TEXT NOT NULL DEFAULT '[]',
                    rir INTEGER,
                    tempo TEXT,
                    avg_hr INTEGER,
                    estimated_calories REAL,
                    notes TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cardio_sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    date TEXT NOT NULL,
                    activity_type TEXT NOT NULL,
                    duration_minutes REAL NOT NULL,
                    distance_km REAL,
                    calories_burned REAL,
                    avg_hr INTEGER,
                    max_hr INTEGER,
                    notes TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS protocol_phases (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT,
                    start_date TEXT NOT NULL,
                    end_date TEXT,
                    is_active INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS protocol_routines (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    phase_id TEXT NOT NULL,
                    day_of_week INTEGER NOT NULL CHECK (day_of_week BETWEEN 0 AND 6),
                    exercise TEXT NOT NULL,
                    sets INTEGER NOT NULL,
                    reps INTEGER NOT NULL,
                    intensity REAL NOT NULL,
                    rest_minutes REAL NOT NULL,
                    notes TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_daily_logs_updated ON daily_logs(user_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_daily_logs_meals_updated ON daily_logs(user_id, meals_updated_at);
                CREATE INDEX IF NOT EXISTS idx_strength_sets_date ON strength_sets(user_id, date);
                CREATE INDEX IF NOT EXISTS idx_strength_sets_updated ON strength_sets(user_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_cardio_sessions_date ON cardio_sessions(user_id, date);
                CREATE INDEX IF NOT EXISTS idx_cardio_sessions_updated ON cardio_sessions(user_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_protocol_phases_updated ON protocol_phases(user_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_protocol_routines_phase ON protocol_routines(phase_id);
                CREATE INDEX IF NOT EXISTS idx_protocol_routines_updated ON protocol_routines(user_id, updated_at);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    /// Run `f` inside one transaction; nothing is written if it fails.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // --- Row mapping helpers ---

    fn timestamp_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Timestamp> {
        let raw: String = row.get(idx)?;
        parse_timestamp(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    }

    fn date_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<NaiveDate> {
        let raw: String = row.get(idx)?;
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn opt_date_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
        let raw: Option<String> = row.get(idx)?;
        raw.map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })
        })
        .transpose()
    }

    fn json_col<T: serde::de::DeserializeOwned>(
        row: &rusqlite::Row,
        idx: usize,
    ) -> rusqlite::Result<T> {
        let raw: String = row.get(idx)?;
        serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn profile_from_row(row: &rusqlite::Row) -> rusqlite::Result<UserProfile> {
        Ok(UserProfile {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            settings: Self::json_col(row, 3)?,
            updated_at: Self::timestamp_col(row, 4)?,
        })
    }

    // Expects columns:
    // 0: user_id, 1: date, 2: weight_kg, 3: water_ml, 4: steps, 5: sleep_hours,
    // 6: training_done, 7: training_type, 8: training_calories, 9: training_avg_hr,
    // 10: walk_distance_km, 11: walk_duration_min, 12: walk_avg_hr, 13: walk_calories,
    // 14: notes, 15: meals, 16: updated_at
    fn daily_log_from_row(row: &rusqlite::Row) -> rusqlite::Result<DailyLog> {
        Ok(DailyLog {
            user_id: row.get(0)?,
            date: Self::date_col(row, 1)?,
            metrics: DailyMetrics {
                weight_kg: row.get(2)?,
                water_ml: row.get(3)?,
                steps: row.get(4)?,
                sleep_hours: row.get(5)?,
                training_done: row.get(6)?,
                training_type: row.get(7)?,
                training_calories: row.get(8)?,
                training_avg_hr: row.get(9)?,
                walk_distance_km: row.get(10)?,
                walk_duration_min: row.get(11)?,
                walk_avg_hr: row.get(12)?,
                walk_calories: row.get(13)?,
                notes: row.get(14)?,
            },
            meals: Self::json_col(row, 15)?,
            updated_at: Self::timestamp_col(row, 16)?,
        })
    }

    fn strength_set_from_row(row: &rusqlite::Row) -> rusqlite::Result<StrengthSet> {
        Ok(StrengthSet {
            id: row.get(0)?,
            user_id: row.get(1)?,
            date: Self::date_col(row, 2)?,
            muscle_group: row.get(3)?,
            exercise: row.get(4)?,
            planned_sets: row.get(5)?,
            planned_reps: row.get(6)?,
            actual_reps: Self::json_col(row, 7)?,
            rir: row.get(8)?,
            tempo: row.get(9)?,
            avg_hr: row.get(10)?,
            estimated_calories: row.get(11)?,
            notes: row.get(12)?,
            updated_at: Self::timestamp_col(row, 13)?,
        })
    }

    fn cardio_session_from_row(row: &rusqlite::Row) -> rusqlite::Result<CardioSession> {
        Ok(CardioSession {
            id: row.get(0)?,
            user_id: row.get(1)?,
            date: Self::date_col(row, 2)?,
            activity_type: row.get(3)?,
            duration_minutes: row.get(4)?,
            distance_km: row.get(5)?,
            calories_burned: row.get(6)?,
            avg_hr: row.get(7)?,
            max_hr: row.get(8)?,
            notes: row.get(9)?,
            updated_at: Self::timestamp_col(row, 10)?,
        })
    }

    fn phase_from_row(row: &rusqlite::Row) -> rusqlite::Result<ProtocolPhase> {
        Ok(ProtocolPhase {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            start_date: Self::date_col(row, 4)?,
            end_date: Self::opt_date_col(row, 5)?,
            is_active: row.get(6)?,
            updated_at: Self::timestamp_col(row, 7)?,
        })
    }

    fn routine_from_row(row: &rusqlite::Row) -> rusqlite::Result<ProtocolRoutine> {
        Ok(ProtocolRoutine {
            id: row.get(0)?,
            user_id: row.get(1)?,
            phase_id: row.get(2)?,
            day_of_week: row.get(3)?,
            exercise: row.get(4)?,
            sets: row.get(5)?,
            reps: row.get(6)?,
            intensity: row.get(7)?,
            rest_minutes: row.get(8)?,
            notes: row.get(9)?,
            updated_at: Self::timestamp_col(row, 10)?,
        })
    }

    // --- Profiles ---

    fn write_profile(conn: &Connection, profile: &UserProfile) -> Result<()> {
        conn.execute(
            "INSERT INTO user_profiles (id, email, name, settings, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                settings = excluded.settings,
                updated_at = excluded.updated_at",
            params![
                profile.id,
                profile.email,
                profile.name,
                serde_json::to_string(&profile.settings)?,
                format_timestamp(&profile.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        Self::write_profile(&self.conn, profile)
    }

    pub fn bulk_put_profiles(&self, profiles: &[UserProfile]) -> Result<()> {
        self.in_transaction(|conn| {
            for profile in profiles {
                Self::write_profile(conn, profile)?;
            }
            Ok(())
        })
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let profile = self
            .conn
            .query_row(
                "SELECT id, email, name, settings, updated_at FROM user_profiles WHERE id = ?1",
                params![user_id],
                Self::profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn profiles_since(&self, user_id: &str, since: &Timestamp) -> Result<Vec<UserProfile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, name, settings, updated_at FROM user_profiles
             WHERE id = ?1 AND updated_at >= ?2",
        )?;
        let rows = stmt
            .query_map(
                params![user_id, format_timestamp(since)],
                Self::profile_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Daily logs ---

    const DAILY_LOG_COLUMNS: &'static str = "user_id, date, weight_kg, water_ml, steps, sleep_hours,
        training_done, training_type, training_calories, training_avg_hr,
        walk_distance_km, walk_duration_min, walk_avg_hr, walk_calories,
        notes, meals, updated_at";

    pub(crate) fn write_daily_log(conn: &Connection, log: &DailyLog) -> Result<()> {
        let meals_updated_at = log
            .meals
            .iter()
            .map(|m| m.updated_at)
            .max()
            .map(|ts| format_timestamp(&ts));
        let m = &log.metrics;
        conn.execute(
            "INSERT OR REPLACE INTO daily_logs (
                user_id, date, weight_kg, water_ml, steps, sleep_hours,
                training_done, training_type, training_calories, training_avg_hr,
                walk_distance_km, walk_duration_min, walk_avg_hr, walk_calories,
                notes, meals, meals_updated_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                log.user_id,
                format_date(log.date),
                m.weight_kg,
                m.water_ml,
                m.steps,
                m.sleep_hours,
                m.training_done,
                m.training_type,
                m.training_calories,
                m.training_avg_hr,
                m.walk_distance_km,
                m.walk_duration_min,
                m.walk_avg_hr,
                m.walk_calories,
                m.notes,
                serde_json::to_string(&log.meals)?,
                meals_updated_at,
                format_timestamp(&log.updated_at),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn read_daily_log(conn: &Connection, user_id: &str, date: NaiveDate) -> Result<Option<DailyLog>> {
        let log = conn
            .query_row(
                &format!(
                    "SELECT {} FROM daily_logs WHERE user_id = ?1 AND date = ?2",
                    Self::DAILY_LOG_COLUMNS
                ),
                params![user_id, format_date(date)],
                Self::daily_log_from_row,
            )
            .optional()?;
        Ok(log)
    }

    pub fn put_daily_log(&self, log: &DailyLog) -> Result<()> {
        Self::write_daily_log(&self.conn, log)
    }

    pub fn bulk_put_daily_logs(&self, logs: &[DailyLog]) -> Result<()> {
        self.in_transaction(|conn| {
            for log in logs {
                Self::write_daily_log(conn, log)?;
            }
            Ok(())
        })
    }

    pub fn get_daily_log(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyLog>> {
        Self::read_daily_log(&self.conn, user_id, date)
    }

    /// One entry per requested date, `None` where no log exists.
    pub fn bulk_get_daily_logs(
        &self,
        user_id: &str,
        dates: &[NaiveDate],
    ) -> Result<Vec<Option<DailyLog>>> {
        dates
            .iter()
            .map(|date| Self::read_daily_log(&self.conn, user_id, *date))
            .collect()
    }

    /// Read-modify-write of one day inside a single transaction. `f` receives
    /// the existing log, if any, and returns the log to store.
    pub fn update_daily_log<F>(&self, user_id: &str, date: NaiveDate, f: F) -> Result<DailyLog>
    where
        F: FnOnce(Option<DailyLog>) -> Result<DailyLog>,
    {
        self.in_transaction(|conn| {
            let existing = Self::read_daily_log(conn, user_id, date)?;
            let log = f(existing)?;
            Self::write_daily_log(conn, &log)?;
            Ok(log)
        })
    }

    pub fn daily_logs_since(&self, user_id: &str, since: &Timestamp) -> Result<Vec<DailyLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM daily_logs WHERE user_id = ?1 AND updated_at >= ?2 ORDER BY date",
            Self::DAILY_LOG_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, format_timestamp(since)],
                Self::daily_log_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn daily_logs_between(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM daily_logs WHERE user_id = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date",
            Self::DAILY_LOG_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, format_date(from), format_date(to)],
                Self::daily_log_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Meal entries touched at or after `since`, flattened out of their logs.
    pub fn meals_since(&self, user_id: &str, since: &Timestamp) -> Result<Vec<MealLog>> {
        let since_str = format_timestamp(since);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM daily_logs
             WHERE user_id = ?1 AND meals_updated_at IS NOT NULL AND meals_updated_at >= ?2
             ORDER BY date",
            Self::DAILY_LOG_COLUMNS
        ))?;
        let logs = stmt
            .query_map(params![user_id, since_str], Self::daily_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs
            .iter()
            .flat_map(|log| log.meal_logs())
            .filter(|row| row.meal.updated_at >= *since)
            .collect())
    }

    pub fn meals_for_date(&self, user_id: &str, date: NaiveDate) -> Result<Vec<MealEntry>> {
        Ok(self
            .get_daily_log(user_id, date)?
            .map(|log| log.meals)
            .unwrap_or_default())
    }

    // --- Strength sets ---

    const STRENGTH_COLUMNS: &'static str = "id, user_id, date, muscle_group, exercise, planned_sets,
        planned_reps, actual_reps, rir, tempo, avg_hr, estimated_calories, notes, updated_at";

    fn write_strength_set(conn: &Connection, set: &StrengthSet) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO strength_sets (
                id, user_id, date, muscle_group, exercise, planned_sets, planned_reps,
                actual_reps, rir, tempo, avg_hr, estimated_calories, notes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                set.id,
                set.user_id,
                format_date(set.date),
                set.muscle_group,
                set.exercise,
                set.planned_sets,
                set.planned_reps,
                serde_json::to_string(&set.actual_reps)?,
                set.rir,
                set.tempo,
                set.avg_hr,
                set.estimated_calories,
                set.notes,
                format_timestamp(&set.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn put_strength_set(&self, set: &StrengthSet) -> Result<()> {
        Self::write_strength_set(&self.conn, set)
    }

    pub fn bulk_put_strength_sets(&self, sets: &[StrengthSet]) -> Result<()> {
        self.in_transaction(|conn| {
            for set in sets {
                Self::write_strength_set(conn, set)?;
            }
            Ok(())
        })
    }

    pub fn get_strength_set(&self, id: &str) -> Result<Option<StrengthSet>> {
        let set = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM strength_sets WHERE id = ?1",
                    Self::STRENGTH_COLUMNS
                ),
                params![id],
                Self::strength_set_from_row,
            )
            .optional()?;
        Ok(set)
    }

    pub fn bulk_get_strength_sets(&self, ids: &[String]) -> Result<Vec<Option<StrengthSet>>> {
        ids.iter().map(|id| self.get_strength_set(id)).collect()
    }

    pub fn strength_sets_since(&self, user_id: &str, since: &Timestamp) -> Result<Vec<StrengthSet>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM strength_sets WHERE user_id = ?1 AND updated_at >= ?2 ORDER BY date, id",
            Self::STRENGTH_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, format_timestamp(since)],
                Self::strength_set_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn strength_sets_for_date(&self, user_id: &str, date: NaiveDate) -> Result<Vec<StrengthSet>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM strength_sets WHERE user_id = ?1 AND date = ?2 ORDER BY updated_at, id",
            Self::STRENGTH_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, format_date(date)],
                Self::strength_set_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Cardio sessions ---

    const CARDIO_COLUMNS: &'static str = "id, user_id, date, activity_type, duration_minutes,
        distance_km, calories_burned, avg_hr, max_hr, notes, updated_at";

    fn write_cardio_session(conn: &Connection, session: &CardioSession) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO cardio_sessions (
                id, user_id, date, activity_type, duration_minutes, distance_km,
                calories_burned, avg_hr, max_hr, notes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.id,
                session.user_id,
                format_date(session.date),
                session.activity_type,
                session.duration_minutes,
                session.distance_km,
                session.calories_burned,
                session.avg_hr,
                session.max_hr,
                session.notes,
                format_timestamp(&session.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn put_cardio_session(&self, session: &CardioSession) -> Result<()> {
        Self::write_cardio_session(&self.conn, session)
    }

    pub fn bulk_put_cardio_sessions(&self, sessions: &[CardioSession]) -> Result<()> {
        self.in_transaction(|conn| {
            for session in sessions {
                Self::write_cardio_session(conn, session)?;
            }
            Ok(())
        })
    }

    pub fn get_cardio_session(&self, id: &str) -> Result<Option<CardioSession>> {
        let session = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM cardio_sessions WHERE id = ?1",
                    Self::CARDIO_COLUMNS
                ),
                params![id],
                Self::cardio_session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn cardio_sessions_since(
        &self,
        user_id: &str,
        since: &Timestamp,
    ) -> Result<Vec<CardioSession>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM cardio_sessions WHERE user_id = ?1 AND updated_at >= ?2 ORDER BY date, id",
            Self::CARDIO_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, format_timestamp(since)],
                Self::cardio_session_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cardio_sessions_for_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<CardioSession>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM cardio_sessions WHERE user_id = ?1 AND date = ?2 ORDER BY updated_at, id",
            Self::CARDIO_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, format_date(date)],
                Self::cardio_session_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Protocol phases ---

    const PHASE_COLUMNS: &'static str =
        "id, user_id, name, description, start_date, end_date, is_active, updated_at";

    fn write_phase(conn: &Connection, phase: &ProtocolPhase) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO protocol_phases (
                id, user_id, name, description, start_date, end_date, is_active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                phase.id,
                phase.user_id,
                phase.name,
                phase.description,
                format_date(phase.start_date),
                phase.end_date.map(format_date),
                phase.is_active,
                format_timestamp(&phase.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn put_phase(&self, phase: &ProtocolPhase) -> Result<()> {
        Self::write_phase(&self.conn, phase)
    }

    pub fn bulk_put_phases(&self, phases: &[ProtocolPhase]) -> Result<()> {
        self.in_transaction(|conn| {
            for phase in phases {
                Self::write_phase(conn, phase)?;
            }
            Ok(())
        })
    }

    pub fn get_phase(&self, id: &str) -> Result<Option<ProtocolPhase>> {
        let phase = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM protocol_phases WHERE id = ?1",
                    Self::PHASE_COLUMNS
                ),
                params![id],
                Self::phase_from_row,
            )
            .optional()?;
        Ok(phase)
    }

    pub fn phases_since(&self, user_id: &str, since: &Timestamp) -> Result<Vec<ProtocolPhase>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM protocol_phases WHERE user_id = ?1 AND updated_at >= ?2 ORDER BY start_date, id",
            Self::PHASE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, format_timestamp(since)],
                Self::phase_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_phases(&self, user_id: &str) -> Result<Vec<ProtocolPhase>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM protocol_phases WHERE user_id = ?1 ORDER BY start_date, id",
            Self::PHASE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![user_id], Self::phase_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn active_phase(&self, user_id: &str) -> Result<Option<ProtocolPhase>> {
        let phase = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM protocol_phases WHERE user_id = ?1 AND is_active = 1
                     ORDER BY start_date DESC LIMIT 1",
                    Self::PHASE_COLUMNS
                ),
                params![user_id],
                Self::phase_from_row,
            )
            .optional()?;
        Ok(phase)
    }

    // --- Protocol routines ---

    const ROUTINE_COLUMNS: &'static str = "id, user_id, phase_id, day_of_week, exercise, sets, reps,
        intensity, rest_minutes, notes, updated_at";

    fn write_routine(conn: &Connection, routine: &ProtocolRoutine) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO protocol_routines (
                id, user_id, phase_id, day_of_week, exercise, sets, reps,
                intensity, rest_minutes, notes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                routine.id,
                routine.user_id,
                routine.phase_id,
                routine.day_of_week,
                routine.exercise,
                routine.sets,
                routine.reps,
                routine.intensity,
                routine.rest_minutes,
                routine.notes,
                format_timestamp(&routine.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn put_routine(&self, routine: &ProtocolRoutine) -> Result<()> {
        Self::write_routine(&self.conn, routine)
    }

    pub fn bulk_put_routines(&self, routines: &[ProtocolRoutine]) -> Result<()> {
        self.in_transaction(|conn| {
            for routine in routines {
                Self::write_routine(conn, routine)?;
            }
            Ok(())
        })
    }

    pub fn get_routine(&self, id: &str) -> Result<Option<ProtocolRoutine>> {
        let routine = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM protocol_routines WHERE id = ?1",
                    Self::ROUTINE_COLUMNS
                ),
                params![id],
                Self::routine_from_row,
            )
            .optional()?;
        Ok(routine)
    }

    pub fn routines_since(&self, user_id: &str, since: &Timestamp) -> Result<Vec<ProtocolRoutine>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM protocol_routines WHERE user_id = ?1 AND updated_at >= ?2 ORDER BY day_of_week, id",
            Self::ROUTINE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, format_timestamp(since)],
                Self::routine_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn routines_for_phase(&self, phase_id: &str) -> Result<Vec<ProtocolRoutine>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM protocol_routines WHERE phase_id = ?1 ORDER BY day_of_week, id",
            Self::ROUTINE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![phase_id], Self::routine_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Sync state ---

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_state(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                self.conn.execute(
                    "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM sync_state WHERE key = ?1", params![key])?;
            }
        }
        Ok(())
    }

    /// The watermark of the last fully successful sync pass.
    pub fn last_sync(&self) -> Result<Option<Timestamp>> {
        self.get_state(LAST_SYNC_KEY)?
            .map(|raw| parse_timestamp(&raw))
            .transpose()
    }

    pub fn set_last_sync(&self, ts: &Timestamp) -> Result<()> {
        self.set_state(LAST_SYNC_KEY, Some(&format_timestamp(ts)))
    }

    pub fn session_user(&self) -> Result<Option<String>> {
        self.get_state(SESSION_USER_KEY)
    }

    pub fn set_session_user(&self, user_id: Option<&str>) -> Result<()> {
        self.set_state(SESSION_USER_KEY, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MealType, ProfileSettings, meal_calories};
    use crate::testing::{cardio_session, date, meal, phase, routine, strength_set, ts};

    #[test]
    fn test_open_sets_schema_version() {
        let store = LocalStore::open_in_memory().unwrap();
        let version: i64 = store
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, STORE_VERSION);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        }
        let err = LocalStore::open(&path).err().unwrap();
        assert!(err.to_string().contains("schema version 99"));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        {
            let store = LocalStore::open(&path).unwrap();
            store
                .set_last_sync(&ts("2026-01-05T08:00:00Z"))
                .unwrap();
        }
        let store = LocalStore::open(&path).unwrap();
        assert_eq!(
            store.last_sync().unwrap(),
            Some(ts("2026-01-05T08:00:00Z"))
        );
    }

    #[test]
    fn test_profile_roundtrip_and_since() {
        let store = LocalStore::open_in_memory().unwrap();
        let profile = UserProfile {
            id: "u1".to_string(),
            email: "a@example.com".to_string(),
            name: "Ana".to_string(),
            settings: ProfileSettings {
                target_weight_kg: Some(75.0),
                ..ProfileSettings::default()
            },
            updated_at: ts("2026-01-05T08:00:00Z"),
        };
        store.put_profile(&profile).unwrap();

        assert_eq!(store.get_profile("u1").unwrap(), Some(profile.clone()));
        assert!(store.get_profile("u2").unwrap().is_none());
        assert_eq!(
            store
                .profiles_since("u1", &ts("2026-01-05T08:00:00Z"))
                .unwrap()
                .len(),
            1
        );
        assert!(
            store
                .profiles_since("u1", &ts("2026-01-05T08:00:01Z"))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_daily_log_keyed_by_user_and_date() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut log = DailyLog::empty("u1", date("2026-01-05"), ts("2026-01-05T08:00:00Z"));
        log.metrics.weight_kg = Some(80.0);
        store.put_daily_log(&log).unwrap();

        log.metrics.weight_kg = Some(79.0);
        store.put_daily_log(&log).unwrap();

        let other = DailyLog::empty("u2", date("2026-01-05"), ts("2026-01-05T08:00:00Z"));
        store.put_daily_log(&other).unwrap();

        let fetched = store.get_daily_log("u1", date("2026-01-05")).unwrap().unwrap();
        assert_eq!(fetched.metrics.weight_kg, Some(79.0));
        assert_eq!(
            store
                .daily_logs_between("u1", date("2026-01-01"), date("2026-01-31"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_bulk_get_daily_logs_preserves_order() {
        let store = LocalStore::open_in_memory().unwrap();
        let log = DailyLog::empty("u1", date("2026-01-06"), ts("2026-01-06T08:00:00Z"));
        store.bulk_put_daily_logs(std::slice::from_ref(&log)).unwrap();

        let got = store
            .bulk_get_daily_logs("u1", &[date("2026-01-05"), date("2026-01-06")])
            .unwrap();
        assert!(got[0].is_none());
        assert_eq!(got[1].as_ref(), Some(&log));
    }

    #[test]
    fn test_daily_logs_since_is_inclusive() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .put_daily_log(&DailyLog::empty(
                "u1",
                date("2026-01-04"),
                ts("2026-01-04T08:00:00Z"),
            ))
            .unwrap();
        store
            .put_daily_log(&DailyLog::empty(
                "u1",
                date("2026-01-05"),
                ts("2026-01-05T08:00:00Z"),
            ))
            .unwrap();

        let delta = store
            .daily_logs_since("u1", &ts("2026-01-05T08:00:00Z"))
            .unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].date, date("2026-01-05"));
    }

    #[test]
    fn test_meals_since_filters_per_meal() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut log = DailyLog::empty("u1", date("2026-01-05"), ts("2026-01-05T07:00:00Z"));
        log.upsert_meal(meal("old", MealType::Breakfast, "2026-01-05T07:30:00Z"));
        log.upsert_meal(meal("new", MealType::Lunch, "2026-01-05T12:30:00Z"));
        store.put_daily_log(&log).unwrap();

        let delta = store
            .meals_since("u1", &ts("2026-01-05T10:00:00Z"))
            .unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].meal.id, "new");
        assert_eq!(delta[0].date, date("2026-01-05"));

        assert!(
            store
                .meals_since("u1", &ts("2026-01-05T13:00:00Z"))
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.meals_for_date("u1", date("2026-01-05")).unwrap().len(), 2);
    }

    #[test]
    fn test_update_daily_log_rolls_back_on_error() {
        let store = LocalStore::open_in_memory().unwrap();
        let result = store.update_daily_log("u1", date("2026-01-05"), |_| {
            anyhow::bail!("nope")
        });
        assert!(result.is_err());
        assert!(store.get_daily_log("u1", date("2026-01-05")).unwrap().is_none());

        let log = store
            .update_daily_log("u1", date("2026-01-05"), |existing| {
                assert!(existing.is_none());
                let mut log =
                    DailyLog::empty("u1", date("2026-01-05"), ts("2026-01-05T08:00:00Z"));
                log.upsert_meal(MealEntry {
                    calories: meal_calories(10.0, 10.0, 10.0),
                    ..meal("m1", MealType::Snack, "2026-01-05T08:00:00Z")
                });
                Ok(log)
            })
            .unwrap();
        assert_eq!(log.total_calories(), 170);
    }

    #[test]
    fn test_strength_sets_by_id_and_date() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = strength_set("s1", "u1", "2026-01-05", "2026-01-05T09:00:00Z");
        let b = strength_set("s2", "u1", "2026-01-06", "2026-01-06T09:00:00Z");
        store.bulk_put_strength_sets(&[a.clone(), b.clone()]).unwrap();

        assert_eq!(store.get_strength_set("s1").unwrap(), Some(a.clone()));
        assert_eq!(
            store.strength_sets_for_date("u1", date("2026-01-06")).unwrap(),
            vec![b.clone()]
        );
        assert_eq!(
            store
                .strength_sets_since("u1", &ts("2026-01-06T00:00:00Z"))
                .unwrap(),
            vec![b]
        );
        let got = store
            .bulk_get_strength_sets(&["s1".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(got, vec![Some(a), None]);
    }

    #[test]
    fn test_cardio_sessions_by_date() {
        let store = LocalStore::open_in_memory().unwrap();
        let c = cardio_session("c1", "u1", "2026-01-05", "2026-01-05T18:00:00Z");
        store.put_cardio_session(&c).unwrap();

        assert_eq!(store.get_cardio_session("c1").unwrap(), Some(c.clone()));
        assert_eq!(
            store.cardio_sessions_for_date("u1", date("2026-01-05")).unwrap(),
            vec![c]
        );
        assert!(
            store
                .cardio_sessions_since("u1", &ts("2026-01-06T00:00:00Z"))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_active_phase_and_routines() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut old = phase("p1", "u1", "2025-10-01", "2026-01-01T00:00:00Z");
        old.is_active = false;
        let current = phase("p2", "u1", "2026-01-01", "2026-01-02T00:00:00Z");
        store.bulk_put_phases(&[old, current.clone()]).unwrap();

        assert_eq!(store.active_phase("u1").unwrap(), Some(current));
        assert_eq!(store.list_phases("u1").unwrap().len(), 2);

        let r1 = routine("r1", "u1", "p2", 2, "2026-01-02T00:00:00Z");
        let r2 = routine("r2", "u1", "p2", 0, "2026-01-02T00:00:00Z");
        let r3 = routine("r3", "u1", "p1", 1, "2026-01-02T00:00:00Z");
        store.bulk_put_routines(&[r1, r2, r3]).unwrap();

        let ids: Vec<String> = store
            .routines_for_phase("p2")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["r2", "r1"]);
        assert_eq!(
            store
                .routines_since("u1", &ts("2026-01-01T00:00:00Z"))
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn test_sync_state() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(store.last_sync().unwrap().is_none());
        assert!(store.session_user().unwrap().is_none());

        store.set_session_user(Some("u1")).unwrap();
        assert_eq!(store.session_user().unwrap().as_deref(), Some("u1"));
        store.set_session_user(None).unwrap();
        assert!(store.session_user().unwrap().is_none());

        store.set_last_sync(&ts("2026-01-05T08:00:00.123456Z")).unwrap();
        assert_eq!(
            store.last_sync().unwrap(),
            Some(ts("2026-01-05T08:00:00.123456Z"))
        );
    }
}
