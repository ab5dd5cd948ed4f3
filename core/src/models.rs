use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

/// Canonical text form used for every stored timestamp: RFC 3339, UTC, fixed
/// microsecond precision. Fixed width keeps SQL string comparison ordered.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<Timestamp> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow::anyhow!("Invalid timestamp '{value}': {e}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub fn epoch() -> Timestamp {
    DateTime::UNIX_EPOCH
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid date '{value}'. Use YYYY-MM-DD"))
}

// --- User profile ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Sedentary,
    Light,
    Moderate,
    Active,
    VeryActive,
}

impl FromStr for ActivityLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "sedentary" => Ok(Self::Sedentary),
            "light" => Ok(Self::Light),
            "moderate" => Ok(Self::Moderate),
            "active" => Ok(Self::Active),
            "very_active" => Ok(Self::VeryActive),
            _ => bail!(
                "Invalid activity level '{s}'. Must be one of: sedentary, light, moderate, active, very_active"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSystem {
    Metric,
    Imperial,
}

impl FromStr for MeasurementSystem {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "metric" => Ok(Self::Metric),
            "imperial" => Ok(Self::Imperial),
            _ => bail!("Invalid measurement system '{s}'. Use 'metric' or 'imperial'"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_weight_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_body_fat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_level: Option<ActivityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_system: Option<MeasurementSystem>,
}

/// One per user. Never deleted, only overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub settings: ProfileSettings,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub name: Option<String>,
    pub target_weight_kg: Option<f64>,
    pub target_body_fat: Option<f64>,
    pub activity_level: Option<ActivityLevel>,
    pub measurement_system: Option<MeasurementSystem>,
}

// --- Meals ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MealType {
    Breakfast,
    Lunch,
    Snack,
    Dinner,
    Extra,
}

impl MealType {
    pub const ALL: [MealType; 5] = [
        MealType::Breakfast,
        MealType::Lunch,
        MealType::Snack,
        MealType::Dinner,
        MealType::Extra,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Breakfast => "breakfast",
            Self::Lunch => "lunch",
            Self::Snack => "snack",
            Self::Dinner => "dinner",
            Self::Extra => "extra",
        }
    }
}

impl fmt::Display for MealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == lower)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|m| m.as_str()).collect();
                anyhow::anyhow!(
                    "Invalid meal type '{s}'. Must be one of: {}",
                    names.join(", ")
                )
            })
    }
}

/// protein*4 + carbs*4 + fat*9, rounded to whole kcal.
pub fn meal_calories(protein_g: f64, carbs_g: f64, fat_g: f64) -> i64 {
    (protein_g * 4.0 + carbs_g * 4.0 + fat_g * 9.0).round() as i64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealEntry {
    pub id: String,
    pub meal_type: MealType,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
    pub calories: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewMeal {
    pub meal_type: MealType,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateMeal {
    pub meal_type: Option<MealType>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub note: Option<String>,
}

/// Remote `meal_logs` row: a meal entry flattened out of its daily log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealLog {
    pub user_id: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub meal: MealEntry,
}

// --- Daily logs ---

/// The scalar part of a daily log, shared by the local record and the remote row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub water_ml: Option<i64>,
    #[serde(default)]
    pub steps: Option<i64>,
    #[serde(default)]
    pub sleep_hours: Option<f64>,
    #[serde(default)]
    pub training_done: Option<bool>,
    #[serde(default)]
    pub training_type: Option<String>,
    #[serde(default)]
    pub training_calories: Option<f64>,
    #[serde(default)]
    pub training_avg_hr: Option<i64>,
    #[serde(default)]
    pub walk_distance_km: Option<f64>,
    #[serde(default)]
    pub walk_duration_min: Option<f64>,
    #[serde(default)]
    pub walk_avg_hr: Option<i64>,
    #[serde(default)]
    pub walk_calories: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl DailyMetrics {
    /// Overlay the fields that are set in `other`.
    pub fn apply(&mut self, other: &DailyMetrics) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field.clone_from(&other.$field);
                })*
            };
        }
        overlay!(
            weight_kg,
            water_ml,
            steps,
            sleep_hours,
            training_done,
            training_type,
            training_calories,
            training_avg_hr,
            walk_distance_km,
            walk_duration_min,
            walk_avg_hr,
            walk_calories,
            notes
        );
    }
}

/// At most one per (user, date). Meals are embedded and keyed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLog {
    pub user_id: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub metrics: DailyMetrics,
    #[serde(default)]
    pub meals: Vec<MealEntry>,
    pub updated_at: Timestamp,
}

/// Remote `daily_logs` row: a daily log without its meals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLogRecord {
    pub user_id: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub metrics: DailyMetrics,
    pub updated_at: Timestamp,
}

impl DailyLog {
    pub fn empty(user_id: &str, date: NaiveDate, updated_at: Timestamp) -> Self {
        Self {
            user_id: user_id.to_string(),
            date,
            metrics: DailyMetrics::default(),
            meals: Vec::new(),
            updated_at,
        }
    }

    pub fn record(&self) -> DailyLogRecord {
        DailyLogRecord {
            user_id: self.user_id.clone(),
            date: self.date,
            metrics: self.metrics.clone(),
            updated_at: self.updated_at,
        }
    }

    pub fn meal_logs(&self) -> impl Iterator<Item = MealLog> + '_ {
        self.meals.iter().map(|meal| MealLog {
            user_id: self.user_id.clone(),
            date: self.date,
            meal: meal.clone(),
        })
    }

    /// Insert the meal, or replace the one with the same id.
    pub fn upsert_meal(&mut self, meal: MealEntry) {
        if let Some(existing) = self.meals.iter_mut().find(|m| m.id == meal.id) {
            *existing = meal;
        } else {
            self.meals.push(meal);
        }
    }

    pub fn total_calories(&self) -> i64 {
        self.meals.iter().map(|m| m.calories).sum()
    }

    pub fn total_protein_g(&self) -> f64 {
        self.meals.iter().map(|m| m.protein_g).sum()
    }
}

// --- Training ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrengthSet {
    pub id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub muscle_group: String,
    pub exercise: String,
    pub planned_sets: u32,
    pub planned_reps: u32,
    #[serde(default)]
    pub actual_reps: Vec<u32>,
    #[serde(default)]
    pub rir: Option<u32>,
    #[serde(default)]
    pub tempo: Option<String>,
    #[serde(default)]
    pub avg_hr: Option<u32>,
    #[serde(default)]
    pub estimated_calories: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewStrengthSet {
    pub date: NaiveDate,
    pub muscle_group: String,
    pub exercise: String,
    pub planned_sets: u32,
    pub planned_reps: u32,
    pub actual_reps: Vec<u32>,
    pub rir: Option<u32>,
    pub tempo: Option<String>,
    pub avg_hr: Option<u32>,
    pub estimated_calories: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardioSession {
    pub id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub activity_type: String,
    pub duration_minutes: f64,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub calories_burned: Option<f64>,
    #[serde(default)]
    pub avg_hr: Option<u32>,
    #[serde(default)]
    pub max_hr: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewCardioSession {
    pub date: NaiveDate,
    pub activity_type: String,
    pub duration_minutes: f64,
    pub distance_km: Option<f64>,
    pub calories_burned: Option<f64>,
    pub avg_hr: Option<u32>,
    pub max_hr: Option<u32>,
    pub notes: Option<String>,
}

// --- Protocol ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolPhase {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_active: bool,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewProtocolPhase {
    pub name: String,
    pub description: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRoutine {
    pub id: String,
    pub user_id: String,
    pub phase_id: String,
    /// 0 = Monday .. 6 = Sunday
    pub day_of_week: u8,
    pub exercise: String,
    pub sets: u32,
    pub reps: u32,
    pub intensity: f64,
    pub rest_minutes: f64,
    #[serde(default)]
    pub notes: Option<String>,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewProtocolRoutine {
    pub phase_id: String,
    pub day_of_week: u8,
    pub exercise: String,
    pub sets: u32,
    pub reps: u32,
    pub intensity: f64,
    pub rest_minutes: f64,
    pub notes: Option<String>,
}

// --- Sync status ---

/// Read-only snapshot handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub last_sync: Option<Timestamp>,
    pub pending_changes: u64,
    pub sync_in_progress: bool,
}

impl SyncStatus {
    pub fn label(&self) -> String {
        if !self.is_online {
            "Offline".to_string()
        } else if self.sync_in_progress {
            "Syncing...".to_string()
        } else if self.pending_changes > 0 {
            format!("Syncing ({} pending)", self.pending_changes)
        } else {
            "Synced".to_string()
        }
    }
}

// --- Validation ---

pub fn validate_macros(protein_g: f64, carbs_g: f64, fat_g: f64) -> Result<()> {
    for (name, value) in [("protein", protein_g), ("carbs", carbs_g), ("fat", fat_g)] {
        if !value.is_finite() || value < 0.0 {
            bail!("{name} must be a non-negative number");
        }
    }
    Ok(())
}

pub fn validate_day_of_week(day: u8) -> Result<()> {
    if day > 6 {
        bail!("day_of_week must be between 0 (Monday) and 6 (Sunday)");
    }
    Ok(())
}

/// Parse a comma separated rep list such as "10,10,8".
pub fn parse_rep_list(value: &str) -> Result<Vec<u32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| anyhow::anyhow!("Invalid rep count '{s}'"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    fn meal(id: &str, protein: f64) -> MealEntry {
        MealEntry {
            id: id.to_string(),
            meal_type: MealType::Lunch,
            protein_g: protein,
            carbs_g: 0.0,
            fat_g: 0.0,
            calories: meal_calories(protein, 0.0, 0.0),
            note: None,
            updated_at: ts("2026-01-05T12:00:00Z"),
        }
    }

    #[test]
    fn test_meal_calories_formula() {
        // 30*4 + 50*4 + 10*9 = 120 + 200 + 90
        assert_eq!(meal_calories(30.0, 50.0, 10.0), 410);
        // 12.3*4 + 0 + 1.1*9 = 49.2 + 9.9 = 59.1
        assert_eq!(meal_calories(12.3, 0.0, 1.1), 59);
        assert_eq!(meal_calories(0.0, 0.0, 0.0), 0);
    }

    #[test]
    fn test_meal_type_case_insensitive() {
        assert_eq!("Lunch".parse::<MealType>().unwrap(), MealType::Lunch);
        assert_eq!("EXTRA".parse::<MealType>().unwrap(), MealType::Extra);
        assert!("brunch".parse::<MealType>().is_err());
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = format_timestamp(&ts("2026-01-05T08:00:00Z"));
        let b = format_timestamp(&ts("2026-01-05T08:00:00.5+00:00"));
        assert_eq!(a, "2026-01-05T08:00:00.000000Z");
        assert_eq!(b, "2026-01-05T08:00:00.500000Z");
        assert!(a < b);
    }

    #[test]
    fn test_timestamp_parse_normalizes_offset() {
        let t = ts("2026-01-05T10:00:00+02:00");
        assert_eq!(format_timestamp(&t), "2026-01-05T08:00:00.000000Z");
    }

    #[test]
    fn test_upsert_meal_replaces_by_id() {
        let date = parse_date("2026-01-05").unwrap();
        let mut log = DailyLog::empty("u1", date, epoch());
        log.upsert_meal(meal("a", 10.0));
        log.upsert_meal(meal("b", 20.0));
        log.upsert_meal(meal("a", 15.0));

        assert_eq!(log.meals.len(), 2);
        assert!((log.meals[0].protein_g - 15.0).abs() < f64::EPSILON);
        assert_eq!(log.total_calories(), 60 + 80);
    }

    #[test]
    fn test_daily_log_record_drops_meals() {
        let date = parse_date("2026-01-05").unwrap();
        let mut log = DailyLog::empty("u1", date, ts("2026-01-05T12:00:00Z"));
        log.metrics.weight_kg = Some(80.0);
        log.upsert_meal(meal("a", 10.0));

        let json = serde_json::to_value(log.record()).unwrap();
        assert_eq!(json["date"], "2026-01-05");
        assert_eq!(json["weight_kg"], 80.0);
        assert!(json.get("meals").is_none());
    }

    #[test]
    fn test_meal_log_flattens_entry() {
        let date = parse_date("2026-01-05").unwrap();
        let mut log = DailyLog::empty("u1", date, epoch());
        log.upsert_meal(meal("a", 10.0));

        let row = log.meal_logs().next().unwrap();
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["id"], "a");
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["meal_type"], "lunch");

        let back: MealLog = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_metrics_apply_only_overlays_set_fields() {
        let mut base = DailyMetrics {
            weight_kg: Some(80.0),
            steps: Some(9000),
            ..DailyMetrics::default()
        };
        base.apply(&DailyMetrics {
            weight_kg: Some(79.5),
            water_ml: Some(2000),
            ..DailyMetrics::default()
        });
        assert_eq!(base.weight_kg, Some(79.5));
        assert_eq!(base.steps, Some(9000));
        assert_eq!(base.water_ml, Some(2000));
    }

    #[test]
    fn test_metrics_apply_can_reset_training_done() {
        let mut base = DailyMetrics {
            training_done: Some(true),
            ..DailyMetrics::default()
        };
        base.apply(&DailyMetrics::default());
        assert_eq!(base.training_done, Some(true));

        base.apply(&DailyMetrics {
            training_done: Some(false),
            ..DailyMetrics::default()
        });
        assert_eq!(base.training_done, Some(false));
    }

    #[test]
    fn test_sync_status_label() {
        let mut status = SyncStatus {
            is_online: true,
            last_sync: None,
            pending_changes: 0,
            sync_in_progress: false,
        };
        assert_eq!(status.label(), "Synced");
        status.pending_changes = 3;
        assert_eq!(status.label(), "Syncing (3 pending)");
        status.is_online = false;
        assert_eq!(status.label(), "Offline");
    }

    #[test]
    fn test_sync_status_serializes_camel_case() {
        let status = SyncStatus {
            is_online: false,
            last_sync: None,
            pending_changes: 2,
            sync_in_progress: false,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["isOnline"], false);
        assert_eq!(json["pendingChanges"], 2);
        assert!(json["lastSync"].is_null());
    }

    #[test]
    fn test_validate_macros() {
        assert!(validate_macros(10.0, 0.0, 5.0).is_ok());
        assert!(validate_macros(-1.0, 0.0, 0.0).is_err());
        assert!(validate_macros(0.0, f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_parse_rep_list() {
        assert_eq!(parse_rep_list("10, 10,8").unwrap(), vec![10, 10, 8]);
        assert!(parse_rep_list("10,x").is_err());
        assert!(parse_rep_list("").unwrap().is_empty());
    }
}
