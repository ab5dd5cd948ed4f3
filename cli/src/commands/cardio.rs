use anyhow::Result;
use tabled::Tabled;

use fitstat_core::models::NewCardioSession;
use fitstat_core::service::FitstatService;

use super::helpers::{display_date, opt, opt_f1, parse_date, print_json, print_table, short_id};

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_cardio_log(
    svc: &FitstatService,
    activity: &str,
    minutes: f64,
    km: Option<f64>,
    calories: Option<f64>,
    avg_hr: Option<u32>,
    max_hr: Option<u32>,
    notes: Option<String>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let session = NewCardioSession {
        date: parse_date(date)?,
        activity_type: activity.to_lowercase(),
        duration_minutes: minutes,
        distance_km: km,
        calories_burned: calories,
        avg_hr,
        max_hr,
        notes,
    };
    let saved = svc.log_cardio(&session)?;

    if json {
        print_json(&saved)
    } else {
        println!(
            "Logged {} for {}: {:.0} min, {} km [{}]",
            saved.activity_type,
            display_date(saved.date),
            saved.duration_minutes,
            opt_f1(saved.distance_km),
            saved.id
        );
        Ok(())
    }
}

pub(crate) fn cmd_cardio_list(svc: &FitstatService, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let sessions = svc.cardio_for(date)?;

    if json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        eprintln!("No cardio logged for {}", display_date(date));
        return Ok(());
    }

    #[derive(Tabled)]
    struct CardioRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Activity")]
        activity: String,
        #[tabled(rename = "Min")]
        minutes: String,
        #[tabled(rename = "Km")]
        km: String,
        #[tabled(rename = "Kcal")]
        calories: String,
        #[tabled(rename = "Avg HR")]
        avg_hr: String,
        #[tabled(rename = "Max HR")]
        max_hr: String,
    }

    let rows: Vec<CardioRow> = sessions
        .iter()
        .map(|c| CardioRow {
            id: short_id(&c.id),
            activity: c.activity_type.clone(),
            minutes: format!("{:.0}", c.duration_minutes),
            km: opt_f1(c.distance_km),
            calories: opt_f1(c.calories_burned),
            avg_hr: opt(c.avg_hr),
            max_hr: opt(c.max_hr),
        })
        .collect();
    print_table(&rows, Some(2..7));
    Ok(())
}
