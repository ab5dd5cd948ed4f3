use anyhow::{Result, bail};
use chrono::Local;
use std::process;
use tabled::Tabled;

use fitstat_core::models::{DailyLog, DailyMetrics, MealType};
use fitstat_core::service::FitstatService;

use super::helpers::{display_date, opt, opt_f1, parse_date, print_json, print_table, short_id};

pub(crate) fn cmd_day_log(
    svc: &FitstatService,
    date: Option<String>,
    metrics: &DailyMetrics,
    json: bool,
) -> Result<()> {
    if *metrics == DailyMetrics::default() {
        bail!("Nothing to log. Provide at least one metric, e.g. --weight or --steps");
    }
    if metrics.weight_kg.is_some_and(|w| w <= 0.0) {
        bail!("Weight must be greater than 0");
    }
    let date = parse_date(date)?;
    let log = svc.log_metrics(date, metrics)?;

    if json {
        print_json(&log)
    } else {
        println!("Logged metrics for {}", display_date(log.date));
        Ok(())
    }
}

pub(crate) fn cmd_day_show(svc: &FitstatService, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let log = svc.day(date)?;
    let strength = svc.strength_for(date)?;
    let cardio = svc.cardio_for(date)?;

    if json {
        return print_json(&serde_json::json!({
            "log": log,
            "strength": strength,
            "cardio": cardio,
        }));
    }

    if log.is_none() && strength.is_empty() && cardio.is_empty() {
        eprintln!("Nothing logged for {}", display_date(date));
        process::exit(2);
    }

    println!("=== {} ===\n", display_date(date));

    if let Some(log) = &log {
        print_metrics(log);
        print_meals(log);
    }

    if !strength.is_empty() {
        println!("  STRENGTH");
        for s in &strength {
            let done = if s.actual_reps.is_empty() {
                "not done".to_string()
            } else {
                s.actual_reps
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join("/")
            };
            println!(
                "    [{}] {} ({}) {}x{} -> {done}",
                short_id(&s.id),
                s.exercise,
                s.muscle_group,
                s.planned_sets,
                s.planned_reps,
            );
        }
        println!();
    }

    if !cardio.is_empty() {
        println!("  CARDIO");
        for c in &cardio {
            println!(
                "    [{}] {} {:.0} min, {} km, {} kcal",
                short_id(&c.id),
                c.activity_type,
                c.duration_minutes,
                opt_f1(c.distance_km),
                opt_f1(c.calories_burned),
            );
        }
        println!();
    }

    Ok(())
}

fn print_metrics(log: &DailyLog) {
    let m = &log.metrics;
    println!("  BODY");
    println!(
        "    Weight {} kg | Water {} ml | Steps {} | Sleep {} h",
        opt_f1(m.weight_kg),
        opt(m.water_ml),
        opt(m.steps),
        opt_f1(m.sleep_hours)
    );
    if m.training_done == Some(true) || m.training_type.is_some() {
        println!(
            "    Training: {} ({} kcal, avg HR {})",
            m.training_type.as_deref().unwrap_or("done"),
            opt_f1(m.training_calories),
            opt(m.training_avg_hr)
        );
    }
    if m.walk_distance_km.is_some() || m.walk_duration_min.is_some() {
        println!(
            "    Walk: {} km in {} min ({} kcal)",
            opt_f1(m.walk_distance_km),
            opt_f1(m.walk_duration_min),
            opt_f1(m.walk_calories)
        );
    }
    if let Some(notes) = &m.notes {
        println!("    Notes: {notes}");
    }
    println!();
}

fn print_meals(log: &DailyLog) {
    if log.meals.is_empty() {
        return;
    }
    for meal_type in MealType::ALL {
        let meals: Vec<_> = log.meals.iter().filter(|m| m.meal_type == meal_type).collect();
        if meals.is_empty() {
            continue;
        }
        let subtotal: i64 = meals.iter().map(|m| m.calories).sum();
        println!("  {} ({subtotal} kcal)", meal_type.as_str().to_uppercase());
        for m in meals {
            let note = m.note.as_ref().map(|n| format!(" {n}")).unwrap_or_default();
            println!(
                "    [{}]{note} {} kcal | P:{:.0}g C:{:.0}g F:{:.0}g",
                short_id(&m.id),
                m.calories,
                m.protein_g,
                m.carbs_g,
                m.fat_g
            );
        }
        println!();
    }
    println!(
        "  TOTAL: {} kcal | P:{:.0}g",
        log.total_calories(),
        log.total_protein_g()
    );
    println!();
}

pub(crate) fn cmd_day_history(svc: &FitstatService, days: u32, json: bool) -> Result<()> {
    if days == 0 {
        bail!("Days must be at least 1");
    }
    let today = Local::now().date_naive();
    let from = today - chrono::Duration::days(i64::from(days) - 1);
    let logs = svc.days(from, today)?;

    if json {
        return print_json(&logs);
    }
    if logs.is_empty() {
        eprintln!("No days logged in the last {days} days.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct DayRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Weight")]
        weight: String,
        #[tabled(rename = "Steps")]
        steps: String,
        #[tabled(rename = "Sleep")]
        sleep: String,
        #[tabled(rename = "Meals")]
        meals: usize,
        #[tabled(rename = "Cal")]
        calories: i64,
        #[tabled(rename = "Protein")]
        protein: String,
    }

    let rows: Vec<DayRow> = logs
        .iter()
        .map(|l| DayRow {
            date: display_date(l.date),
            weight: opt_f1(l.metrics.weight_kg),
            steps: opt(l.metrics.steps),
            sleep: opt_f1(l.metrics.sleep_hours),
            meals: l.meals.len(),
            calories: l.total_calories(),
            protein: format!("{:.0}", l.total_protein_g()),
        })
        .collect();
    print_table(&rows, Some(1..7));
    Ok(())
}
