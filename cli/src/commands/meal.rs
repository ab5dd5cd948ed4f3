use anyhow::{Result, bail};
use std::process;
use tabled::Tabled;

use fitstat_core::models::{MealType, NewMeal, UpdateMeal};
use fitstat_core::service::FitstatService;

use super::helpers::{display_date, parse_date, print_json, print_table, truncate};

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_meal_add(
    svc: &FitstatService,
    meal_type: &str,
    protein: f64,
    carbs: f64,
    fat: f64,
    note: Option<String>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let meal = NewMeal {
        meal_type: meal_type.parse::<MealType>()?,
        protein_g: protein,
        carbs_g: carbs,
        fat_g: fat,
        note,
    };
    let date = parse_date(date)?;
    let entry = svc.add_meal(date, &meal)?;

    if json {
        print_json(&entry)
    } else {
        println!(
            "Logged {} for {}: {} kcal (P:{:.0}g C:{:.0}g F:{:.0}g) [{}]",
            entry.meal_type,
            display_date(date),
            entry.calories,
            entry.protein_g,
            entry.carbs_g,
            entry.fat_g,
            entry.id
        );
        Ok(())
    }
}

/// `id` may be a unique prefix of the meal id, as printed by `meal list`.
pub(crate) fn cmd_meal_update(
    svc: &FitstatService,
    id: &str,
    update: &UpdateMeal,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    if update.meal_type.is_none()
        && update.protein_g.is_none()
        && update.carbs_g.is_none()
        && update.fat_g.is_none()
        && update.note.is_none()
    {
        bail!("Nothing to update. Provide at least one of --meal, --protein, --carbs, --fat, --note");
    }
    let date = parse_date(date)?;
    let meals = svc.meals(date)?;
    let matches: Vec<_> = meals.iter().filter(|m| m.id.starts_with(id)).collect();
    let full_id = match matches.as_slice() {
        [only] => only.id.clone(),
        [] => {
            eprintln!("Meal {id} not found on {}", display_date(date));
            process::exit(2);
        }
        _ => bail!("Meal id '{id}' is ambiguous, use more characters"),
    };

    let entry = svc.update_meal(date, &full_id, update)?;
    if json {
        print_json(&entry)
    } else {
        println!(
            "Updated {} meal on {}: {} kcal",
            entry.meal_type,
            display_date(date),
            entry.calories
        );
        Ok(())
    }
}

pub(crate) fn cmd_meal_list(svc: &FitstatService, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let meals = svc.meals(date)?;

    if json {
        return print_json(&meals);
    }
    if meals.is_empty() {
        eprintln!("No meals logged for {}", display_date(date));
        return Ok(());
    }

    #[derive(Tabled)]
    struct MealRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Cal")]
        calories: i64,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fat: String,
        #[tabled(rename = "Note")]
        note: String,
    }

    let rows: Vec<MealRow> = meals
        .iter()
        .map(|m| MealRow {
            id: m.id.chars().take(8).collect(),
            meal: m.meal_type.to_string(),
            calories: m.calories,
            protein: format!("{:.1}", m.protein_g),
            carbs: format!("{:.1}", m.carbs_g),
            fat: format!("{:.1}", m.fat_g),
            note: m.note.as_deref().map(|n| truncate(n, 30)).unwrap_or_default(),
        })
        .collect();
    print_table(&rows, Some(2..6));
    Ok(())
}
