use anyhow::{Result, bail};
use tabled::Tabled;

use fitstat_core::models::{NewStrengthSet, parse_rep_list};
use fitstat_core::service::FitstatService;

use super::helpers::{display_date, opt, opt_f1, parse_date, print_json, print_table, short_id};

pub(crate) struct StrengthArgs {
    pub exercise: String,
    pub muscle_group: String,
    pub sets: u32,
    pub reps: u32,
    pub actual: Option<String>,
    pub rir: Option<u32>,
    pub tempo: Option<String>,
    pub avg_hr: Option<u32>,
    pub calories: Option<f64>,
    pub notes: Option<String>,
    pub date: Option<String>,
}

pub(crate) fn cmd_strength_log(svc: &FitstatService, args: StrengthArgs, json: bool) -> Result<()> {
    if args.sets == 0 || args.reps == 0 {
        bail!("Planned sets and reps must be at least 1");
    }
    let actual_reps = args
        .actual
        .as_deref()
        .map(parse_rep_list)
        .transpose()?
        .unwrap_or_default();
    let set = NewStrengthSet {
        date: parse_date(args.date)?,
        muscle_group: args.muscle_group,
        exercise: args.exercise,
        planned_sets: args.sets,
        planned_reps: args.reps,
        actual_reps,
        rir: args.rir,
        tempo: args.tempo,
        avg_hr: args.avg_hr,
        estimated_calories: args.calories,
        notes: args.notes,
    };
    let saved = svc.log_strength_set(&set)?;

    if json {
        print_json(&saved)
    } else {
        println!(
            "Planned {} {}x{} for {} [{}]",
            saved.exercise,
            saved.planned_sets,
            saved.planned_reps,
            display_date(saved.date),
            saved.id
        );
        Ok(())
    }
}

pub(crate) fn cmd_strength_reps(
    svc: &FitstatService,
    id: &str,
    reps: &str,
    rir: Option<u32>,
    json: bool,
) -> Result<()> {
    let reps = parse_rep_list(reps)?;
    if reps.is_empty() {
        bail!("Provide the reps of each set, e.g. 10,10,8");
    }
    let saved = svc.record_reps(id, reps, rir)?;

    if json {
        print_json(&saved)
    } else {
        let total: u32 = saved.actual_reps.iter().sum();
        println!(
            "Recorded {} sets ({total} reps) of {}",
            saved.actual_reps.len(),
            saved.exercise
        );
        Ok(())
    }
}

pub(crate) fn cmd_strength_list(svc: &FitstatService, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let sets = svc.strength_for(date)?;

    if json {
        return print_json(&sets);
    }
    if sets.is_empty() {
        eprintln!("No strength work logged for {}", display_date(date));
        return Ok(());
    }

    #[derive(Tabled)]
    struct SetRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Group")]
        group: String,
        #[tabled(rename = "Exercise")]
        exercise: String,
        #[tabled(rename = "Plan")]
        plan: String,
        #[tabled(rename = "Done")]
        done: String,
        #[tabled(rename = "RIR")]
        rir: String,
        #[tabled(rename = "Kcal")]
        calories: String,
    }

    let rows: Vec<SetRow> = sets
        .iter()
        .map(|s| SetRow {
            id: short_id(&s.id),
            group: s.muscle_group.clone(),
            exercise: s.exercise.clone(),
            plan: format!("{}x{}", s.planned_sets, s.planned_reps),
            done: s
                .actual_reps
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join("/"),
            rir: opt(s.rir),
            calories: opt_f1(s.estimated_calories),
        })
        .collect();
    print_table(&rows, Some(5..7));
    Ok(())
}
