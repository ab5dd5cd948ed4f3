use anyhow::{Result, bail};
use tabled::Tabled;

use fitstat_core::models::{NewProtocolPhase, NewProtocolRoutine};
use fitstat_core::service::FitstatService;

use super::helpers::{
    display_date, opt, parse_date, parse_weekday, print_json, print_table, truncate, weekday_name,
};

pub(crate) struct PhaseArgs {
    pub name: String,
    pub description: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub active: bool,
}

pub(crate) struct RoutineArgs {
    pub phase: Option<String>,
    pub day: String,
    pub exercise: String,
    pub sets: u32,
    pub reps: u32,
    pub intensity: f64,
    pub rest: f64,
    pub notes: Option<String>,
}

pub(crate) fn cmd_phase_add(svc: &FitstatService, args: PhaseArgs, json: bool) -> Result<()> {
    if args.name.trim().is_empty() {
        bail!("Phase name cannot be empty");
    }
    let phase = NewProtocolPhase {
        name: args.name,
        description: args.description,
        start_date: parse_date(args.start)?,
        end_date: args.end.map(Some).map(parse_date).transpose()?,
        is_active: args.active,
    };
    let saved = svc.save_phase(&phase)?;

    if json {
        print_json(&saved)
    } else {
        let active = if saved.is_active { " (active)" } else { "" };
        println!("Created phase {}{active} [{}]", saved.name, saved.id);
        Ok(())
    }
}

pub(crate) fn cmd_phase_list(svc: &FitstatService, json: bool) -> Result<()> {
    let phases = svc.phases()?;

    if json {
        return print_json(&phases);
    }
    if phases.is_empty() {
        eprintln!("No protocol phases. Use `fitstat protocol phase-add` to create one.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct PhaseRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Start")]
        start: String,
        #[tabled(rename = "End")]
        end: String,
        #[tabled(rename = "Active")]
        active: String,
        #[tabled(rename = "Description")]
        description: String,
    }

    let rows: Vec<PhaseRow> = phases
        .iter()
        .map(|p| PhaseRow {
            id: p.id.clone(),
            name: p.name.clone(),
            start: display_date(p.start_date),
            end: opt(p.end_date.map(display_date)),
            active: if p.is_active { "*".to_string() } else { String::new() },
            description: p
                .description
                .as_deref()
                .map(|d| truncate(d, 40))
                .unwrap_or_default(),
        })
        .collect();
    print_table(&rows, None);
    Ok(())
}

/// Without `--phase` the routine goes into the active phase.
pub(crate) fn cmd_routine_add(svc: &FitstatService, args: RoutineArgs, json: bool) -> Result<()> {
    let phase_id = resolve_phase(svc, args.phase)?;
    if !(0.0..=1.0).contains(&args.intensity) {
        bail!("Intensity is a fraction of max between 0 and 1");
    }
    let routine = NewProtocolRoutine {
        phase_id,
        day_of_week: parse_weekday(&args.day)?,
        exercise: args.exercise,
        sets: args.sets,
        reps: args.reps,
        intensity: args.intensity,
        rest_minutes: args.rest,
        notes: args.notes,
    };
    let saved = svc.save_routine(&routine)?;

    if json {
        print_json(&saved)
    } else {
        println!(
            "Added {} {}x{} on {} [{}]",
            saved.exercise,
            saved.sets,
            saved.reps,
            weekday_name(saved.day_of_week),
            saved.id
        );
        Ok(())
    }
}

pub(crate) fn cmd_routine_list(
    svc: &FitstatService,
    phase: Option<String>,
    json: bool,
) -> Result<()> {
    let phase_id = resolve_phase(svc, phase)?;
    let routines = svc.routines_for(&phase_id)?;

    if json {
        return print_json(&routines);
    }
    if routines.is_empty() {
        eprintln!("No routines in phase {phase_id}");
        return Ok(());
    }

    #[derive(Tabled)]
    struct RoutineRow {
        #[tabled(rename = "Day")]
        day: &'static str,
        #[tabled(rename = "Exercise")]
        exercise: String,
        #[tabled(rename = "Sets")]
        sets: u32,
        #[tabled(rename = "Reps")]
        reps: u32,
        #[tabled(rename = "Intensity")]
        intensity: String,
        #[tabled(rename = "Rest")]
        rest: String,
    }

    let rows: Vec<RoutineRow> = routines
        .iter()
        .map(|r| RoutineRow {
            day: weekday_name(r.day_of_week),
            exercise: r.exercise.clone(),
            sets: r.sets,
            reps: r.reps,
            intensity: format!("{:.0}%", r.intensity * 100.0),
            rest: format!("{:.1} min", r.rest_minutes),
        })
        .collect();
    print_table(&rows, Some(2..6));
    Ok(())
}

fn resolve_phase(svc: &FitstatService, phase: Option<String>) -> Result<String> {
    if let Some(id) = phase {
        return Ok(id);
    }
    match svc.active_phase()? {
        Some(active) => Ok(active.id),
        None => bail!("No active phase. Pass --phase <id> or activate a phase"),
    }
}
