mod commands;
mod config;
mod postgrest;
mod server;

use std::process;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    App, PhaseArgs, ProfileArgs, RoutineArgs, StrengthArgs, WatchArgs, cmd_cardio_list,
    cmd_cardio_log, cmd_day_history, cmd_day_log, cmd_day_show, cmd_meal_add, cmd_meal_list,
    cmd_meal_update, cmd_phase_add, cmd_phase_list, cmd_profile_set, cmd_profile_show,
    cmd_routine_add, cmd_routine_list, cmd_status, cmd_strength_list, cmd_strength_log,
    cmd_strength_reps, cmd_sync, cmd_user_clear, cmd_user_set, cmd_user_show, cmd_watch,
};
use crate::config::Config;
use fitstat_core::clock::SystemClock;
use fitstat_core::models::{DailyMetrics, MealType, UpdateMeal};
use fitstat_core::tables::TableStore;

#[derive(Parser)]
#[command(
    name = "fitstat",
    version,
    about = "An offline-first health tracker",
    long_about = "Track meals, body metrics, strength and cardio work on this machine. \
                  Changes are stored locally first and synced to a remote store when \
                  one is reachable."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Choose which user's records to work with
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Show or edit the user's profile and targets
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Daily body metrics
    Day {
        #[command(subcommand)]
        command: DayCommands,
    },
    /// Meals with macros
    Meal {
        #[command(subcommand)]
        command: MealCommands,
    },
    /// Strength training sets
    Strength {
        #[command(subcommand)]
        command: StrengthCommands,
    },
    /// Cardio sessions
    Cardio {
        #[command(subcommand)]
        command: CardioCommands,
    },
    /// Training protocol phases and weekly routines
    Protocol {
        #[command(subcommand)]
        command: ProtocolCommands,
    },
    /// Show connectivity, last sync and pending changes
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a sync pass now
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing in the foreground until interrupted
    Watch {
        /// Seconds to wait after the last change before syncing
        #[arg(long, default_value = "2")]
        debounce: u64,
        /// Seconds between periodic syncs
        #[arg(long, default_value = "300")]
        interval: u64,
        /// Seconds to wait before retrying a failed sync
        #[arg(long, default_value = "10")]
        retry: u64,
        /// Seconds between connectivity probes
        #[arg(long, default_value = "15")]
        probe: u64,
    },
    /// Serve a remote store over HTTP for other devices to sync against
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Sign in as a user id
    Set {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Print the signed-in user
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Sign out
    Clear {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Create or update the profile
    Set {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Target weight in kg
        #[arg(long)]
        target_weight: Option<f64>,
        /// Target body fat percentage
        #[arg(long)]
        target_body_fat: Option<f64>,
        /// sedentary, light, moderate, active, very-active
        #[arg(long)]
        activity: Option<String>,
        /// metric or imperial
        #[arg(long)]
        units: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DayCommands {
    /// Record metrics for a day; fields left out keep their value
    Log {
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        weight: Option<f64>,
        #[arg(long)]
        water: Option<i64>,
        #[arg(long)]
        steps: Option<i64>,
        #[arg(long)]
        sleep: Option<f64>,
        /// Whether training was done (true or false)
        #[arg(long)]
        trained: Option<bool>,
        #[arg(long)]
        training_type: Option<String>,
        #[arg(long)]
        training_calories: Option<f64>,
        #[arg(long)]
        training_hr: Option<i64>,
        #[arg(long)]
        walk_km: Option<f64>,
        #[arg(long)]
        walk_min: Option<f64>,
        #[arg(long)]
        walk_hr: Option<i64>,
        #[arg(long)]
        walk_calories: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show everything logged for a day
    Show {
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// One line per day for the last N days
    History {
        #[arg(short, long, default_value = "7")]
        days: u32,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MealCommands {
    /// Log a meal
    Add {
        /// Macros in grams
        #[arg(short, long)]
        protein: f64,
        #[arg(short, long)]
        carbs: f64,
        #[arg(short, long)]
        fat: f64,
        /// Meal type: breakfast, lunch, dinner, snack
        #[arg(short, long, default_value = "snack")]
        meal: String,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Change a logged meal
    Update {
        /// Meal id or a unique prefix of it
        id: String,
        #[arg(long)]
        meal: Option<String>,
        #[arg(long)]
        protein: Option<f64>,
        #[arg(long)]
        carbs: Option<f64>,
        #[arg(long)]
        fat: Option<f64>,
        #[arg(long)]
        note: Option<String>,
        /// Date the meal was logged on (default: today)
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
    List {
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum StrengthCommands {
    /// Plan or log an exercise
    Log {
        exercise: String,
        /// Muscle group, e.g. legs, chest, back
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        sets: u32,
        #[arg(short, long)]
        reps: u32,
        /// Reps done per set, e.g. 10,10,8
        #[arg(long)]
        actual: Option<String>,
        /// Reps in reserve
        #[arg(long)]
        rir: Option<u32>,
        #[arg(long)]
        tempo: Option<String>,
        #[arg(long)]
        avg_hr: Option<u32>,
        #[arg(long)]
        calories: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Record the reps done for a planned exercise
    Reps {
        id: String,
        /// Reps per set, e.g. 10,10,8
        reps: String,
        #[arg(long)]
        rir: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    List {
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CardioCommands {
    /// Log a cardio session
    Log {
        /// Activity, e.g. run, bike, row
        activity: String,
        /// Duration in minutes
        minutes: f64,
        #[arg(long)]
        km: Option<f64>,
        #[arg(long)]
        calories: Option<f64>,
        #[arg(long)]
        avg_hr: Option<u32>,
        #[arg(long)]
        max_hr: Option<u32>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
    List {
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProtocolCommands {
    /// Add a training phase
    PhaseAdd {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Start date (default: today)
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Make this the active phase
        #[arg(long)]
        active: bool,
        #[arg(long)]
        json: bool,
    },
    /// List phases, newest first
    Phases {
        #[arg(long)]
        json: bool,
    },
    /// Add an exercise to a phase's weekly routine
    RoutineAdd {
        /// Day of week, e.g. mon, tuesday, 0-6
        day: String,
        exercise: String,
        #[arg(short, long)]
        sets: u32,
        #[arg(short, long)]
        reps: u32,
        /// Fraction of max, 0 to 1
        #[arg(short, long, default_value = "0.75")]
        intensity: f64,
        /// Rest between sets in minutes
        #[arg(long, default_value = "2")]
        rest: f64,
        /// Phase id (default: the active phase)
        #[arg(long)]
        phase: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show a phase's weekly routine
    Routines {
        /// Phase id (default: the active phase)
        #[arg(long)]
        phase: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.command);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(command: &Commands) {
    let default = match command {
        Commands::Watch { .. } | Commands::Serve { .. } => "info",
        _ => "warn",
    };
    let filter =
        EnvFilter::try_from_env("FITSTAT_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => serve(&config, port, &bind, no_auth).await,
        command => dispatch(App::open(&config)?, command).await,
    }
}

async fn serve(config: &Config, port: u16, bind: &str, no_auth: bool) -> Result<()> {
    let api_key = if no_auth {
        None
    } else {
        let (key, new) = config.load_or_create_api_key()?;
        if new {
            eprintln!("Generated a new API key. Clients need it in FITSTAT_API_KEY:\n  {key}");
        }
        Some(key)
    };
    let tables = TableStore::open(&config.remote_db_path)?;
    server::start_server(tables, Arc::new(SystemClock), port, bind, api_key).await
}

#[allow(clippy::too_many_lines)]
async fn dispatch(app: App, command: Commands) -> Result<()> {
    match command {
        Commands::User { command } => match command {
            UserCommands::Set { id, json } => cmd_user_set(&app, &id, json),
            UserCommands::Show { json } => cmd_user_show(&app, json),
            UserCommands::Clear { json } => cmd_user_clear(&app, json),
        },
        Commands::Profile { command } => {
            let svc = app.service()?;
            match command {
                ProfileCommands::Show { json } => cmd_profile_show(&svc, json),
                ProfileCommands::Set {
                    email,
                    name,
                    target_weight,
                    target_body_fat,
                    activity,
                    units,
                    json,
                } => cmd_profile_set(
                    &svc,
                    ProfileArgs {
                        email,
                        name,
                        target_weight,
                        target_body_fat,
                        activity,
                        units,
                    },
                    json,
                ),
            }
        }
        Commands::Day { command } => {
            let svc = app.service()?;
            match command {
                DayCommands::Log {
                    date,
                    weight,
                    water,
                    steps,
                    sleep,
                    trained,
                    training_type,
                    training_calories,
                    training_hr,
                    walk_km,
                    walk_min,
                    walk_hr,
                    walk_calories,
                    notes,
                    json,
                } => {
                    let metrics = DailyMetrics {
                        weight_kg: weight,
                        water_ml: water,
                        steps,
                        sleep_hours: sleep,
                        training_done: trained,
                        training_type,
                        training_calories,
                        training_avg_hr: training_hr,
                        walk_distance_km: walk_km,
                        walk_duration_min: walk_min,
                        walk_avg_hr: walk_hr,
                        walk_calories,
                        notes,
                    };
                    cmd_day_log(&svc, date, &metrics, json)
                }
                DayCommands::Show { date, json } => cmd_day_show(&svc, date, json),
                DayCommands::History { days, json } => cmd_day_history(&svc, days, json),
            }
        }
        Commands::Meal { command } => {
            let svc = app.service()?;
            match command {
                MealCommands::Add {
                    protein,
                    carbs,
                    fat,
                    meal,
                    note,
                    date,
                    json,
                } => cmd_meal_add(&svc, &meal, protein, carbs, fat, note, date, json),
                MealCommands::Update {
                    id,
                    meal,
                    protein,
                    carbs,
                    fat,
                    note,
                    date,
                    json,
                } => {
                    let update = UpdateMeal {
                        meal_type: meal.as_deref().map(str::parse::<MealType>).transpose()?,
                        protein_g: protein,
                        carbs_g: carbs,
                        fat_g: fat,
                        note,
                    };
                    cmd_meal_update(&svc, &id, &update, date, json)
                }
                MealCommands::List { date, json } => cmd_meal_list(&svc, date, json),
            }
        }
        Commands::Strength { command } => {
            let svc = app.service()?;
            match command {
                StrengthCommands::Log {
                    exercise,
                    group,
                    sets,
                    reps,
                    actual,
                    rir,
                    tempo,
                    avg_hr,
                    calories,
                    notes,
                    date,
                    json,
                } => cmd_strength_log(
                    &svc,
                    StrengthArgs {
                        exercise,
                        muscle_group: group,
                        sets,
                        reps,
                        actual,
                        rir,
                        tempo,
                        avg_hr,
                        calories,
                        notes,
                        date,
                    },
                    json,
                ),
                StrengthCommands::Reps {
                    id,
                    reps,
                    rir,
                    json,
                } => cmd_strength_reps(&svc, &id, &reps, rir, json),
                StrengthCommands::List { date, json } => cmd_strength_list(&svc, date, json),
            }
        }
        Commands::Cardio { command } => {
            let svc = app.service()?;
            match command {
                CardioCommands::Log {
                    activity,
                    minutes,
                    km,
                    calories,
                    avg_hr,
                    max_hr,
                    notes,
                    date,
                    json,
                } => cmd_cardio_log(
                    &svc, &activity, minutes, km, calories, avg_hr, max_hr, notes, date, json,
                ),
                CardioCommands::List { date, json } => cmd_cardio_list(&svc, date, json),
            }
        }
        Commands::Protocol { command } => {
            let svc = app.service()?;
            match command {
                ProtocolCommands::PhaseAdd {
                    name,
                    description,
                    start,
                    end,
                    active,
                    json,
                } => cmd_phase_add(
                    &svc,
                    PhaseArgs {
                        name,
                        description,
                        start,
                        end,
                        active,
                    },
                    json,
                ),
                ProtocolCommands::Phases { json } => cmd_phase_list(&svc, json),
                ProtocolCommands::RoutineAdd {
                    day,
                    exercise,
                    sets,
                    reps,
                    intensity,
                    rest,
                    phase,
                    notes,
                    json,
                } => cmd_routine_add(
                    &svc,
                    RoutineArgs {
                        phase,
                        day,
                        exercise,
                        sets,
                        reps,
                        intensity,
                        rest,
                        notes,
                    },
                    json,
                ),
                ProtocolCommands::Routines { phase, json } => cmd_routine_list(&svc, phase, json),
            }
        }
        Commands::Status { json } => cmd_status(&app, json).await,
        Commands::Sync { json } => cmd_sync(&app, json).await,
        Commands::Watch {
            debounce,
            interval,
            retry,
            probe,
        } => {
            cmd_watch(
                app,
                WatchArgs {
                    debounce_secs: debounce,
                    interval_secs: interval,
                    retry_secs: retry,
                    probe_secs: probe,
                },
            )
            .await
        }
        Commands::Serve { .. } => bail!("serve does not open the local store"),
    }
}
