use anyhow::{Result, bail};

use fitstat_core::models::{ActivityLevel, MeasurementSystem, ProfileUpdate};
use fitstat_core::service::FitstatService;

use super::helpers::{display_time, opt, opt_f1, print_json};

pub(crate) struct ProfileArgs {
    pub email: Option<String>,
    pub name: Option<String>,
    pub target_weight: Option<f64>,
    pub target_body_fat: Option<f64>,
    pub activity: Option<String>,
    pub units: Option<String>,
}

pub(crate) fn cmd_profile_show(svc: &FitstatService, json: bool) -> Result<()> {
    let Some(profile) = svc.profile()? else {
        if json {
            println!("{}", serde_json::json!({ "error": "No profile yet" }));
        } else {
            eprintln!("No profile yet. Use `fitstat profile set` to create one.");
        }
        return Ok(());
    };

    if json {
        return print_json(&profile);
    }

    let s = &profile.settings;
    println!("User:           {}", profile.id);
    println!("Name:           {}", profile.name);
    println!("Email:          {}", profile.email);
    println!("Target weight:  {} kg", opt_f1(s.target_weight_kg));
    println!("Target body fat: {} %", opt_f1(s.target_body_fat));
    println!(
        "Activity level: {}",
        opt(s.activity_level.map(|a| format!("{a:?}").to_lowercase()))
    );
    println!(
        "Units:          {}",
        opt(s.measurement_system.map(|m| format!("{m:?}").to_lowercase()))
    );
    println!("Updated:        {}", display_time(&profile.updated_at));
    Ok(())
}

pub(crate) fn cmd_profile_set(svc: &FitstatService, args: ProfileArgs, json: bool) -> Result<()> {
    let update = ProfileUpdate {
        email: args.email,
        name: args.name,
        target_weight_kg: args.target_weight,
        target_body_fat: args.target_body_fat,
        activity_level: args
            .activity
            .as_deref()
            .map(str::parse::<ActivityLevel>)
            .transpose()?,
        measurement_system: args
            .units
            .as_deref()
            .map(str::parse::<MeasurementSystem>)
            .transpose()?,
    };
    if let Some(w) = update.target_weight_kg
        && w <= 0.0
    {
        bail!("Target weight must be greater than 0");
    }
    if let Some(bf) = update.target_body_fat
        && !(0.0..=100.0).contains(&bf)
    {
        bail!("Target body fat must be between 0 and 100");
    }

    let profile = svc.update_profile(&update)?;
    if json {
        print_json(&profile)
    } else {
        println!("Profile updated for {}", profile.id);
        Ok(())
    }
}
