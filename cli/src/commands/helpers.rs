use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use fitstat_core::models::{Timestamp, format_date};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// Weekday name or number (0 = Monday) to the stored day index.
pub(crate) fn parse_weekday(s: &str) -> Result<u8> {
    let day = match s.to_lowercase().as_str() {
        "mon" | "monday" => 0,
        "tue" | "tuesday" => 1,
        "wed" | "wednesday" => 2,
        "thu" | "thursday" => 3,
        "fri" | "friday" => 4,
        "sat" | "saturday" => 5,
        "sun" | "sunday" => 6,
        other => other
            .parse::<u8>()
            .with_context(|| format!("Invalid day '{s}'. Use monday-sunday or 0-6"))?,
    };
    fitstat_core::models::validate_day_of_week(day)?;
    Ok(day)
}

pub(crate) fn weekday_name(day: u8) -> &'static str {
    match day {
        0 => "Mon",
        1 => "Tue",
        2 => "Wed",
        3 => "Thu",
        4 => "Fri",
        5 => "Sat",
        _ => "Sun",
    }
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn print_table<R: Tabled>(rows: &[R], right_aligned: Option<std::ops::Range<usize>>) {
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    if let Some(cols) = right_aligned {
        table.with(Modify::new(Columns::new(cols)).with(Alignment::right()));
    }
    println!("{table}");
}

/// Local-time rendering of a stored UTC timestamp.
pub(crate) fn display_time(ts: &Timestamp) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

pub(crate) fn display_date(date: NaiveDate) -> String {
    format_date(date)
}

pub(crate) fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

pub(crate) fn opt_f1(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.1}", no_neg_zero(v)))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

/// First 8 characters of a generated id, enough to tell rows apart.
pub(crate) fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}
