/// `geoflow period` command implementation
use anyhow::{Context, Result};

use geoflow::period::{merge, Period};

use crate::cli::PeriodCommands;

pub fn run(command: &PeriodCommands) -> Result<()> {
    match command {
        PeriodCommands::Parse { period } => parse(period),
        PeriodCommands::Merge {
            periods,
            calendar_360,
        } => merge_periods(periods, *calendar_360),
    }
}

fn parse(text: &str) -> Result<()> {
    let period = Period::parse(text).with_context(|| format!("Invalid period: {}", text))?;

    println!("Period: {}", period);
    match period.to_iso_range() {
        Some(range) => {
            let (first, last) = range.split_once(',').unwrap_or((range.as_str(), ""));
            println!("First: {}", first);
            println!("Last: {}", last);
        }
        None => println!("Fixed (time-independent)"),
    }

    Ok(())
}

fn merge_periods(texts: &[String], calendar_360: bool) -> Result<()> {
    let periods = texts
        .iter()
        .map(|text| Period::parse(text).with_context(|| format!("Invalid period: {}", text)))
        .collect::<Result<Vec<_>>>()?;

    for period in merge(&periods, calendar_360) {
        println!("{}", period);
    }

    Ok(())
}
