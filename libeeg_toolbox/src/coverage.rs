use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{Date, Duration};

use super::constants::MIN_DAILY_HOURS;
use super::error::CoverageError;
use super::timecalc::log_timestamp;

/// One row of a BIDS `scans.tsv`; `duration` is in hours
#[derive(Debug, Clone, Deserialize)]
struct ScanEntry {
    filename: String,
    acq_time: String,
    duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayStatus {
    Complete,
    /// First or last day below the minimum, expected when a stay starts or ends mid-day
    ShortEdge,
    Short,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayCoverage {
    pub date: Date,
    pub hours: f64,
    pub files: Vec<String>,
    pub status: DayStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReport {
    pub first_day: Date,
    pub last_day: Date,
    pub days: Vec<DayCoverage>,
}

impl CoverageReport {
    pub fn missing_days(&self) -> Vec<Date> {
        self.days
            .iter()
            .filter(|d| d.status == DayStatus::Missing)
            .map(|d| d.date)
            .collect()
    }

    pub fn multiple_sessions(&self) -> Vec<&DayCoverage> {
        self.days.iter().filter(|d| d.files.len() > 1).collect()
    }
}

/// Calendar date of an ISO-like acquisition time (`YYYY-MM-DDTHH:MM:SS[.f]` or with a space)
fn acquisition_date(acq_time: &str) -> Result<Date, CoverageError> {
    let bad = || CoverageError::BadAcqTime(acq_time.to_string());
    let value = acq_time.trim();
    let (date, clock) = value.split_once(['T', ' ']).unwrap_or((value, ""));
    let date = Date::parse(date, format_description!("[year]-[month]-[day]")).map_err(|_| bad())?;
    if !clock.is_empty() {
        let clock = clock.split('.').next().unwrap_or_default();
        time::Time::parse(clock, format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| bad())?;
    }
    Ok(date)
}

pub fn analyze_scans(tsv: &Path) -> Result<CoverageReport, CoverageError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(tsv)?;
    let mut by_date: BTreeMap<Date, (f64, Vec<String>)> = BTreeMap::new();
    for row in reader.deserialize() {
        let row: ScanEntry = row?;
        let day = by_date.entry(acquisition_date(&row.acq_time)?).or_default();
        day.0 += row.duration;
        day.1.push(row.filename);
    }

    let (Some(first_day), Some(last_day)) = (
        by_date.keys().next().copied(),
        by_date.keys().next_back().copied(),
    ) else {
        return Err(CoverageError::NoSessions(tsv.to_path_buf()));
    };

    let mut days = Vec::new();
    let mut date = first_day;
    while date <= last_day {
        let day = match by_date.remove(&date) {
            None => DayCoverage {
                date,
                hours: 0.0,
                files: Vec::new(),
                status: DayStatus::Missing,
            },
            Some((hours, files)) => {
                let status = if hours >= MIN_DAILY_HOURS {
                    DayStatus::Complete
                } else if date == first_day || date == last_day {
                    DayStatus::ShortEdge
                } else {
                    DayStatus::Short
                };
                DayCoverage {
                    date,
                    hours,
                    files,
                    status,
                }
            }
        };
        days.push(day);
        date += Duration::days(1);
    }

    Ok(CoverageReport {
        first_day,
        last_day,
        days,
    })
}

/// Appends `[timestamp] message` lines to a log file as well as the regular log
struct CoverageLog {
    path: PathBuf,
}

impl CoverageLog {
    fn line(&self, message: &str) -> Result<(), CoverageError> {
        let entry = format!("[{}] {message}", log_timestamp()?);
        log::info!("{message}");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{entry}")?;
        Ok(())
    }
}

/// Check that every day between the first and last session of `tsv` has a full day of
/// recordings, writing findings to `log_file` (appended, never overwritten).
pub fn check_durations(tsv: &Path, log_file: &Path) -> Result<CoverageReport, CoverageError> {
    let report = analyze_scans(tsv)?;
    let out = CoverageLog {
        path: log_file.to_path_buf(),
    };

    out.line(&format!("Processing file: {}", tsv.display()))?;
    out.line(&format!(
        "Checking data from {} to {}...",
        report.first_day, report.last_day
    ))?;

    let missing = report.missing_days();
    if missing.is_empty() {
        out.line("Perfect! No missing days found!")?;
    } else {
        out.line("ERROR: The following dates are completely missing:")?;
        for date in missing {
            out.line(&format!("  - {date}"))?;
        }
    }

    let multiple = report.multiple_sessions();
    if !multiple.is_empty() {
        out.line("INFO: Days with multiple sessions recorded:")?;
        for day in multiple {
            out.line(&format!("  - {}: {} sessions", day.date, day.files.len()))?;
            out.line(&format!("    Files: {}", day.files.join(", ")))?;
        }
    }

    for day in report.days.iter() {
        let files = day.files.join(", ");
        match day.status {
            DayStatus::Missing => out.line(&format!(
                "ERROR: Missing data for {}. No recordings found.",
                day.date
            ))?,
            DayStatus::ShortEdge => {
                out.line(&format!(
                    "WARNING: First/Last day {} has only {:.2} hours recorded.",
                    day.date, day.hours
                ))?;
                out.line(&format!("    Files: {files}"))?;
            }
            DayStatus::Short => {
                out.line(&format!(
                    "ERROR: Day {} has only {:.2} hours recorded.",
                    day.date, day.hours
                ))?;
                out.line(&format!("    Files: {files}"))?;
            }
            DayStatus::Complete => {
                if day.date != report.first_day && day.date != report.last_day {
                    out.line(&format!("All good for Day {}!!!", day.date))?;
                    out.line(&format!("    Files: {files}"))?;
                }
            }
        }
    }

    out.line(&format!(
        "Check completed. There are a total of {} days in the dataset.",
        report.days.len()
    ))?;
    Ok(report)
}
