use std::fmt::Display;
use time::macros::{datetime, format_description};
use time::{Duration, OffsetDateTime, PrimitiveDateTime, Time};

use super::error::TimeCalcError;

const SECONDS_PER_DAY: i64 = 86_400;

/// Local wall clock time, falling back to UTC when the offset cannot be determined
pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `YYYY-MM-DD HH:MM:SS` of the current local time, as written into logs and markers
pub fn log_timestamp() -> Result<String, time::error::Format> {
    now_local().format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
}

/// `YYYYMMDD-HHMMSS` of the current local time, used in generated file names
pub fn file_timestamp() -> Result<String, time::error::Format> {
    now_local().format(format_description!(
        "[year][month][day]-[hour][minute][second]"
    ))
}

/// Parse `H:M:S` into seconds. Hours are not limited to a day.
pub fn parse_clock(value: &str) -> Result<i64, TimeCalcError> {
    let bad = || TimeCalcError::BadClock(value.to_string());
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(bad());
    }
    let mut fields = [0i64; 3];
    for (field, part) in fields.iter_mut().zip(parts) {
        *field = part.parse().map_err(|_| bad())?;
        if *field < 0 {
            return Err(bad());
        }
    }
    if fields[1] > 59 || fields[2] > 59 {
        return Err(bad());
    }
    Ok(fields[0] * 3600 + fields[1] * 60 + fields[2])
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordWindow {
    pub start_time: Time,
    pub start_record: i64,
    pub end_time: Time,
    pub end_record: i64,
}

impl Display for RecordWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let clock = |t: &Time| format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second());
        writeln!(
            f,
            "Adjusted Start Time: {} -> Record #{}",
            clock(&self.start_time),
            self.start_record
        )?;
        write!(
            f,
            "Adjusted End Time:   {} -> Record #{}",
            clock(&self.end_time),
            self.end_record
        )
    }
}

/// Data record range covering a wall-clock window, widened by `pre_minutes` before and
/// `post_minutes` after. Window times earlier than the recording start are taken to be
/// on the following day.
pub fn compute_record_indices(
    total_records: u64,
    total_duration: &str,
    recording_start: &str,
    target_start: &str,
    target_end: &str,
    pre_minutes: i64,
    post_minutes: i64,
) -> Result<RecordWindow, TimeCalcError> {
    let duration = parse_clock(total_duration)?;
    if duration <= 0 {
        return Err(TimeCalcError::ZeroDuration);
    }
    let recording_start = parse_clock(recording_start)?;
    let records_per_second = total_records as f64 / duration as f64;

    let mut adjusted_start = parse_clock(target_start)? - pre_minutes * 60;
    let mut adjusted_end = parse_clock(target_end)? + post_minutes * 60;
    if adjusted_start < recording_start {
        adjusted_start += SECONDS_PER_DAY;
    }
    if adjusted_end < recording_start {
        adjusted_end += SECONDS_PER_DAY;
    }
    let from_start = adjusted_start - recording_start;
    let from_end = adjusted_end - recording_start;

    let base = Time::MIDNIGHT + Duration::seconds(recording_start);
    Ok(RecordWindow {
        start_time: base + Duration::seconds(from_start),
        start_record: (from_start as f64 * records_per_second).round() as i64,
        end_time: base + Duration::seconds(from_end),
        end_record: (from_end as f64 * records_per_second).round() as i64 - 1,
    })
}

/// Convert a spreadsheet serial date (days since 1899-12-30) to a date and time
pub fn serial_to_datetime(serial: f64) -> Result<PrimitiveDateTime, TimeCalcError> {
    // beyond year 9999 either way
    if !serial.is_finite() || serial.abs() > 3.0e6 {
        return Err(TimeCalcError::BadSerial(serial));
    }
    let millis = (serial * (SECONDS_PER_DAY * 1000) as f64).round() as i64;
    datetime!(1899-12-30 0:00)
        .checked_add(Duration::milliseconds(millis))
        .ok_or(TimeCalcError::BadSerial(serial))
}

/// Render as `dd Mon YYYY HH:MM:SS`
pub fn format_serial_datetime(value: &PrimitiveDateTime) -> Result<String, TimeCalcError> {
    Ok(value.format(format_description!(
        "[day] [month repr:short] [year] [hour]:[minute]:[second]"
    ))?)
}
