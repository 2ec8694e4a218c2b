//! Line-oriented timing file import.
//!
//! Each line holds one crossing as `competitor_id,HH:MM:SS`. The time of
//! day is placed on a given date to produce an epoch timestamp. Lines that
//! cannot be parsed are logged and skipped.

use crate::protocol::Crossing;
use crate::race::CompetitorId;
use chrono::{Local, NaiveDate, NaiveTime, TimeZone};
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, warn};

const TIME_FORMAT: &str = "%H:%M:%S";

/// Reasons a line is skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    /// Not exactly two comma-separated fields
    FieldCount(usize),
    /// First field is not an integer
    InvalidId(String),
    /// Second field is not `HH:MM:SS`
    InvalidTime(String),
    /// Time does not map to a single instant on that date (DST gap/overlap)
    AmbiguousTime(NaiveTime),
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineError::FieldCount(n) => write!(f, "expected 2 fields, found {}", n),
            LineError::InvalidId(id) => write!(f, "invalid competitor id '{}'", id),
            LineError::InvalidTime(time) => write!(f, "invalid time '{}'", time),
            LineError::AmbiguousTime(time) => write!(f, "time {} is not unique on this date", time),
        }
    }
}

impl std::error::Error for LineError {}

/// Parse one `competitor_id,HH:MM:SS` line
pub fn parse_line<Tz: TimeZone>(
    line: &str,
    date: NaiveDate,
    tz: &Tz,
) -> Result<Crossing, LineError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let &[id, time] = fields.as_slice() else {
        return Err(LineError::FieldCount(fields.len()));
    };

    let competitor_id: CompetitorId = id
        .parse()
        .map_err(|_| LineError::InvalidId(id.to_string()))?;
    let time_of_day = NaiveTime::parse_from_str(time, TIME_FORMAT)
        .map_err(|_| LineError::InvalidTime(time.to_string()))?;
    let instant = tz
        .from_local_datetime(&date.and_time(time_of_day))
        .single()
        .ok_or(LineError::AmbiguousTime(time_of_day))?;

    Ok(Crossing::new(competitor_id, instant.timestamp_millis()))
}

/// Parse every line from `reader`, keeping file order
pub fn parse_timing_data<R: BufRead, Tz: TimeZone>(
    reader: R,
    date: NaiveDate,
    tz: &Tz,
) -> std::io::Result<Vec<Crossing>> {
    let mut crossings = Vec::new();
    let mut skipped = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(&line, date, tz) {
            Ok(crossing) => crossings.push(crossing),
            Err(e) => {
                skipped += 1;
                warn!(line_number = index + 1, line = %line, error = %e, "Skipping invalid timing line");
            }
        }
    }

    debug!(valid = crossings.len(), skipped, "Parsed timing data");
    Ok(crossings)
}

/// Read a timing file, placing every time on today's local date
pub fn read_timing_file(path: &Path) -> std::io::Result<Vec<Crossing>> {
    let file = std::fs::File::open(path)?;
    let today = Local::now().date_naive();
    parse_timing_data(std::io::BufReader::new(file), today, &Local)
}
