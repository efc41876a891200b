//! Trailing time-window selection over timestamp-encoded object names.

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use thiserror::Error;

const TIMESTAMP_SEGMENTS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("object name '{name}' has fewer than six timestamp segments")]
    TooFewSegments { name: String },
    #[error("object name '{name}' has non-numeric {field} segment '{value}'")]
    InvalidSegment {
        name: String,
        field: &'static str,
        value: String,
    },
    #[error("object name '{name}' does not encode a valid date and time")]
    InvalidDateTime { name: String },
}

/// Parses `.../year/month/day/hour/minute/second.ext` into a timestamp.
///
/// Only the last six segments are read; the extension on the seconds
/// segment is stripped.
pub fn parse_object_timestamp(name: &str) -> Result<NaiveDateTime, WindowError> {
    let segments: Vec<&str> = name.split('/').collect();
    if segments.len() < TIMESTAMP_SEGMENTS {
        return Err(WindowError::TooFewSegments {
            name: name.to_string(),
        });
    }
    let tail = &segments[segments.len() - TIMESTAMP_SEGMENTS..];
    let second_raw = tail[5].split('.').next().unwrap_or_default();

    let field = |field: &'static str, raw: &str| -> Result<u32, WindowError> {
        raw.parse::<u32>().map_err(|_| WindowError::InvalidSegment {
            name: name.to_string(),
            field,
            value: raw.to_string(),
        })
    };

    let year = field("year", tail[0])?;
    let month = field("month", tail[1])?;
    let day = field("day", tail[2])?;
    let hour = field("hour", tail[3])?;
    let minute = field("minute", tail[4])?;
    let second = field("second", second_raw)?;

    i32::try_from(year)
        .ok()
        .and_then(|year| NaiveDate::from_ymd_opt(year, month, day))
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .ok_or_else(|| WindowError::InvalidDateTime {
            name: name.to_string(),
        })
}

/// Keeps the names whose encoded timestamp is at most `delta_hours` before
/// `now` (inclusive). Relative order is preserved; `None` keeps everything.
pub fn select_window(
    names: &[String],
    delta_hours: Option<u32>,
    now: NaiveDateTime,
) -> Result<Vec<String>, WindowError> {
    let Some(delta_hours) = delta_hours else {
        return Ok(names.to_vec());
    };
    let bound = ChronoDuration::hours(i64::from(delta_hours));

    let mut selected = Vec::new();
    for name in names {
        let ts = parse_object_timestamp(name)?;
        if now - ts <= bound {
            selected.push(name.clone());
        }
    }
    Ok(selected)
}
