//! Per-record feature extraction from raw sensor batches.
//!
//! Two encodings coexist: `Calendar` keeps the parsed timestamp and its
//! calendar fields (this is what the minute-bucket aggregation consumes);
//! `Cyclical` replaces time with sin/cos of day-of-year and second-of-day.

use std::f64::consts::PI;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::records::{DecodeError, EnvelopeRecord, RawRecord, RecordDecoder, RAW_TIMESTAMP_FORMAT};

/// Denominator for the day-of-year angle, independent of leap years.
pub const DAYS_IN_YEAR: f64 = 366.0;
pub const SECONDS_IN_DAY: f64 = 86_400.0;

pub const CALENDAR_COLUMNS: [&str; 10] = [
    "timestamp",
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "second",
    "power_usage",
    "voltage",
    "current",
];

pub const CYCLICAL_COLUMNS: [&str; 7] = [
    "sin_day_of_year",
    "cos_day_of_year",
    "sin_second_of_day",
    "cos_second_of_day",
    "power_usage",
    "voltage",
    "current",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureEncoding {
    Calendar,
    Cyclical,
}

impl FeatureEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::Cyclical => "cyclical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "calendar" => Some(Self::Calendar),
            "cyclical" => Some(Self::Cyclical),
            _ => None,
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Calendar => &CALENDAR_COLUMNS,
            Self::Cyclical => &CYCLICAL_COLUMNS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarFeatures {
    pub timestamp: NaiveDateTime,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub power_usage: f64,
    pub voltage: f64,
    pub current: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CyclicalFeatures {
    pub sin_day_of_year: f64,
    pub cos_day_of_year: f64,
    pub sin_second_of_day: f64,
    pub cos_second_of_day: f64,
    pub power_usage: f64,
    pub voltage: f64,
    pub current: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureRow {
    Calendar(CalendarFeatures),
    Cyclical(CyclicalFeatures),
}

impl FeatureRow {
    pub fn encoding(&self) -> FeatureEncoding {
        match self {
            Self::Calendar(_) => FeatureEncoding::Calendar,
            Self::Cyclical(_) => FeatureEncoding::Cyclical,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub objects_read: u64,
    pub records_read: u64,
    pub records_without_body: u64,
    pub feature_rows: u64,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("failed to decode object '{object}': {source}")]
    Decode {
        object: String,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}

pub fn parse_raw_timestamp(raw: &str) -> Result<NaiveDateTime, DecodeError> {
    NaiveDateTime::parse_from_str(raw.trim(), RAW_TIMESTAMP_FORMAT).map_err(|_| {
        DecodeError::Timestamp {
            value: raw.to_string(),
        }
    })
}

/// Extracts one feature row from a decoded envelope record.
///
/// `Ok(None)` means the record carries no payload and must be skipped.
/// Malformed payloads and timestamps are errors.
pub fn extract_features(
    record: &EnvelopeRecord,
    encoding: FeatureEncoding,
) -> Result<Option<FeatureRow>, DecodeError> {
    let Some(body) = record.body_bytes()? else {
        return Ok(None);
    };
    let raw = RawRecord::from_payload(&body)?;
    let timestamp = parse_raw_timestamp(&raw.timestamp)?;
    Ok(Some(encode_features(&raw, timestamp, encoding)))
}

pub fn encode_features(
    raw: &RawRecord,
    timestamp: NaiveDateTime,
    encoding: FeatureEncoding,
) -> FeatureRow {
    match encoding {
        FeatureEncoding::Calendar => FeatureRow::Calendar(CalendarFeatures {
            timestamp,
            year: timestamp.year(),
            month: timestamp.month(),
            day: timestamp.day(),
            hour: timestamp.hour(),
            minute: timestamp.minute(),
            second: timestamp.second(),
            power_usage: raw.power_usage,
            voltage: raw.voltage,
            current: raw.current,
        }),
        FeatureEncoding::Cyclical => {
            let (sin_day_of_year, cos_day_of_year) =
                cyclical_pair(f64::from(timestamp.ordinal()), DAYS_IN_YEAR);
            let (sin_second_of_day, cos_second_of_day) =
                cyclical_pair(second_of_day(timestamp), SECONDS_IN_DAY);
            FeatureRow::Cyclical(CyclicalFeatures {
                sin_day_of_year,
                cos_day_of_year,
                sin_second_of_day,
                cos_second_of_day,
                power_usage: raw.power_usage,
                voltage: raw.voltage,
                current: raw.current,
            })
        }
    }
}

/// Reads each named raw object in order and extracts its feature rows.
///
/// The first undecodable record aborts the whole batch.
pub fn extract_objects(
    store: &dyn ObjectStore,
    decoder: &dyn RecordDecoder,
    names: &[String],
    encoding: FeatureEncoding,
) -> Result<(Vec<FeatureRow>, ExtractionReport), FeatureError> {
    let mut report = ExtractionReport::default();
    let mut rows = Vec::new();

    for name in names {
        let bytes = store.get(name)?;
        let records = decoder
            .decode(&bytes)
            .map_err(|source| FeatureError::Decode {
                object: name.clone(),
                source,
            })?;
        report.objects_read += 1;
        report.records_read += records.len() as u64;

        for record in &records {
            let extracted =
                extract_features(record, encoding).map_err(|source| FeatureError::Decode {
                    object: name.clone(),
                    source,
                })?;
            match extracted {
                Some(row) => rows.push(row),
                None => report.records_without_body += 1,
            }
        }

        debug!(
            component = "features",
            event = "features.extract.object",
            object = %name,
            records = records.len()
        );
    }

    report.feature_rows = rows.len() as u64;
    info!(
        component = "features",
        event = "features.extract.finish",
        encoding = encoding.as_str(),
        objects_read = report.objects_read,
        records_read = report.records_read,
        records_without_body = report.records_without_body,
        feature_rows = report.feature_rows
    );

    Ok((rows, report))
}

fn second_of_day(ts: NaiveDateTime) -> f64 {
    f64::from(ts.num_seconds_from_midnight()) + f64::from(ts.nanosecond()) / 1e9
}

fn cyclical_pair(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}
