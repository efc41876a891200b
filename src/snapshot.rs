//! Feature snapshots: one typed parquet table per extraction run, appended
//! under the dataset path and never overwritten.
//!
//! Names are `aggregated_features_{N}_{digest}.parquet`. `N` is one more
//! than the number of objects already under the path; `digest` is a prefix
//! of the SHA-256 of the encoded table, so concurrent writers cannot clobber
//! each other and re-writing identical content is a no-op.

use std::sync::Arc;

use arrow::array::{Array, Float64Array, Int32Array, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{
    CalendarFeatures, CyclicalFeatures, FeatureEncoding, FeatureRow, CALENDAR_COLUMNS,
    CYCLICAL_COLUMNS,
};
use crate::object_store::{ObjectStore, ObjectStoreError, PutOutcome};

pub const SNAPSHOT_STEM: &str = "aggregated_features";
pub const SNAPSHOT_EXTENSION: &str = "parquet";
const DIGEST_HEX_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("snapshot mixes feature encodings ({first:?} and {other:?})")]
    MixedEncodings {
        first: FeatureEncoding,
        other: FeatureEncoding,
    },
    #[error("unrecognized snapshot columns: {0:?}")]
    UnknownHeader(Vec<String>),
    #[error("snapshot column {column} has type {found}, expected {expected}")]
    ColumnType {
        column: String,
        expected: String,
        found: String,
    },
    #[error("snapshot row {row} has invalid calendar fields")]
    InvalidCalendarRow { row: usize },
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}

/// Rows of one decoded snapshot, typed by encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotTable {
    Calendar(Vec<CalendarFeatures>),
    Cyclical(Vec<CyclicalFeatures>),
}

impl SnapshotTable {
    pub fn encoding(&self) -> FeatureEncoding {
        match self {
            Self::Calendar(_) => FeatureEncoding::Calendar,
            Self::Cyclical(_) => FeatureEncoding::Cyclical,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Calendar(rows) => rows.len(),
            Self::Cyclical(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWriteReport {
    pub object_name: Option<String>,
    pub rows_written: u64,
    pub already_present: bool,
}

/// Column schema of one encoding. Calendar timestamps are naive
/// microseconds; calendar parts are Int32; signals are Float64.
pub fn snapshot_schema(encoding: FeatureEncoding) -> SchemaRef {
    let fields = encoding
        .columns()
        .iter()
        .map(|name| {
            let data_type = match (encoding, *name) {
                (FeatureEncoding::Calendar, "timestamp") => {
                    DataType::Timestamp(TimeUnit::Microsecond, None)
                }
                (FeatureEncoding::Calendar, "power_usage" | "voltage" | "current") => {
                    DataType::Float64
                }
                (FeatureEncoding::Calendar, _) => DataType::Int32,
                (FeatureEncoding::Cyclical, _) => DataType::Float64,
            };
            Field::new(*name, data_type, false)
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

pub fn encode_snapshot(rows: &[FeatureRow]) -> Result<Vec<u8>, SnapshotError> {
    let encoding = rows
        .first()
        .map(FeatureRow::encoding)
        .unwrap_or(FeatureEncoding::Calendar);
    let batch = match encoding {
        FeatureEncoding::Calendar => calendar_batch(&collect_calendar(rows)?)?,
        FeatureEncoding::Cyclical => cyclical_batch(&collect_cyclical(rows)?)?,
    };

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<SnapshotTable, SnapshotError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(bytes))?;
    let encoding = match_schema(builder.schema())?;
    let reader = builder.build()?;

    let mut table = match encoding {
        FeatureEncoding::Calendar => SnapshotTable::Calendar(Vec::new()),
        FeatureEncoding::Cyclical => SnapshotTable::Cyclical(Vec::new()),
    };
    for batch in reader {
        let batch = batch?;
        match &mut table {
            SnapshotTable::Calendar(rows) => {
                let offset = rows.len();
                rows.extend(calendar_rows(&batch, offset)?);
            }
            SnapshotTable::Cyclical(rows) => rows.extend(cyclical_rows(&batch)?),
        }
    }
    Ok(table)
}

pub fn snapshot_object_name(dataset_path: &str, index: usize, digest: &str) -> String {
    format!("{dataset_path}/{SNAPSHOT_STEM}_{index}_{digest}.{SNAPSHOT_EXTENSION}")
}

pub fn snapshot_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(DIGEST_HEX_LEN);
    digest
}

/// Appends one run's rows as a new snapshot under `dataset_path`.
///
/// An empty run writes nothing.
pub fn write_snapshot(
    store: &dyn ObjectStore,
    dataset_path: &str,
    rows: &[FeatureRow],
) -> Result<SnapshotWriteReport, SnapshotError> {
    if rows.is_empty() {
        info!(
            component = "snapshot",
            event = "snapshot.write.empty",
            dataset_path
        );
        return Ok(SnapshotWriteReport {
            object_name: None,
            rows_written: 0,
            already_present: false,
        });
    }

    let bytes = encode_snapshot(rows)?;
    let digest = snapshot_digest(&bytes);
    let existing = store.list(&format!("{dataset_path}/"))?;

    let digest_suffix = format!("_{digest}.{SNAPSHOT_EXTENSION}");
    if let Some(duplicate) = existing.iter().find(|name| name.ends_with(&digest_suffix)) {
        info!(
            component = "snapshot",
            event = "snapshot.write.duplicate",
            object = %duplicate,
            rows = rows.len()
        );
        return Ok(SnapshotWriteReport {
            object_name: Some(duplicate.clone()),
            rows_written: 0,
            already_present: true,
        });
    }

    let name = snapshot_object_name(dataset_path, existing.len() + 1, &digest);
    let outcome = store.put_new(&name, &bytes)?;
    let already_present = outcome == PutOutcome::AlreadyExists;
    if already_present {
        warn!(
            component = "snapshot",
            event = "snapshot.write.name_taken",
            object = %name
        );
    } else {
        info!(
            component = "snapshot",
            event = "snapshot.write.finish",
            object = %name,
            rows = rows.len(),
            bytes = bytes.len(),
            encoding = rows[0].encoding().as_str()
        );
    }

    Ok(SnapshotWriteReport {
        object_name: Some(name),
        rows_written: if already_present { 0 } else { rows.len() as u64 },
        already_present,
    })
}

fn collect_calendar(rows: &[FeatureRow]) -> Result<Vec<&CalendarFeatures>, SnapshotError> {
    rows.iter()
        .map(|row| match row {
            FeatureRow::Calendar(features) => Ok(features),
            other => Err(SnapshotError::MixedEncodings {
                first: FeatureEncoding::Calendar,
                other: other.encoding(),
            }),
        })
        .collect()
}

fn collect_cyclical(rows: &[FeatureRow]) -> Result<Vec<&CyclicalFeatures>, SnapshotError> {
    rows.iter()
        .map(|row| match row {
            FeatureRow::Cyclical(features) => Ok(features),
            other => Err(SnapshotError::MixedEncodings {
                first: FeatureEncoding::Cyclical,
                other: other.encoding(),
            }),
        })
        .collect()
}

fn calendar_batch(rows: &[&CalendarFeatures]) -> Result<RecordBatch, SnapshotError> {
    let timestamp: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| Some(r.timestamp.and_utc().timestamp_micros()))
        .collect();
    let part = |get: fn(&CalendarFeatures) -> u32| -> Int32Array {
        rows.iter()
            .map(|r| Some(i32::try_from(get(r)).unwrap_or(i32::MAX)))
            .collect()
    };
    let year: Int32Array = rows.iter().map(|r| Some(r.year)).collect();
    let power_usage: Float64Array = rows.iter().map(|r| Some(r.power_usage)).collect();
    let voltage: Float64Array = rows.iter().map(|r| Some(r.voltage)).collect();
    let current: Float64Array = rows.iter().map(|r| Some(r.current)).collect();

    Ok(RecordBatch::try_new(
        snapshot_schema(FeatureEncoding::Calendar),
        vec![
            Arc::new(timestamp),
            Arc::new(year),
            Arc::new(part(|r| r.month)),
            Arc::new(part(|r| r.day)),
            Arc::new(part(|r| r.hour)),
            Arc::new(part(|r| r.minute)),
            Arc::new(part(|r| r.second)),
            Arc::new(power_usage),
            Arc::new(voltage),
            Arc::new(current),
        ],
    )?)
}

fn cyclical_batch(rows: &[&CyclicalFeatures]) -> Result<RecordBatch, SnapshotError> {
    let values = |get: fn(&CyclicalFeatures) -> f64| -> Float64Array {
        rows.iter().map(|r| Some(get(r))).collect()
    };
    Ok(RecordBatch::try_new(
        snapshot_schema(FeatureEncoding::Cyclical),
        vec![
            Arc::new(values(|r| r.sin_day_of_year)),
            Arc::new(values(|r| r.cos_day_of_year)),
            Arc::new(values(|r| r.sin_second_of_day)),
            Arc::new(values(|r| r.cos_second_of_day)),
            Arc::new(values(|r| r.power_usage)),
            Arc::new(values(|r| r.voltage)),
            Arc::new(values(|r| r.current)),
        ],
    )?)
}

/// Identifies the encoding from column names, then checks column types.
fn match_schema(schema: &Schema) -> Result<FeatureEncoding, SnapshotError> {
    let names: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
    let encoding = if names == CALENDAR_COLUMNS {
        FeatureEncoding::Calendar
    } else if names == CYCLICAL_COLUMNS {
        FeatureEncoding::Cyclical
    } else {
        return Err(SnapshotError::UnknownHeader(names));
    };

    let expected = snapshot_schema(encoding);
    for (want, got) in expected.fields().iter().zip(schema.fields().iter()) {
        if want.data_type() != got.data_type() {
            return Err(SnapshotError::ColumnType {
                column: want.name().clone(),
                expected: want.data_type().to_string(),
                found: got.data_type().to_string(),
            });
        }
    }
    Ok(encoding)
}

fn column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a T, SnapshotError> {
    let array = batch
        .column_by_name(name)
        .ok_or_else(|| SnapshotError::UnknownHeader(vec![name.to_string()]))?;
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| SnapshotError::ColumnType {
            column: name.to_string(),
            expected: std::any::type_name::<T>().to_string(),
            found: array.data_type().to_string(),
        })
}

fn calendar_rows(batch: &RecordBatch, offset: usize) -> Result<Vec<CalendarFeatures>, SnapshotError> {
    let timestamp = column::<TimestampMicrosecondArray>(batch, "timestamp")?;
    let year = column::<Int32Array>(batch, "year")?;
    let month = column::<Int32Array>(batch, "month")?;
    let day = column::<Int32Array>(batch, "day")?;
    let hour = column::<Int32Array>(batch, "hour")?;
    let minute = column::<Int32Array>(batch, "minute")?;
    let second = column::<Int32Array>(batch, "second")?;
    let power_usage = column::<Float64Array>(batch, "power_usage")?;
    let voltage = column::<Float64Array>(batch, "voltage")?;
    let current = column::<Float64Array>(batch, "current")?;

    (0..batch.num_rows())
        .map(|i| {
            let invalid = || SnapshotError::InvalidCalendarRow { row: offset + i + 1 };
            let part = |array: &Int32Array| u32::try_from(array.value(i)).map_err(|_| invalid());
            let row = CalendarFeatures {
                timestamp: micros_to_naive(timestamp.value(i)).ok_or_else(invalid)?,
                year: year.value(i),
                month: part(month)?,
                day: part(day)?,
                hour: part(hour)?,
                minute: part(minute)?,
                second: part(second)?,
                power_usage: power_usage.value(i),
                voltage: voltage.value(i),
                current: current.value(i),
            };
            if calendar_fields_valid(&row) {
                Ok(row)
            } else {
                Err(invalid())
            }
        })
        .collect()
}

fn cyclical_rows(batch: &RecordBatch) -> Result<Vec<CyclicalFeatures>, SnapshotError> {
    let sin_day_of_year = column::<Float64Array>(batch, "sin_day_of_year")?;
    let cos_day_of_year = column::<Float64Array>(batch, "cos_day_of_year")?;
    let sin_second_of_day = column::<Float64Array>(batch, "sin_second_of_day")?;
    let cos_second_of_day = column::<Float64Array>(batch, "cos_second_of_day")?;
    let power_usage = column::<Float64Array>(batch, "power_usage")?;
    let voltage = column::<Float64Array>(batch, "voltage")?;
    let current = column::<Float64Array>(batch, "current")?;

    Ok((0..batch.num_rows())
        .map(|i| CyclicalFeatures {
            sin_day_of_year: sin_day_of_year.value(i),
            cos_day_of_year: cos_day_of_year.value(i),
            sin_second_of_day: sin_second_of_day.value(i),
            cos_second_of_day: cos_second_of_day.value(i),
            power_usage: power_usage.value(i),
            voltage: voltage.value(i),
            current: current.value(i),
        })
        .collect())
}

fn micros_to_naive(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros).map(|ts| ts.naive_utc())
}

fn calendar_fields_valid(row: &CalendarFeatures) -> bool {
    NaiveDate::from_ymd_opt(row.year, row.month, row.day)
        .and_then(|date| date.and_hms_opt(row.hour, row.minute, row.second))
        .is_some()
}
