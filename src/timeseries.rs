//! Minute bucketing of calendar feature snapshots into the relational
//! time series.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::features::CalendarFeatures;
use crate::object_store::ObjectStore;
use crate::pipeline::{PipelineError, StageOutcome};
use crate::snapshot::{decode_snapshot, SnapshotTable};
use crate::store::{Table, TimeseriesStore};
use crate::timefmt::format_store;

/// Mean of every feature row that fell into one calendar minute.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBucket {
    pub timestamp: NaiveDateTime,
    pub power_usage: f64,
    pub current: f64,
    pub voltage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesLoadReport {
    pub outcome: StageOutcome,
    pub snapshots_listed: u64,
    pub snapshots_read: u64,
    pub snapshots_skipped: u64,
    pub feature_rows: u64,
    pub buckets: u64,
    pub watermark_before: Option<String>,
    pub buckets_after_watermark: u64,
    pub inserted: u64,
    pub ignored_duplicates: u64,
}

type MinuteKey = (i32, u32, u32, u32, u32);

#[derive(Default)]
struct Accumulator {
    count: u32,
    power_usage: f64,
    current: f64,
    voltage: f64,
}

/// Groups rows by `(year, month, day, hour, minute)` and averages the three
/// signals per group. Output is ordered by bucket.
///
/// Rows whose calendar fields do not form a valid minute are dropped.
pub fn aggregate_buckets(rows: &[CalendarFeatures]) -> Vec<TimeBucket> {
    let mut groups: BTreeMap<MinuteKey, Accumulator> = BTreeMap::new();
    for row in rows {
        let acc = groups
            .entry((row.year, row.month, row.day, row.hour, row.minute))
            .or_default();
        acc.count += 1;
        acc.power_usage += row.power_usage;
        acc.current += row.current;
        acc.voltage += row.voltage;
    }

    groups
        .into_iter()
        .filter_map(|((year, month, day, hour, minute), acc)| {
            let timestamp = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
            let n = f64::from(acc.count);
            Some(TimeBucket {
                timestamp,
                power_usage: acc.power_usage / n,
                current: acc.current / n,
                voltage: acc.voltage / n,
            })
        })
        .collect()
}

/// Reads every snapshot under `dataset_path` and concatenates the calendar
/// rows. Objects that cannot be fetched or decoded, and cyclical snapshots,
/// are skipped with a warning.
pub fn read_calendar_snapshots(
    objects: &dyn ObjectStore,
    dataset_path: &str,
    report: &mut TimeseriesLoadReport,
) -> Result<Vec<CalendarFeatures>, PipelineError> {
    let names = objects.list(&format!("{dataset_path}/"))?;
    report.snapshots_listed = names.len() as u64;

    let mut rows = Vec::new();
    for name in &names {
        let table = objects
            .get(name)
            .map_err(|err| err.to_string())
            .and_then(|bytes| decode_snapshot(&bytes).map_err(|err| err.to_string()));
        match table {
            Ok(SnapshotTable::Calendar(mut batch)) => {
                debug!(
                    component = "timeseries",
                    event = "timeseries.snapshot.read",
                    object = %name,
                    rows = batch.len()
                );
                report.snapshots_read += 1;
                rows.append(&mut batch);
            }
            Ok(SnapshotTable::Cyclical(_)) => {
                warn!(
                    component = "timeseries",
                    event = "timeseries.snapshot.skip",
                    object = %name,
                    reason = "cyclical snapshot has no timestamp column"
                );
                report.snapshots_skipped += 1;
            }
            Err(reason) => {
                warn!(
                    component = "timeseries",
                    event = "timeseries.snapshot.skip",
                    object = %name,
                    reason = %reason
                );
                report.snapshots_skipped += 1;
            }
        }
    }

    report.feature_rows = rows.len() as u64;
    Ok(rows)
}

/// Buckets every snapshot and inserts the minutes newer than the current
/// `electricity_timeseries` watermark.
pub fn load_timeseries(
    objects: &dyn ObjectStore,
    store: &mut TimeseriesStore,
    dataset_path: &str,
    now: NaiveDateTime,
) -> Result<TimeseriesLoadReport, PipelineError> {
    info!(
        component = "timeseries",
        event = "timeseries.load.start",
        dataset_path
    );
    let mut report = TimeseriesLoadReport::default();

    let rows = read_calendar_snapshots(objects, dataset_path, &mut report)?;
    let mut buckets = aggregate_buckets(&rows);
    report.buckets = buckets.len() as u64;

    let watermark = store.watermark(Table::ElectricityTimeseries)?;
    report.watermark_before = watermark.map(format_store);
    if let Some(watermark) = watermark {
        buckets.retain(|bucket| bucket.timestamp > watermark);
    }
    report.buckets_after_watermark = buckets.len() as u64;

    if buckets.is_empty() {
        report.outcome = StageOutcome::NoNewRows;
    } else {
        let inserted = store.insert_buckets(&buckets, now)?;
        report.inserted = inserted.inserted;
        report.ignored_duplicates = inserted.ignored_duplicates;
        report.outcome = StageOutcome::Inserted {
            rows: inserted.inserted,
        };
    }

    info!(
        component = "timeseries",
        event = "timeseries.load.finish",
        outcome = report.outcome.as_str(),
        snapshots_read = report.snapshots_read,
        snapshots_skipped = report.snapshots_skipped,
        buckets = report.buckets,
        watermark_before = report.watermark_before.as_deref().unwrap_or("<none>"),
        inserted = report.inserted,
        ignored_duplicates = report.ignored_duplicates
    );
    Ok(report)
}
