//! Forward-looking consumption targets over the minute series.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pipeline::{PipelineError, StageOutcome};
use crate::store::{Table, TimeseriesStore};
use crate::timefmt::format_store;

pub const HORIZONS_MINUTES: [usize; 3] = [5, 15, 60];

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: NaiveDateTime,
    pub power_usage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerConsumptionRow {
    pub timestamp: NaiveDateTime,
    pub power_usage_5_minutes_ahead: f64,
    pub power_usage_15_minutes_ahead: f64,
    pub power_usage_60_minutes_ahead: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub outcome: StageOutcome,
    pub watermark_before: Option<String>,
    pub series_points: u64,
    pub complete_rows: u64,
    pub inserted: u64,
    pub ignored_duplicates: u64,
}

/// Sum of the `horizon` values strictly after each position.
///
/// Positions without a full window ahead of them are `None`.
pub fn forward_window_sums(values: &[f64], horizon: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            let end = i + horizon;
            (end < values.len()).then(|| values[i + 1..=end].iter().sum())
        })
        .collect()
}

/// Rows carrying all three horizon targets. Input need not be sorted.
///
/// A row at `T` needs a sample for every minute in `T+1 ..= T+horizon`, so
/// a missing minute drops every row whose window spans it.
pub fn build_targets(points: &[SeriesPoint]) -> Vec<PowerConsumptionRow> {
    let mut points = points.to_vec();
    points.sort_by_key(|point| point.timestamp);
    let values: Vec<f64> = points.iter().map(|point| point.power_usage).collect();

    let [five, fifteen, sixty] = HORIZONS_MINUTES.map(|h| forward_window_sums(&values, h));

    points
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            HORIZONS_MINUTES
                .iter()
                .all(|&horizon| spans_next_minutes(&points, *i, horizon))
        })
        .filter_map(|(i, point)| {
            Some(PowerConsumptionRow {
                timestamp: point.timestamp,
                power_usage_5_minutes_ahead: five[i]?,
                power_usage_15_minutes_ahead: fifteen[i]?,
                power_usage_60_minutes_ahead: sixty[i]?,
            })
        })
        .collect()
}

/// Buckets are unique and minute-aligned, so `horizon` samples ahead cover
/// exactly `horizon` minutes only when none is missing.
fn spans_next_minutes(points: &[SeriesPoint], start: usize, horizon: usize) -> bool {
    let Ok(minutes) = i64::try_from(horizon) else {
        return false;
    };
    points.get(start + horizon).is_some_and(|end| {
        end.timestamp - points[start].timestamp == Duration::minutes(minutes)
    })
}

/// Derives targets from `electricity_timeseries` rows newer than the
/// `power_consumption` watermark and inserts the complete ones.
pub fn generate_targets(
    store: &mut TimeseriesStore,
    now: NaiveDateTime,
) -> Result<TargetReport, PipelineError> {
    info!(component = "targets", event = "targets.generate.start");
    let mut report = TargetReport::default();

    let watermark = store.watermark(Table::PowerConsumption)?;
    report.watermark_before = watermark.map(format_store);
    let series = store.read_power_usage_series(watermark)?;
    report.series_points = series.len() as u64;

    let rows = build_targets(&series);
    report.complete_rows = rows.len() as u64;

    if rows.is_empty() {
        report.outcome = StageOutcome::NoNewRows;
    } else {
        let inserted = store.insert_power_consumption(&rows, now)?;
        report.inserted = inserted.inserted;
        report.ignored_duplicates = inserted.ignored_duplicates;
        report.outcome = StageOutcome::Inserted {
            rows: inserted.inserted,
        };
    }

    info!(
        component = "targets",
        event = "targets.generate.finish",
        outcome = report.outcome.as_str(),
        watermark_before = report.watermark_before.as_deref().unwrap_or("<none>"),
        series_points = report.series_points,
        complete_rows = report.complete_rows,
        inserted = report.inserted,
        ignored_duplicates = report.ignored_duplicates
    );
    Ok(report)
}
