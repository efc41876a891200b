//! Joins realized consumption with served forecasts.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pipeline::{PipelineError, StageOutcome};
use crate::store::{Table, TimeseriesStore};
use crate::timefmt::format_store;

#[derive(Debug, Clone, PartialEq)]
pub struct ActualRow {
    pub timestamp: NaiveDateTime,
    pub power_usage_5_minutes_ahead: f64,
    pub power_usage_15_minutes_ahead: f64,
    pub power_usage_60_minutes_ahead: f64,
}

/// One served forecast. Horizons may be missing when the serving call
/// failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRow {
    pub timestamp: NaiveDateTime,
    pub endpoint: String,
    pub version: String,
    pub power_usage_5_minutes_ahead_forecast: Option<f64>,
    pub power_usage_15_minutes_ahead_forecast: Option<f64>,
    pub power_usage_60_minutes_ahead_forecast: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsRow {
    pub timestamp: NaiveDateTime,
    pub endpoint: String,
    pub version: String,
    pub power_usage_5_minutes_ahead: f64,
    pub power_usage_15_minutes_ahead: f64,
    pub power_usage_60_minutes_ahead: f64,
    pub power_usage_5_minutes_ahead_forecast: f64,
    pub power_usage_15_minutes_ahead_forecast: f64,
    pub power_usage_60_minutes_ahead_forecast: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub outcome: StageOutcome,
    pub watermark_before: Option<String>,
    pub actual_rows: u64,
    pub forecast_rows: u64,
    pub joined_rows: u64,
    pub incomplete_forecasts: u64,
    pub inserted: u64,
    pub ignored_duplicates: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub joined: u64,
    pub incomplete_forecasts: u64,
}

/// Inner join on `timestamp`, sorted by `(timestamp, endpoint, version)`.
/// Pairs whose forecast lacks any horizon are dropped.
pub fn join_actuals_with_forecasts(
    actuals: &[ActualRow],
    forecasts: &[ForecastRow],
) -> (Vec<AnalyticsRow>, JoinStats) {
    let mut by_timestamp: HashMap<NaiveDateTime, Vec<&ActualRow>> = HashMap::new();
    for actual in actuals {
        by_timestamp.entry(actual.timestamp).or_default().push(actual);
    }

    let mut pairs: Vec<(&ActualRow, &ForecastRow)> = forecasts
        .iter()
        .flat_map(|forecast| {
            by_timestamp
                .get(&forecast.timestamp)
                .into_iter()
                .flatten()
                .map(move |actual| (*actual, forecast))
        })
        .collect();
    pairs.sort_by(|(_, a), (_, b)| {
        (a.timestamp, &a.endpoint, &a.version).cmp(&(b.timestamp, &b.endpoint, &b.version))
    });

    let mut stats = JoinStats {
        joined: pairs.len() as u64,
        ..JoinStats::default()
    };
    let rows: Vec<AnalyticsRow> = pairs
        .into_iter()
        .filter_map(|(actual, forecast)| {
            let row = complete_row(actual, forecast);
            if row.is_none() {
                stats.incomplete_forecasts += 1;
            }
            row
        })
        .collect();
    (rows, stats)
}

fn complete_row(actual: &ActualRow, forecast: &ForecastRow) -> Option<AnalyticsRow> {
    Some(AnalyticsRow {
        timestamp: actual.timestamp,
        endpoint: forecast.endpoint.clone(),
        version: forecast.version.clone(),
        power_usage_5_minutes_ahead: actual.power_usage_5_minutes_ahead,
        power_usage_15_minutes_ahead: actual.power_usage_15_minutes_ahead,
        power_usage_60_minutes_ahead: actual.power_usage_60_minutes_ahead,
        power_usage_5_minutes_ahead_forecast: forecast.power_usage_5_minutes_ahead_forecast?,
        power_usage_15_minutes_ahead_forecast: forecast.power_usage_15_minutes_ahead_forecast?,
        power_usage_60_minutes_ahead_forecast: forecast.power_usage_60_minutes_ahead_forecast?,
    })
}

/// Joins actuals and forecasts newer than the analytics watermark and
/// inserts the complete pairs.
pub fn create_analysis_data(
    store: &mut TimeseriesStore,
    now: NaiveDateTime,
) -> Result<AnalyticsReport, PipelineError> {
    info!(component = "analytics", event = "analytics.join.start");
    let mut report = AnalyticsReport::default();

    let watermark = store.watermark(Table::ApiPowerUsageAnalytics)?;
    report.watermark_before = watermark.map(format_store);
    let actuals = store.read_actuals(watermark)?;
    let forecasts = store.read_forecasts(watermark)?;
    report.actual_rows = actuals.len() as u64;
    report.forecast_rows = forecasts.len() as u64;

    let rows = if actuals.is_empty() || forecasts.is_empty() {
        Vec::new()
    } else {
        let (rows, stats) = join_actuals_with_forecasts(&actuals, &forecasts);
        report.joined_rows = stats.joined;
        report.incomplete_forecasts = stats.incomplete_forecasts;
        rows
    };

    if rows.is_empty() {
        report.outcome = StageOutcome::NoNewRows;
    } else {
        let inserted = store.insert_analytics(&rows, now)?;
        report.inserted = inserted.inserted;
        report.ignored_duplicates = inserted.ignored_duplicates;
        report.outcome = StageOutcome::Inserted {
            rows: inserted.inserted,
        };
    }

    info!(
        component = "analytics",
        event = "analytics.join.finish",
        outcome = report.outcome.as_str(),
        watermark_before = report.watermark_before.as_deref().unwrap_or("<none>"),
        actual_rows = report.actual_rows,
        forecast_rows = report.forecast_rows,
        joined_rows = report.joined_rows,
        incomplete_forecasts = report.incomplete_forecasts,
        inserted = report.inserted,
        ignored_duplicates = report.ignored_duplicates
    );
    Ok(report)
}
