//! Stage entry points.
//!
//! Each `run_*` function connects its collaborators from [`PipelineConfig`],
//! runs one stage and returns its report. A store that cannot be reached is
//! reported as [`StageOutcome::ConnectionUnavailable`] rather than an error;
//! anything that goes wrong after connecting is an `Err`.

use std::fmt::Display;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::analytics::{create_analysis_data, AnalyticsReport};
use crate::config::{ObjectStoreConfig, PipelineConfig};
use crate::features::{extract_objects, ExtractionReport, FeatureEncoding, FeatureError};
use crate::object_store::{LocalObjectStore, ObjectStore, ObjectStoreError};
use crate::records::{JsonLinesDecoder, RecordDecoder};
use crate::snapshot::{write_snapshot, SnapshotError, SnapshotWriteReport};
use crate::store::{StoreError, TimeseriesStore};
use crate::targets::{generate_targets, TargetReport};
use crate::timeseries::{load_timeseries, TimeseriesLoadReport};
use crate::window::{select_window, WindowError};

/// Look-back used by the scheduled end-to-end run.
pub const SCHEDULED_DELTA_HOURS: u32 = 24;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Inserted {
        rows: u64,
    },
    #[default]
    NoNewRows,
    ConnectionUnavailable {
        reason: String,
    },
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::NoNewRows => "no_new_rows",
            Self::ConnectionUnavailable { .. } => "connection_unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Features(#[from] FeatureError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStageReport {
    pub outcome: StageOutcome,
    pub objects_listed: u64,
    pub objects_in_window: u64,
    pub extraction: ExtractionReport,
    pub snapshot: Option<SnapshotWriteReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunReport {
    pub features: FeatureStageReport,
    pub timeseries: TimeseriesLoadReport,
    pub targets: TargetReport,
    pub analytics: AnalyticsReport,
}

/// Lists raw objects under the configured prefix, keeps those inside the
/// look-back window, extracts features and appends them as one snapshot.
pub fn aggregate_features(
    objects: &dyn ObjectStore,
    decoder: &dyn RecordDecoder,
    cfg: &ObjectStoreConfig,
    encoding: FeatureEncoding,
    delta_hours: Option<u32>,
    now: NaiveDateTime,
) -> Result<FeatureStageReport, PipelineError> {
    info!(
        component = "features",
        event = "features.aggregate.start",
        raw_prefix = %cfg.raw_prefix,
        delta_hours = ?delta_hours,
        encoding = encoding.as_str()
    );
    let mut report = FeatureStageReport::default();

    let names = objects.list(&cfg.raw_prefix)?;
    report.objects_listed = names.len() as u64;
    let selected = select_window(&names, delta_hours, now)?;
    report.objects_in_window = selected.len() as u64;

    let (rows, extraction) = extract_objects(objects, decoder, &selected, encoding)?;
    report.extraction = extraction;

    let written = write_snapshot(objects, &cfg.dataset_path, &rows)?;
    report.outcome = if written.rows_written > 0 {
        StageOutcome::Inserted {
            rows: written.rows_written,
        }
    } else {
        StageOutcome::NoNewRows
    };
    report.snapshot = Some(written);

    info!(
        component = "features",
        event = "features.aggregate.finish",
        outcome = report.outcome.as_str(),
        objects_listed = report.objects_listed,
        objects_in_window = report.objects_in_window,
        feature_rows = report.extraction.feature_rows,
        snapshot = report
            .snapshot
            .as_ref()
            .and_then(|s| s.object_name.as_deref())
            .unwrap_or("<none>")
    );
    Ok(report)
}

pub fn run_aggregate_features(
    cfg: &PipelineConfig,
    delta_hours: Option<u32>,
) -> Result<FeatureStageReport, PipelineError> {
    let objects = match connect_objects(cfg, "features") {
        Ok(objects) => objects,
        Err(outcome) => {
            return Ok(FeatureStageReport {
                outcome,
                ..FeatureStageReport::default()
            })
        }
    };
    aggregate_features(
        &objects,
        &JsonLinesDecoder,
        &cfg.object_store,
        cfg.feature_encoding,
        delta_hours,
        cfg.now(),
    )
}

pub fn run_aggregate_to_timeseries(
    cfg: &PipelineConfig,
) -> Result<TimeseriesLoadReport, PipelineError> {
    let objects = match connect_objects(cfg, "timeseries") {
        Ok(objects) => objects,
        Err(outcome) => {
            return Ok(TimeseriesLoadReport {
                outcome,
                ..TimeseriesLoadReport::default()
            })
        }
    };
    let mut store = match connect_store(cfg, "timeseries")? {
        Ok(store) => store,
        Err(outcome) => {
            return Ok(TimeseriesLoadReport {
                outcome,
                ..TimeseriesLoadReport::default()
            })
        }
    };
    load_timeseries(&objects, &mut store, &cfg.object_store.dataset_path, cfg.now())
}

pub fn run_aggregate_to_power_consumption(
    cfg: &PipelineConfig,
) -> Result<TargetReport, PipelineError> {
    match connect_store(cfg, "targets")? {
        Ok(mut store) => generate_targets(&mut store, cfg.now()),
        Err(outcome) => Ok(TargetReport {
            outcome,
            ..TargetReport::default()
        }),
    }
}

pub fn run_create_analysis_data(cfg: &PipelineConfig) -> Result<AnalyticsReport, PipelineError> {
    match connect_store(cfg, "analytics")? {
        Ok(mut store) => create_analysis_data(&mut store, cfg.now()),
        Err(outcome) => Ok(AnalyticsReport {
            outcome,
            ..AnalyticsReport::default()
        }),
    }
}

/// Runs the four stages in order. An unreachable store only affects the
/// stages that need it; an `Err` stops the run.
pub fn run_all(
    cfg: &PipelineConfig,
    delta_hours: Option<u32>,
) -> Result<PipelineRunReport, PipelineError> {
    let report = PipelineRunReport {
        features: run_aggregate_features(cfg, delta_hours)?,
        timeseries: run_aggregate_to_timeseries(cfg)?,
        targets: run_aggregate_to_power_consumption(cfg)?,
        analytics: run_create_analysis_data(cfg)?,
    };
    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        features = report.features.outcome.as_str(),
        timeseries = report.timeseries.outcome.as_str(),
        targets = report.targets.outcome.as_str(),
        analytics = report.analytics.outcome.as_str()
    );
    Ok(report)
}

fn connect_objects(
    cfg: &PipelineConfig,
    stage: &'static str,
) -> Result<LocalObjectStore, StageOutcome> {
    LocalObjectStore::connect(&cfg.object_store)
        .map_err(|err| connection_unavailable(stage, "object_store", &err))
}

/// Outer `Err` is a real failure; inner `Err` is an unreachable store.
fn connect_store(
    cfg: &PipelineConfig,
    stage: &'static str,
) -> Result<Result<TimeseriesStore, StageOutcome>, PipelineError> {
    match TimeseriesStore::open(&cfg.database) {
        Ok(store) => Ok(Ok(store)),
        Err(err) if err.is_connection() => {
            Ok(Err(connection_unavailable(stage, "relational_store", &err)))
        }
        Err(err) => Err(err.into()),
    }
}

fn connection_unavailable(stage: &'static str, backend: &'static str, err: &dyn Display) -> StageOutcome {
    warn!(
        component = stage,
        event = "stage.connection_unavailable",
        backend,
        error = %err
    );
    StageOutcome::ConnectionUnavailable {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;
    use crate::records::{encode_json_lines, EnvelopeRecord};
    use chrono::NaiveDate;

    fn envelope(ts: &str, power_usage: f64) -> EnvelopeRecord {
        EnvelopeRecord::with_body(format!(
            r#"{{"timestamp":"{ts}","power_usage":{power_usage},"voltage":230.0,"current":1.5}}"#
        ))
    }

    fn object_cfg() -> ObjectStoreConfig {
        ObjectStoreConfig {
            dataset_path: "features".to_string(),
            raw_prefix: "raw/".to_string(),
            ..ObjectStoreConfig::default()
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .expect("valid date")
            .and_hms_opt(0, 0, 0)
            .expect("valid time")
    }

    #[test]
    fn features_stage_reads_only_the_window() {
        let store = InMemoryObjectStore::new()
            .with_object(
                "raw/0/2024/01/01/23/00/00.jsonl",
                encode_json_lines(&[envelope("2024-01-01 23:00:00.000000", 3.0)]),
            )
            .with_object(
                "raw/0/2023/12/30/00/00/00.jsonl",
                encode_json_lines(&[envelope("2023-12-30 00:00:00.000000", 9.0)]),
            );

        let report = aggregate_features(
            &store,
            &JsonLinesDecoder,
            &object_cfg(),
            FeatureEncoding::Calendar,
            Some(24),
            now(),
        )
        .expect("feature stage");

        assert_eq!(report.objects_listed, 2);
        assert_eq!(report.objects_in_window, 1);
        assert_eq!(report.outcome, StageOutcome::Inserted { rows: 1 });
        assert_eq!(store.list("features/").expect("list objects").len(), 1);
    }

    #[test]
    fn empty_window_is_no_new_rows() {
        let store = InMemoryObjectStore::new();
        let report = aggregate_features(
            &store,
            &JsonLinesDecoder,
            &object_cfg(),
            FeatureEncoding::Calendar,
            Some(1),
            now(),
        )
        .expect("feature stage");
        assert_eq!(report.outcome, StageOutcome::NoNewRows);
        assert!(store.list("").expect("list objects").is_empty());
    }

    #[test]
    fn missing_object_store_settings_are_connection_unavailable() {
        let cfg = PipelineConfig::default();
        let report = run_aggregate_features(&cfg, None).expect("feature stage");
        assert!(matches!(
            report.outcome,
            StageOutcome::ConnectionUnavailable { .. }
        ));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_string(&StageOutcome::Inserted { rows: 3 }).expect("serialize outcome");
        assert_eq!(json, r#"{"status":"inserted","rows":3}"#);
    }
}
