//! Powerflow core crate.
//!
//! Incremental power-usage aggregation:
//! - raw records to feature snapshots (windowed by object name)
//! - snapshots to minute buckets
//! - buckets to 5/15/60-minute forward targets
//! - targets joined with served forecasts

mod analytics;
mod config;
mod features;
mod object_store;
mod observability;
mod pipeline;
mod records;
mod snapshot;
mod store;
mod targets;
mod timefmt;
mod timeseries;
mod window;

pub use analytics::{
    create_analysis_data, join_actuals_with_forecasts, ActualRow, AnalyticsReport, AnalyticsRow,
    ForecastRow, JoinStats,
};
pub use config::{
    ConfigError, DatabaseConfig, ObjectStoreConfig, PipelineConfig, DEFAULT_DATASET_PATH,
    DEFAULT_RAW_PREFIX,
};
pub use features::{
    encode_features, extract_features, extract_objects, parse_raw_timestamp, CalendarFeatures,
    CyclicalFeatures, ExtractionReport, FeatureEncoding, FeatureError, FeatureRow,
    CALENDAR_COLUMNS, CYCLICAL_COLUMNS, DAYS_IN_YEAR, SECONDS_IN_DAY,
};
pub use object_store::{
    InMemoryObjectStore, LocalObjectStore, ObjectStore, ObjectStoreError, PutOutcome,
};
pub use observability::{
    init_logging, log_app_start, logging_config_from_env, logging_config_from_lookup, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    aggregate_features, run_aggregate_features, run_aggregate_to_power_consumption,
    run_aggregate_to_timeseries, run_all, run_create_analysis_data, FeatureStageReport,
    PipelineError, PipelineRunReport, StageOutcome, SCHEDULED_DELTA_HOURS,
};
pub use records::{
    encode_json_lines, DecodeError, EnvelopeRecord, JsonLinesDecoder, RawRecord, RecordDecoder,
    BODY_KEY,
};
pub use snapshot::{
    decode_snapshot, encode_snapshot, snapshot_digest, snapshot_object_name, snapshot_schema,
    write_snapshot, SnapshotError, SnapshotTable, SnapshotWriteReport, SNAPSHOT_EXTENSION, SNAPSHOT_STEM,
};
pub use store::{InsertReport, StoreError, Table, TimeseriesStore};
pub use targets::{
    build_targets, forward_window_sums, generate_targets, PowerConsumptionRow, SeriesPoint,
    TargetReport, HORIZONS_MINUTES,
};
pub use timefmt::{format_micros, format_store, parse_timestamp};
pub use timeseries::{
    aggregate_buckets, load_timeseries, read_calendar_snapshots, TimeBucket, TimeseriesLoadReport,
};
pub use window::{parse_object_timestamp, select_window, WindowError};
