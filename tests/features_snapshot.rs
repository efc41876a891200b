use std::fs;
use std::path::Path;

use powerflow::{
    decode_snapshot, encode_json_lines, run_aggregate_features, DatabaseConfig, EnvelopeRecord,
    FeatureEncoding, ObjectStoreConfig, PipelineConfig, PipelineError, SnapshotTable,
    StageOutcome,
};
use regex::Regex;
use serde_json::{json, Map};
use tempfile::TempDir;

const CONTAINER: &str = "telemetry";

fn pipeline_config(tmp: &Path) -> PipelineConfig {
    fs::create_dir_all(tmp.join(CONTAINER)).expect("container dir");
    PipelineConfig {
        object_store: ObjectStoreConfig {
            connection_string: Some(format!("file://{}", tmp.display())),
            container: Some(CONTAINER.to_string()),
            ..ObjectStoreConfig::default()
        },
        database: DatabaseConfig {
            store_path: tmp.join("db").join("powerflow.sqlite"),
            ..DatabaseConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn body(ts: &str, power_usage: f64) -> EnvelopeRecord {
    EnvelopeRecord::with_body(
        json!({
            "timestamp": ts,
            "power_usage": power_usage,
            "voltage": 231.5,
            "current": 4.25,
        })
        .to_string(),
    )
}

fn put_raw(tmp: &Path, name: &str, bytes: &[u8]) {
    let path = tmp.join(CONTAINER).join(name);
    fs::create_dir_all(path.parent().expect("raw object has a parent")).expect("raw dirs");
    fs::write(path, bytes).expect("write raw object");
}

fn snapshot_files(tmp: &Path) -> Vec<String> {
    let dir = tmp.join(CONTAINER).join("aggregated_features");
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn raw_objects_become_one_named_snapshot() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = pipeline_config(tmp.path());
    put_raw(
        tmp.path(),
        "flexitricity/hub/0/2024/01/01/00/00/00.jsonl",
        &encode_json_lines(&[
            body("2024-01-01 00:00:10.000000", 10.0),
            body("2024-01-01 00:00:40.000000", 20.0),
            EnvelopeRecord::new(Map::new()),
        ]),
    );
    put_raw(
        tmp.path(),
        "flexitricity/hub/1/2024/01/01/00/01/00.jsonl",
        &encode_json_lines(&[body("2024-01-01 00:01:05.500000", 30.0)]),
    );

    let report = run_aggregate_features(&cfg, None).expect("feature stage succeeds");

    assert_eq!(report.outcome, StageOutcome::Inserted { rows: 3 });
    assert_eq!(report.objects_listed, 2);
    assert_eq!(report.extraction.records_read, 4);
    assert_eq!(report.extraction.records_without_body, 1);

    let name = report
        .snapshot
        .and_then(|s| s.object_name)
        .expect("snapshot name");
    let pattern = Regex::new(r"^aggregated_features/aggregated_features_1_[0-9a-f]{16}\.parquet$")
        .expect("valid regex");
    assert!(pattern.is_match(&name), "unexpected name {name}");

    let bytes = fs::read(tmp.path().join(CONTAINER).join(&name)).expect("snapshot on disk");
    assert_eq!(&bytes[..4], b"PAR1", "snapshot should be a parquet file");
    assert_eq!(&bytes[bytes.len() - 4..], b"PAR1");
    match decode_snapshot(&bytes).expect("snapshot decodes") {
        SnapshotTable::Calendar(rows) => {
            assert_eq!(rows.len(), 3);
            assert_eq!((rows[2].minute, rows[2].second), (1, 5));
            assert_eq!(rows[2].power_usage, 30.0);
        }
        other => panic!("expected calendar snapshot, got {other:?}"),
    }
}

#[test]
fn rerun_over_the_same_objects_does_not_add_a_snapshot() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = pipeline_config(tmp.path());
    put_raw(
        tmp.path(),
        "flexitricity/hub/0/2024/01/01/00/00/00.jsonl",
        &encode_json_lines(&[body("2024-01-01 00:00:10.000000", 10.0)]),
    );

    run_aggregate_features(&cfg, None).expect("first run");
    let second = run_aggregate_features(&cfg, None).expect("second run");

    assert_eq!(second.outcome, StageOutcome::NoNewRows);
    assert!(second.snapshot.expect("write report").already_present);
    assert_eq!(snapshot_files(tmp.path()).len(), 1);
}

#[test]
fn cyclical_encoding_writes_the_cyclical_schema() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = PipelineConfig {
        feature_encoding: FeatureEncoding::Cyclical,
        ..pipeline_config(tmp.path())
    };
    put_raw(
        tmp.path(),
        "flexitricity/hub/0/2024/01/01/00/00/00.jsonl",
        &encode_json_lines(&[body("2024-01-01 00:00:00.000000", 1.0)]),
    );

    let report = run_aggregate_features(&cfg, None).expect("feature stage succeeds");
    let name = report.snapshot.and_then(|s| s.object_name).expect("snapshot");
    let bytes = fs::read(tmp.path().join(CONTAINER).join(name)).expect("snapshot on disk");

    match decode_snapshot(&bytes).expect("snapshot decodes") {
        SnapshotTable::Cyclical(rows) => {
            assert_eq!(rows.len(), 1);
            assert!(rows[0].sin_second_of_day.abs() < 1e-12);
            assert!((rows[0].cos_second_of_day - 1.0).abs() < 1e-12);
        }
        other => panic!("expected cyclical snapshot, got {other:?}"),
    }
}

#[test]
fn malformed_body_aborts_the_batch_without_writing() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = pipeline_config(tmp.path());
    put_raw(
        tmp.path(),
        "flexitricity/hub/0/2024/01/01/00/00/00.jsonl",
        &encode_json_lines(&[
            body("2024-01-01 00:00:10.000000", 10.0),
            EnvelopeRecord::with_body("{\"timestamp\": \"2024-01-01 00:00:20\""),
        ]),
    );

    let err = run_aggregate_features(&cfg, None).expect_err("decode failure is fatal");
    assert!(matches!(err, PipelineError::Features(_)));
    assert!(snapshot_files(tmp.path()).is_empty());
}

#[test]
fn malformed_object_name_aborts_when_windowing() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = pipeline_config(tmp.path());
    put_raw(tmp.path(), "flexitricity/readme.txt", b"not a record");

    let err = run_aggregate_features(&cfg, Some(24)).expect_err("bad name is fatal");
    assert!(matches!(err, PipelineError::Window(_)));
}

#[test]
fn missing_container_is_connection_unavailable() {
    let tmp = TempDir::new().expect("tempdir");
    let mut cfg = pipeline_config(tmp.path());
    cfg.object_store.container = Some("absent".to_string());

    let report = run_aggregate_features(&cfg, None).expect("not an error");
    assert!(matches!(
        report.outcome,
        StageOutcome::ConnectionUnavailable { .. }
    ));
}
