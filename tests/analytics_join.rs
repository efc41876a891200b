use chrono::{Duration, NaiveDate, NaiveDateTime};
use powerflow::{
    create_analysis_data, format_store, run_create_analysis_data, DatabaseConfig, PipelineConfig,
    PowerConsumptionRow, StageOutcome, Table, TimeseriesStore,
};
use rusqlite::{params, Connection};
use tempfile::TempDir;

fn minute(m: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .expect("date")
        .and_hms_opt(0, 0, 0)
        .expect("time")
        + Duration::minutes(m)
}

fn seed_actuals(store: &mut TimeseriesStore, minutes: &[i64]) {
    let rows: Vec<PowerConsumptionRow> = minutes
        .iter()
        .map(|m| PowerConsumptionRow {
            timestamp: minute(*m),
            power_usage_5_minutes_ahead: 5.0,
            power_usage_15_minutes_ahead: 15.0,
            power_usage_60_minutes_ahead: 60.0,
        })
        .collect();
    store
        .insert_power_consumption(&rows, minute(1_000))
        .expect("seed actuals");
}

fn seed_forecast(
    conn: &Connection,
    m: i64,
    endpoint: &str,
    version: &str,
    horizons: (Option<f64>, Option<f64>, Option<f64>),
) {
    conn.execute(
        "INSERT INTO api_power_usage (
            timestamp, endpoint, version,
            power_usage_5_minutes_ahead, power_usage_15_minutes_ahead,
            power_usage_60_minutes_ahead, response_status_code, request
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 200, '{}')",
        params![
            format_store(minute(m)),
            endpoint,
            version,
            horizons.0,
            horizons.1,
            horizons.2
        ],
    )
    .expect("seed forecast");
}

const FULL: (Option<f64>, Option<f64>, Option<f64>) = (Some(4.5), Some(14.5), Some(59.5));

fn analytics_keys(conn: &Connection) -> Vec<(String, String, String)> {
    let mut stmt = conn
        .prepare(
            "SELECT timestamp, endpoint, version FROM api_power_usage_analytics
             ORDER BY timestamp, endpoint, version",
        )
        .expect("prepare");
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .expect("query");
    rows.collect::<Result<Vec<_>, _>>().expect("rows")
}

#[test]
fn joins_actuals_with_complete_forecasts_only() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("powerflow.sqlite");
    let mut store = TimeseriesStore::open_path(&path).expect("open store");
    let conn = Connection::open(&path).expect("open sqlite");

    seed_actuals(&mut store, &[1, 2]);
    seed_forecast(&conn, 1, "lgbm", "v2", FULL);
    seed_forecast(&conn, 1, "lgbm", "v1", FULL);
    seed_forecast(&conn, 2, "lgbm", "v1", (Some(4.5), None, Some(59.5)));
    seed_forecast(&conn, 3, "lgbm", "v1", FULL);

    let report = create_analysis_data(&mut store, minute(2_000)).expect("join");

    assert_eq!(report.joined_rows, 3);
    assert_eq!(report.incomplete_forecasts, 1);
    assert_eq!(report.outcome, StageOutcome::Inserted { rows: 2 });
    assert_eq!(
        analytics_keys(&conn),
        vec![
            (
                "2024-01-01 00:01:00".to_string(),
                "lgbm".to_string(),
                "v1".to_string()
            ),
            (
                "2024-01-01 00:01:00".to_string(),
                "lgbm".to_string(),
                "v2".to_string()
            ),
        ]
    );

    let (actual, forecast): (f64, f64) = conn
        .query_row(
            "SELECT power_usage_15_minutes_ahead, power_usage_15_minutes_ahead_forecast
             FROM api_power_usage_analytics WHERE version = 'v1'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("joined row");
    assert_eq!((actual, forecast), (15.0, 14.5));
}

#[test]
fn rerun_without_new_rows_inserts_nothing() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("powerflow.sqlite");
    let mut store = TimeseriesStore::open_path(&path).expect("open store");
    let conn = Connection::open(&path).expect("open sqlite");
    seed_actuals(&mut store, &[1]);
    seed_forecast(&conn, 1, "lgbm", "v1", FULL);

    create_analysis_data(&mut store, minute(2_000)).expect("first run");
    let second = create_analysis_data(&mut store, minute(2_001)).expect("second run");

    assert_eq!(second.outcome, StageOutcome::NoNewRows);
    assert_eq!(second.actual_rows, 0);
    assert_eq!(
        store.count(Table::ApiPowerUsageAnalytics).expect("count"),
        1
    );
}

#[test]
fn watermark_only_moves_forward() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("powerflow.sqlite");
    let mut store = TimeseriesStore::open_path(&path).expect("open store");
    let conn = Connection::open(&path).expect("open sqlite");
    seed_actuals(&mut store, &[5]);
    seed_forecast(&conn, 5, "lgbm", "v1", FULL);
    create_analysis_data(&mut store, minute(2_000)).expect("first run");

    // minute 3 is behind the watermark and is never joined
    seed_actuals(&mut store, &[3, 7]);
    seed_forecast(&conn, 3, "lgbm", "v1", FULL);
    seed_forecast(&conn, 7, "lgbm", "v1", FULL);
    let report = create_analysis_data(&mut store, minute(2_001)).expect("second run");

    assert_eq!(report.watermark_before.as_deref(), Some("2024-01-01 00:05:00"));
    assert_eq!(report.outcome, StageOutcome::Inserted { rows: 1 });
    assert_eq!(
        store.watermark(Table::ApiPowerUsageAnalytics).expect("watermark"),
        Some(minute(7))
    );
    assert_eq!(analytics_keys(&conn).len(), 2);
}

#[test]
fn missing_forecasts_is_no_new_rows() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = PipelineConfig {
        database: DatabaseConfig {
            store_path: tmp.path().join("powerflow.sqlite"),
            ..DatabaseConfig::default()
        },
        ..PipelineConfig::default()
    };
    let mut store = TimeseriesStore::open(&cfg.database).expect("open store");
    seed_actuals(&mut store, &[1, 2, 3]);
    drop(store);

    let report = run_create_analysis_data(&cfg).expect("stage succeeds");
    assert_eq!(report.outcome, StageOutcome::NoNewRows);
    assert_eq!(report.actual_rows, 3);
    assert_eq!(report.forecast_rows, 0);
}
