//! Relational store for bucketed actuals, horizon targets, forecasts and the
//! analytics join.
//!
//! Backed by SQLite. Destination tables carry a uniqueness constraint on
//! their natural key and inserts ignore conflicts; every insert batch runs in
//! a single transaction that commits once.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::analytics::{ActualRow, AnalyticsRow, ForecastRow};
use crate::config::DatabaseConfig;
use crate::targets::{PowerConsumptionRow, SeriesPoint};
use crate::timefmt::{format_micros, format_store, parse_timestamp};
use crate::timeseries::TimeBucket;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open relational store at {path}: {message}")]
    Open { path: PathBuf, message: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("table {table} holds unparseable timestamp '{value}'")]
    InvalidTimestamp { table: &'static str, value: String },
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    ElectricityTimeseries,
    PowerConsumption,
    ApiPowerUsage,
    ApiPowerUsageAnalytics,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Self::ElectricityTimeseries => "electricity_timeseries",
            Self::PowerConsumption => "power_consumption",
            Self::ApiPowerUsage => "api_power_usage",
            Self::ApiPowerUsageAnalytics => "api_power_usage_analytics",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReport {
    pub inserted: u64,
    pub ignored_duplicates: u64,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS electricity_timeseries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL UNIQUE,
        power_usage REAL NOT NULL,
        current REAL NOT NULL,
        voltage REAL NOT NULL,
        created_datetime TEXT NOT NULL,
        updated_datetime TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS power_consumption (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL UNIQUE,
        power_usage_5_minutes_ahead REAL NOT NULL,
        power_usage_15_minutes_ahead REAL NOT NULL,
        power_usage_60_minutes_ahead REAL NOT NULL,
        created_datetime TEXT NOT NULL,
        updated_datetime TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS api_power_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        version TEXT NOT NULL,
        power_usage_5_minutes_ahead REAL,
        power_usage_15_minutes_ahead REAL,
        power_usage_60_minutes_ahead REAL,
        response_status_code INTEGER,
        request TEXT,
        created_datetime TEXT,
        updated_datetime TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_api_power_usage_timestamp ON api_power_usage(timestamp);

    CREATE TABLE IF NOT EXISTS api_power_usage_analytics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        version TEXT NOT NULL,
        power_usage_5_minutes_ahead REAL NOT NULL,
        power_usage_15_minutes_ahead REAL NOT NULL,
        power_usage_60_minutes_ahead REAL NOT NULL,
        power_usage_5_minutes_ahead_forecast REAL NOT NULL,
        power_usage_15_minutes_ahead_forecast REAL NOT NULL,
        power_usage_60_minutes_ahead_forecast REAL NOT NULL,
        created_datetime TEXT NOT NULL,
        updated_datetime TEXT NOT NULL,
        UNIQUE(timestamp, endpoint, version)
    );
";

pub struct TimeseriesStore {
    conn: Connection,
}

impl TimeseriesStore {
    pub fn open(cfg: &DatabaseConfig) -> Result<Self, StoreError> {
        let store = Self::open_path(&cfg.store_path)?;
        info!(
            component = "store",
            event = "store.connect",
            host = %cfg.host,
            port = cfg.port,
            database = %cfg.database,
            user = %cfg.user,
            store_path = %cfg.store_path.display()
        );
        Ok(store)
    }

    pub fn open_path(path: &Path) -> Result<Self, StoreError> {
        let open_err = |message: String| StoreError::Open {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| open_err(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|err| open_err(err.to_string()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )
        .map_err(|err| open_err(err.to_string()))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { conn })
    }

    /// `MAX(timestamp)` of `table`, or `None` when the table is empty.
    pub fn watermark(&self, table: Table) -> Result<Option<NaiveDateTime>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT MAX(timestamp) FROM {}", table.name()),
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        raw.map(|value| {
            parse_timestamp(&value).ok_or(StoreError::InvalidTimestamp {
                table: table.name(),
                value,
            })
        })
        .transpose()
    }

    pub fn count(&self, table: Table) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn insert_buckets(
        &mut self,
        rows: &[TimeBucket],
        now: NaiveDateTime,
    ) -> Result<InsertReport, StoreError> {
        let audit = format_micros(now);
        let tx = self.conn.transaction()?;
        let report = {
            let mut stmt = tx.prepare(
                "
                INSERT INTO electricity_timeseries (
                    timestamp,
                    power_usage,
                    current,
                    voltage,
                    created_datetime,
                    updated_datetime
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ON CONFLICT(timestamp) DO NOTHING
                ",
            )?;
            let mut report = InsertReport::default();
            for row in rows {
                let changed = stmt.execute(params![
                    format_store(row.timestamp),
                    row.power_usage,
                    row.current,
                    row.voltage,
                    audit,
                ])?;
                tally(&mut report, changed);
            }
            report
        };
        commit(tx, Table::ElectricityTimeseries, report)
    }

    pub fn insert_power_consumption(
        &mut self,
        rows: &[PowerConsumptionRow],
        now: NaiveDateTime,
    ) -> Result<InsertReport, StoreError> {
        let audit = format_micros(now);
        let tx = self.conn.transaction()?;
        let report = {
            let mut stmt = tx.prepare(
                "
                INSERT INTO power_consumption (
                    timestamp,
                    power_usage_5_minutes_ahead,
                    power_usage_15_minutes_ahead,
                    power_usage_60_minutes_ahead,
                    created_datetime,
                    updated_datetime
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ON CONFLICT(timestamp) DO NOTHING
                ",
            )?;
            let mut report = InsertReport::default();
            for row in rows {
                let changed = stmt.execute(params![
                    format_store(row.timestamp),
                    row.power_usage_5_minutes_ahead,
                    row.power_usage_15_minutes_ahead,
                    row.power_usage_60_minutes_ahead,
                    audit,
                ])?;
                tally(&mut report, changed);
            }
            report
        };
        commit(tx, Table::PowerConsumption, report)
    }

    pub fn insert_analytics(
        &mut self,
        rows: &[AnalyticsRow],
        now: NaiveDateTime,
    ) -> Result<InsertReport, StoreError> {
        let audit = format_micros(now);
        let tx = self.conn.transaction()?;
        let report = {
            let mut stmt = tx.prepare(
                "
                INSERT INTO api_power_usage_analytics (
                    timestamp,
                    endpoint,
                    version,
                    power_usage_5_minutes_ahead,
                    power_usage_15_minutes_ahead,
                    power_usage_60_minutes_ahead,
                    power_usage_5_minutes_ahead_forecast,
                    power_usage_15_minutes_ahead_forecast,
                    power_usage_60_minutes_ahead_forecast,
                    created_datetime,
                    updated_datetime
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                ON CONFLICT(timestamp, endpoint, version) DO NOTHING
                ",
            )?;
            let mut report = InsertReport::default();
            for row in rows {
                let changed = stmt.execute(params![
                    format_store(row.timestamp),
                    row.endpoint,
                    row.version,
                    row.power_usage_5_minutes_ahead,
                    row.power_usage_15_minutes_ahead,
                    row.power_usage_60_minutes_ahead,
                    row.power_usage_5_minutes_ahead_forecast,
                    row.power_usage_15_minutes_ahead_forecast,
                    row.power_usage_60_minutes_ahead_forecast,
                    audit,
                ])?;
                tally(&mut report, changed);
            }
            report
        };
        commit(tx, Table::ApiPowerUsageAnalytics, report)
    }

    /// `(timestamp, power_usage)` from the bucketed series, ascending,
    /// restricted to `timestamp > after` when given.
    pub fn read_power_usage_series(
        &self,
        after: Option<NaiveDateTime>,
    ) -> Result<Vec<SeriesPoint>, StoreError> {
        let table = Table::ElectricityTimeseries;
        let mut stmt = self.conn.prepare(
            "
            SELECT timestamp, power_usage
            FROM electricity_timeseries
            WHERE ?1 IS NULL OR timestamp > ?1
            ORDER BY timestamp ASC
            ",
        )?;
        let mut rows = stmt.query(params![after.map(format_store)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(SeriesPoint {
                timestamp: read_timestamp(table, row.get(0)?)?,
                power_usage: row.get(1)?,
            });
        }
        Ok(out)
    }

    pub fn read_actuals(&self, after: Option<NaiveDateTime>) -> Result<Vec<ActualRow>, StoreError> {
        let table = Table::PowerConsumption;
        let mut stmt = self.conn.prepare(
            "
            SELECT
                timestamp,
                power_usage_5_minutes_ahead,
                power_usage_15_minutes_ahead,
                power_usage_60_minutes_ahead
            FROM power_consumption
            WHERE ?1 IS NULL OR timestamp > ?1
            ORDER BY timestamp ASC
            ",
        )?;
        let mut rows = stmt.query(params![after.map(format_store)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ActualRow {
                timestamp: read_timestamp(table, row.get(0)?)?,
                power_usage_5_minutes_ahead: row.get(1)?,
                power_usage_15_minutes_ahead: row.get(2)?,
                power_usage_60_minutes_ahead: row.get(3)?,
            });
        }
        Ok(out)
    }

    /// Forecast rows with bookkeeping columns (`response_status_code`,
    /// `request`, audit columns, `id`) left out.
    pub fn read_forecasts(
        &self,
        after: Option<NaiveDateTime>,
    ) -> Result<Vec<ForecastRow>, StoreError> {
        let table = Table::ApiPowerUsage;
        let mut stmt = self.conn.prepare(
            "
            SELECT
                timestamp,
                endpoint,
                version,
                power_usage_5_minutes_ahead,
                power_usage_15_minutes_ahead,
                power_usage_60_minutes_ahead
            FROM api_power_usage
            WHERE ?1 IS NULL OR timestamp > ?1
            ORDER BY timestamp ASC
            ",
        )?;
        let mut rows = stmt.query(params![after.map(format_store)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ForecastRow {
                timestamp: read_timestamp(table, row.get(0)?)?,
                endpoint: row.get(1)?,
                version: row.get(2)?,
                power_usage_5_minutes_ahead_forecast: row.get(3)?,
                power_usage_15_minutes_ahead_forecast: row.get(4)?,
                power_usage_60_minutes_ahead_forecast: row.get(5)?,
            });
        }
        Ok(out)
    }
}

fn tally(report: &mut InsertReport, changed: usize) {
    if changed == 0 {
        report.ignored_duplicates += 1;
    } else {
        report.inserted += changed as u64;
    }
}

fn commit(
    tx: Transaction<'_>,
    table: Table,
    report: InsertReport,
) -> Result<InsertReport, StoreError> {
    tx.commit()?;
    debug!(
        component = "store",
        event = "store.commit",
        table = table.name(),
        inserted = report.inserted,
        ignored_duplicates = report.ignored_duplicates
    );
    Ok(report)
}

fn read_timestamp(table: Table, raw: String) -> Result<NaiveDateTime, StoreError> {
    parse_timestamp(&raw).ok_or(StoreError::InvalidTimestamp {
        table: table.name(),
        value: raw,
    })
}
