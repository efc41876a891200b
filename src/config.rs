//! Central pipeline configuration, resolved once and passed to every stage.

use std::env;
use std::path::PathBuf;

use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::features::FeatureEncoding;

pub const DEFAULT_DATASET_PATH: &str = "aggregated_features";
pub const DEFAULT_RAW_PREFIX: &str = "flexitricity/";
pub const DEFAULT_DB_HOST: &str = "localhost";
pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_DB_NAME: &str = "default_db";
pub const DEFAULT_DB_USER: &str = "default_user";
pub const DEFAULT_DB_PASSWORD: &str = "default_pass";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    pub connection_string: Option<String>,
    pub container: Option<String>,
    pub dataset_path: String,
    pub raw_prefix: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            container: None,
            dataset_path: DEFAULT_DATASET_PATH.to_string(),
            raw_prefix: DEFAULT_RAW_PREFIX.to_string(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub store_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            database: DEFAULT_DB_NAME.to_string(),
            user: DEFAULT_DB_USER.to_string(),
            password: DEFAULT_DB_PASSWORD.to_string(),
            store_path: default_store_path(DEFAULT_DB_NAME),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("store_path", &self.store_path)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub object_store: ObjectStoreConfig,
    pub database: DatabaseConfig,
    pub feature_encoding: FeatureEncoding,
    pub timezone: Tz,
    pub delta_hours: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            object_store: ObjectStoreConfig::default(),
            database: DatabaseConfig::default(),
            feature_encoding: FeatureEncoding::Calendar,
            timezone: Tz::UTC,
            delta_hours: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("unknown feature encoding '{0}' (expected calendar or cyclical)")]
    UnknownEncoding(String),
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves every recognized key through `lookup`.
    ///
    /// Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let object_store = ObjectStoreConfig {
            connection_string: get("AZURE_BLOB_CONNECTION_STRING"),
            container: get("AZURE_BLOB_CONTAINER_NAME"),
            dataset_path: get("AZURE_ML_DATASET_PATH")
                .map(|path| path.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_DATASET_PATH.to_string()),
            raw_prefix: get("POWERFLOW_RAW_PREFIX").unwrap_or_else(|| DEFAULT_RAW_PREFIX.to_string()),
        };

        let port = match get("PSQL_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                key: "PSQL_PORT",
                value: raw.clone(),
            })?,
            None => DEFAULT_DB_PORT,
        };
        let database_name = get("PSQL_DATABASE").unwrap_or_else(|| DEFAULT_DB_NAME.to_string());
        let store_path = get("POWERFLOW_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_store_path(&database_name));
        let database = DatabaseConfig {
            host: get("PSQL_HOST").unwrap_or_else(|| DEFAULT_DB_HOST.to_string()),
            port,
            database: database_name,
            user: get("PSQL_USER").unwrap_or_else(|| DEFAULT_DB_USER.to_string()),
            password: get("PSQL_PASSWORD").unwrap_or_else(|| DEFAULT_DB_PASSWORD.to_string()),
            store_path,
        };

        let feature_encoding = match get("POWERFLOW_FEATURE_ENCODING") {
            Some(raw) => FeatureEncoding::parse(&raw).ok_or(ConfigError::UnknownEncoding(raw))?,
            None => FeatureEncoding::Calendar,
        };

        let timezone = match get("POWERFLOW_TIMEZONE") {
            Some(raw) => raw
                .parse::<Tz>()
                .map_err(|_| ConfigError::UnknownTimezone(raw.clone()))?,
            None => Tz::UTC,
        };

        let delta_hours = get("POWERFLOW_DELTA_HOURS")
            .map(|raw| {
                raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                    key: "POWERFLOW_DELTA_HOURS",
                    value: raw.clone(),
                })
            })
            .transpose()?;

        Ok(Self {
            object_store,
            database,
            feature_encoding,
            timezone,
            delta_hours,
        })
    }

    /// Current wall-clock time in the configured timezone.
    pub fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.timezone).naive_local()
    }
}

fn default_store_path(database: &str) -> PathBuf {
    PathBuf::from("data").join(format!("{database}.sqlite"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn documented_defaults_apply_when_nothing_is_set() {
        let cfg = PipelineConfig::from_lookup(|_| None).expect("config should resolve");

        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.database.host, "localhost");
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.database.database, "default_db");
        assert_eq!(cfg.database.user, "default_user");
        assert_eq!(cfg.database.password, "default_pass");
        assert_eq!(cfg.database.store_path, PathBuf::from("data/default_db.sqlite"));
        assert_eq!(cfg.object_store.raw_prefix, "flexitricity/");
        assert!(cfg.object_store.connection_string.is_none());
        assert!(cfg.delta_hours.is_none());
    }

    #[test]
    fn parses_every_recognized_key() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[
            ("AZURE_BLOB_CONNECTION_STRING", "file:///srv/blobs"),
            ("AZURE_BLOB_CONTAINER_NAME", "telemetry"),
            ("AZURE_ML_DATASET_PATH", "datasets/features/"),
            ("POWERFLOW_RAW_PREFIX", "meters/"),
            ("PSQL_HOST", "db.internal"),
            ("PSQL_PORT", "6543"),
            ("PSQL_DATABASE", "grid"),
            ("PSQL_USER", "etl"),
            ("PSQL_PASSWORD", "secret"),
            ("POWERFLOW_FEATURE_ENCODING", "Cyclical"),
            ("POWERFLOW_TIMEZONE", "Europe/London"),
            ("POWERFLOW_DELTA_HOURS", "24"),
        ]))
        .expect("config should resolve");

        assert_eq!(
            cfg.object_store.connection_string.as_deref(),
            Some("file:///srv/blobs")
        );
        assert_eq!(cfg.object_store.container.as_deref(), Some("telemetry"));
        assert_eq!(cfg.object_store.dataset_path, "datasets/features");
        assert_eq!(cfg.object_store.raw_prefix, "meters/");
        assert_eq!(cfg.database.port, 6543);
        assert_eq!(cfg.database.store_path, PathBuf::from("data/grid.sqlite"));
        assert_eq!(cfg.feature_encoding, FeatureEncoding::Cyclical);
        assert_eq!(cfg.timezone, chrono_tz::Europe::London);
        assert_eq!(cfg.delta_hours, Some(24));
    }

    #[test]
    fn explicit_store_path_wins_over_database_name() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[
            ("PSQL_DATABASE", "grid"),
            ("POWERFLOW_STORE_PATH", "/tmp/power.sqlite"),
        ]))
        .expect("config should resolve");

        assert_eq!(cfg.database.store_path, PathBuf::from("/tmp/power.sqlite"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("PSQL_PORT", "not-a-port")]))
            .expect_err("config should be rejected");
        assert!(matches!(err, ConfigError::InvalidValue { key: "PSQL_PORT", .. }));

        let err =
            PipelineConfig::from_lookup(lookup_from(&[("POWERFLOW_FEATURE_ENCODING", "fourier")]))
                .expect_err("config should be rejected");
        assert_eq!(err, ConfigError::UnknownEncoding("fourier".to_string()));

        let err = PipelineConfig::from_lookup(lookup_from(&[("POWERFLOW_TIMEZONE", "Mars/Base")]))
            .expect_err("config should be rejected");
        assert_eq!(err, ConfigError::UnknownTimezone("Mars/Base".to_string()));

        let err = PipelineConfig::from_lookup(lookup_from(&[("POWERFLOW_DELTA_HOURS", "-3")]))
            .expect_err("config should be rejected");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "POWERFLOW_DELTA_HOURS",
                ..
            }
        ));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[
            ("PSQL_HOST", "   "),
            ("AZURE_BLOB_CONTAINER_NAME", ""),
        ]))
        .expect("config should resolve");

        assert_eq!(cfg.database.host, "localhost");
        assert!(cfg.object_store.container.is_none());
    }

    #[test]
    fn from_env_reads_process_environment() {
        let cfg = crate::observability::tests::with_env_vars(
            &[
                ("PSQL_HOST", Some("env-host")),
                ("PSQL_PORT", None),
                ("POWERFLOW_FEATURE_ENCODING", None),
                ("POWERFLOW_TIMEZONE", None),
                ("POWERFLOW_DELTA_HOURS", None),
            ],
            PipelineConfig::from_env,
        )
        .expect("env config should resolve");

        assert_eq!(cfg.database.host, "env-host");
        assert_eq!(cfg.database.port, 5432);
    }

    #[test]
    fn debug_output_redacts_password() {
        let rendered = format!("{:?}", DatabaseConfig::default());
        assert!(!rendered.contains("default_pass"));
        assert!(rendered.contains("<redacted>"));
    }
}
