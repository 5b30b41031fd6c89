use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::EngineOptions;
use crate::limits::{DEFAULT_BOOKING_HORIZON_MS, DEFAULT_MAX_QUERY_WINDOW_MS};
use crate::model::{DAY_MS, Ms};

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {key}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Server settings, read once from `WASCHPLAN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub admins: HashSet<String>,
    pub booking_horizon: Option<Ms>,
    pub max_query_window: Ms,
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { key, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults; set but
    /// unparsable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let admins = lookup("WASCHPLAN_ADMINS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let booking_horizon = match parsed::<u32>(&lookup, "WASCHPLAN_BOOKING_HORIZON_DAYS")? {
            None => Some(DEFAULT_BOOKING_HORIZON_MS),
            Some(0) => None,
            Some(days) => Some(days as Ms * DAY_MS),
        };
        let max_query_window = match parsed::<u32>(&lookup, "WASCHPLAN_MAX_QUERY_DAYS")? {
            None | Some(0) => DEFAULT_MAX_QUERY_WINDOW_MS,
            Some(days) => days as Ms * DAY_MS,
        };

        Ok(Self {
            port: parsed(&lookup, "WASCHPLAN_PORT")?.unwrap_or(5433),
            bind: lookup("WASCHPLAN_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("WASCHPLAN_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: lookup("WASCHPLAN_PASSWORD").unwrap_or_else(|| "waschplan".into()),
            max_connections: parsed(&lookup, "WASCHPLAN_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "WASCHPLAN_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&lookup, "WASCHPLAN_METRICS_PORT")?,
            tls_cert: lookup("WASCHPLAN_TLS_CERT"),
            tls_key: lookup("WASCHPLAN_TLS_KEY"),
            admins,
            booking_horizon,
            max_query_window,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            admins: self.admins.clone(),
            booking_horizon: self.booking_horizon,
            max_query_window: self.max_query_window,
        }
    }
}
