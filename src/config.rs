use std::path::PathBuf;

use thiserror::Error;

use crate::engine::{AssignmentPolicy, SchedulingConfig};
use crate::model::{BookingStatus, BusinessClock};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var}: {reason}")]
    OutOfRange { var: &'static str, reason: &'static str },
}

/// Process settings, read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub utc_offset_minutes: i32,
    pub initial_status: BookingStatus,
    pub policy: AssignmentPolicy,
    pub allow_closing_overrun: bool,
    pub metrics_port: Option<u16>,
    pub log_json: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "chairtime".into(),
            max_connections: 256,
            compact_threshold: 1000,
            utc_offset_minutes: 0,
            initial_status: BookingStatus::Confirmed,
            policy: AssignmentPolicy::FirstFit,
            allow_closing_overrun: false,
            metrics_port: None,
            log_json: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let utc_offset_minutes = parse_or(
            get("CHAIRTIME_UTC_OFFSET_MINUTES"),
            "CHAIRTIME_UTC_OFFSET_MINUTES",
            d.utc_offset_minutes,
        )?;
        if BusinessClock::from_offset_minutes(utc_offset_minutes).is_none() {
            return Err(ConfigError::OutOfRange {
                var: "CHAIRTIME_UTC_OFFSET_MINUTES",
                reason: "offset must be within ±24h",
            });
        }
        let max_connections = parse_or(
            get("CHAIRTIME_MAX_CONNECTIONS"),
            "CHAIRTIME_MAX_CONNECTIONS",
            d.max_connections,
        )?;
        if max_connections == 0 {
            return Err(ConfigError::OutOfRange {
                var: "CHAIRTIME_MAX_CONNECTIONS",
                reason: "must be at least 1",
            });
        }

        let initial_status = match get("CHAIRTIME_INITIAL_STATUS") {
            None => d.initial_status,
            Some(v) => match BookingStatus::parse(&v) {
                Some(s @ (BookingStatus::Pending | BookingStatus::Confirmed)) => s,
                _ => return Err(invalid("CHAIRTIME_INITIAL_STATUS", v)),
            },
        };
        let policy = match get("CHAIRTIME_ASSIGNMENT_POLICY") {
            None => d.policy,
            Some(v) => AssignmentPolicy::parse(&v)
                .ok_or_else(|| invalid("CHAIRTIME_ASSIGNMENT_POLICY", v))?,
        };

        Ok(Self {
            port: parse_or(get("CHAIRTIME_PORT"), "CHAIRTIME_PORT", d.port)?,
            bind: get("CHAIRTIME_BIND").unwrap_or(d.bind),
            data_dir: get("CHAIRTIME_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("CHAIRTIME_PASSWORD").unwrap_or(d.password),
            max_connections,
            compact_threshold: parse_or(
                get("CHAIRTIME_COMPACT_THRESHOLD"),
                "CHAIRTIME_COMPACT_THRESHOLD",
                d.compact_threshold,
            )?,
            utc_offset_minutes,
            initial_status,
            policy,
            allow_closing_overrun: parse_flag(
                get("CHAIRTIME_ALLOW_CLOSING_OVERRUN"),
                "CHAIRTIME_ALLOW_CLOSING_OVERRUN",
            )?,
            metrics_port: get("CHAIRTIME_METRICS_PORT")
                .map(|v| v.trim().parse().map_err(|_| invalid("CHAIRTIME_METRICS_PORT", v)))
                .transpose()?,
            log_json: parse_flag(get("CHAIRTIME_LOG_JSON"), "CHAIRTIME_LOG_JSON")?,
            tls_cert: get("CHAIRTIME_TLS_CERT"),
            tls_key: get("CHAIRTIME_TLS_KEY"),
        })
    }

    /// The engine-facing subset.
    pub fn scheduling(&self) -> SchedulingConfig {
        SchedulingConfig {
            clock: BusinessClock::from_offset_minutes(self.utc_offset_minutes)
                .unwrap_or_else(BusinessClock::utc),
            initial_status: self.initial_status,
            policy: self.policy,
            allow_closing_overrun: self.allow_closing_overrun,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("chairtime.wal")
    }
}

fn invalid(var: &'static str, value: String) -> ConfigError {
    ConfigError::Invalid { var, value }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| invalid(var, v)),
    }
}

fn parse_flag(value: Option<String>, var: &'static str) -> Result<bool, ConfigError> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(var, v)),
        },
    }
}
