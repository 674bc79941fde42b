//! Server configuration loaded from `DCHAT_*` environment variables.
//!
//! # Environment Variables
//!
//! - `DCHAT_BIND_ADDR`: listen address. Default: `0.0.0.0:8081`
//! - `DCHAT_DATABASE_PATH`: libSQL file, or `:memory:`. Default: `data/dchat.db`
//! - `DCHAT_TOKEN_SECRET`: HMAC key for bearer tokens (required, 16+ bytes)
//! - `DCHAT_OUTBOUND_CAPACITY`: per-connection queue size. Default: `256`
//! - `DCHAT_KEEPALIVE_INTERVAL_SECS`: idle time before a ping. Default: `54`
//! - `DCHAT_KEEPALIVE_TIMEOUT_SECS`: pong deadline. Default: `10`
//! - `DCHAT_WRITE_TIMEOUT_SECS`: outbound write deadline. Default: `10`
//! - `DCHAT_MAX_FRAME_BYTES`: largest inbound frame. Default: `524288`
//! - `DCHAT_FAILURE_NOTICE`: `silent` or `notify`. Default: `silent`
//! - `DCHAT_LOG_FORMAT`: `pretty` or `json`. Default: `pretty`

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dchat_realtime::{FailureNotice, HubConfig};
use thiserror::Error;
use tracing::info;

const MIN_SECRET_LEN: usize = 16;

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable console output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Parse a format name (case-insensitive). Unknown names fall back to pretty.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    pub token_secret: String,
    pub outbound_capacity: usize,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub failure_notice: FailureNotice,
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let hub = HubConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = parse_or(&get, "DCHAT_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8081)))?;

        let database_path = match get("DCHAT_DATABASE_PATH") {
            Some(path) if path == ":memory:" => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from("data/dchat.db")),
        };

        let token_secret =
            get("DCHAT_TOKEN_SECRET").ok_or(ConfigError::Missing("DCHAT_TOKEN_SECRET"))?;
        if token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::invalid(
                "DCHAT_TOKEN_SECRET",
                format!("must be at least {MIN_SECRET_LEN} bytes"),
            ));
        }

        let failure_notice = match get("DCHAT_FAILURE_NOTICE") {
            Some(value) => FailureNotice::parse(&value).ok_or_else(|| {
                ConfigError::invalid("DCHAT_FAILURE_NOTICE", format!("unknown policy '{value}'"))
            })?,
            None => hub.failure_notice,
        };

        let config = Self {
            bind_addr,
            database_path,
            token_secret,
            outbound_capacity: parse_or(&get, "DCHAT_OUTBOUND_CAPACITY", hub.outbound_capacity)?,
            keepalive_interval: secs_or(
                &get,
                "DCHAT_KEEPALIVE_INTERVAL_SECS",
                hub.keepalive_interval,
            )?,
            keepalive_timeout: secs_or(
                &get,
                "DCHAT_KEEPALIVE_TIMEOUT_SECS",
                hub.keepalive_timeout,
            )?,
            write_timeout: secs_or(&get, "DCHAT_WRITE_TIMEOUT_SECS", hub.write_timeout)?,
            max_frame_bytes: parse_or(&get, "DCHAT_MAX_FRAME_BYTES", hub.max_frame_bytes)?,
            failure_notice,
            log_format: get("DCHAT_LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
        };

        config
            .hub_config()
            .validate()
            .map_err(|e| ConfigError::invalid("hub settings", e.to_string()))?;
        Ok(config)
    }

    /// Settings handed to the real-time hub.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.outbound_capacity,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            write_timeout: self.write_timeout,
            max_frame_bytes: self.max_frame_bytes,
            failure_notice: self.failure_notice,
            ..HubConfig::default()
        }
    }

    /// Log the effective configuration (secret omitted).
    pub fn log_config(&self) {
        info!(
            bind_addr = %self.bind_addr,
            database = %self
                .database_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string()),
            outbound_capacity = self.outbound_capacity,
            keepalive_interval = ?self.keepalive_interval,
            keepalive_timeout = ?self.keepalive_timeout,
            max_frame_bytes = self.max_frame_bytes,
            failure_notice = %self.failure_notice,
            log_format = %self.log_format,
            "Server configuration"
        );
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("token_secret", &"<redacted>")
            .field("outbound_capacity", &self.outbound_capacity)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("failure_notice", &self.failure_notice)
            .field("log_format", &self.log_format)
            .finish()
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match get(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(var, e.to_string())),
        None => Ok(default),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, var, default.as_secs()).map(Duration::from_secs)
}
