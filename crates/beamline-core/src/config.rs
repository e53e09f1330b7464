//! Engine configuration.
//!
//! Settings are layered with figment: built-in defaults, then an optional
//! TOML file, then `BEAMLINE_` prefixed environment variables (nested keys
//! separated by `__`, e.g. `BEAMLINE_LOG__LEVEL=debug`). Durations are written
//! in humantime notation (`"250ms"`, `"10s"`).
//!
//! ```toml
//! device_timeout = "5s"
//! timeout_retries = 1
//! queues = ["primary", "alignment"]
//! scan_number_file = "/var/lib/beamline/scan_number"
//!
//! [log]
//! level = "debug"
//! json = true
//! ```

use crate::limits::{
    COMPLETE_TIMEOUT, DEVICE_TIMEOUT, FLY_POLL_INTERVAL, MAX_POINTS, RETRY_BACKOFF, STAGE_TIMEOUT,
    STREAM_RETENTION,
};
use crate::request::DEFAULT_QUEUE;
use crate::retry::RetryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML, wrong types)
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Semantic validation error
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Logging output settings, applied by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Tunables of the scan engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout of a single move, trigger, read, kickoff or rpc
    #[serde(with = "humantime_serde")]
    pub device_timeout: Duration,
    /// Timeout of stage and unstage
    #[serde(with = "humantime_serde")]
    pub stage_timeout: Duration,
    /// Timeout of a flyer's completion
    #[serde(with = "humantime_serde")]
    pub complete_timeout: Duration,
    /// How often a timed out move or read is retried
    pub timeout_retries: u32,
    /// Delay before such a retry
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Settle time after each move of a step scan
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Flyer progress polling and async readout interval
    #[serde(with = "humantime_serde")]
    pub fly_poll_interval: Duration,
    /// Message bus subscriber capacity
    pub bus_capacity: usize,
    /// Streams kept by the in-process bus; the oldest is dropped beyond this
    pub stream_retention: usize,
    /// Most acquisition points a single scan may request
    pub max_points: u64,
    /// Queues created at startup
    pub queues: Vec<String>,
    /// File keeping the last scan number across restarts; in memory if unset
    pub scan_number_file: Option<PathBuf>,
    /// Move motors back to their start positions after a step scan
    pub return_to_start: bool,
    /// Logging output
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_timeout: DEVICE_TIMEOUT,
            stage_timeout: STAGE_TIMEOUT,
            complete_timeout: COMPLETE_TIMEOUT,
            timeout_retries: 1,
            retry_backoff: RETRY_BACKOFF,
            settle_time: Duration::ZERO,
            fly_poll_interval: FLY_POLL_INTERVAL,
            bus_capacity: 4096,
            stream_retention: STREAM_RETENTION,
            max_points: MAX_POINTS,
            queues: vec![DEFAULT_QUEUE.to_string()],
            scan_number_file: None,
            return_to_start: false,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load defaults, an optional TOML file and `BEAMLINE_` environment overrides.
    ///
    /// # Errors
    ///
    /// `NotFound` if `path` is given but missing, `ParseError` if a layer does
    /// not deserialize, `ValidationError` if the result is inconsistent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            debug!("Loading engine config from: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        let config: EngineConfig = figment
            .merge(Env::prefixed("BEAMLINE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// `ValidationError` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_timeout.is_zero() || self.stage_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "device and stage timeouts must be positive".into(),
            ));
        }
        if self.complete_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "complete_timeout must be positive".into(),
            ));
        }
        if self.fly_poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "fly_poll_interval must be positive".into(),
            ));
        }
        if self.bus_capacity == 0 || self.stream_retention == 0 {
            return Err(ConfigError::ValidationError(
                "bus_capacity and stream_retention must be positive".into(),
            ));
        }
        if self.max_points == 0 {
            return Err(ConfigError::ValidationError(
                "max_points must be positive".into(),
            ));
        }
        let mut names = self.queues.clone();
        names.sort();
        names.dedup();
        if names.len() != self.queues.len() || names.iter().any(String::is_empty) {
            return Err(ConfigError::ValidationError(
                "queue names must be unique and non-empty".into(),
            ));
        }
        Ok(())
    }

    /// Retry policy applied to timed out moves and reads.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.timeout_retries,
            backoff_delay: self.retry_backoff,
        }
    }
}
