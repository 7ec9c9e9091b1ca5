//! Application configuration.
//!
//! Settings come from a TOML file and are then overridden by a handful of
//! environment variables. Every field has a default, so an empty file (or
//! no file at all) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use patrol_channel::{ChannelConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONNECT_DELAY};
use patrol_dispatcher::DEFAULT_CAPACITY;
use patrol_position_models::PositionOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reporter::DEFAULT_REPORT_INTERVAL;

/// File read when no `--config` is given. Missing is fine.
pub const DEFAULT_CONFIG_FILE: &str = "patrol.toml";

pub const DEFAULT_SOCKET_URL: &str = "wss://safetnet.site/ws/";
pub const DEFAULT_API_BASE_URL: &str = "https://safetnet-backend.onrender.com";
pub const DEFAULT_ROLE: &str = "security";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: {message}")]
    Value { key: &'static str, message: String },
}

/// Everything the `patrol` binary needs to wire up the alert core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AppConfig {
    /// Real-time alert endpoint. Its path is the channel namespace.
    pub socket_url: String,
    /// Base URL of the REST backend serving geofence definitions.
    pub api_base_url: String,
    /// Bearer token for the REST backend.
    pub api_token: Option<String>,
    /// Officer identity for the alert channel. Empty keeps the channel
    /// offline.
    pub officer_id: String,
    /// Role reported to the alert server alongside the officer id.
    pub role: String,
    /// Delay between alert channel reconnection attempts.
    pub reconnect_delay_ms: u64,
    /// Reconnection attempts before the channel gives up.
    pub max_reconnect_attempts: u32,
    /// Alerts retained in the feed; the oldest are evicted first.
    pub event_capacity: usize,
    /// Zone names assigned to this officer, resolved through the registry.
    pub assigned_zones: Vec<String>,
    /// Sampling options for the position watch.
    pub position: PositionOptions,
    /// Minimum spacing between position reports to the backend. Zero turns
    /// reporting off.
    pub report_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_token: None,
            officer_id: String::new(),
            role: DEFAULT_ROLE.to_string(),
            reconnect_delay_ms: u64::try_from(DEFAULT_RECONNECT_DELAY.as_millis())
                .unwrap_or(1000),
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
            event_capacity: DEFAULT_CAPACITY,
            assigned_zones: Vec::new(),
            position: PositionOptions::default(),
            report_interval_ms: u64::try_from(DEFAULT_REPORT_INTERVAL.as_millis()).unwrap_or(5000),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, or from [`DEFAULT_CONFIG_FILE`] if
    /// it exists, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::Io`] if an explicit `path` cannot be read
    /// * [`ConfigError::Toml`] if the file is not valid configuration
    /// * [`ConfigError::Value`] if an environment override is malformed
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::from_file(default)?
                } else {
                    log::debug!("No {DEFAULT_CONFIG_FILE} found, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Reads and parses one TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable or malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Applies overrides from `lookup` (normally the process environment).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Value`] if `PATROL_ASSIGNED_ZONES` is present
    /// but empty after splitting.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("SOCKET_URL") {
            self.socket_url = url;
        }
        if let Some(url) = lookup("API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(id) = lookup("PATROL_OFFICER_ID") {
            self.officer_id = id;
        }
        if let Some(token) = lookup("PATROL_API_TOKEN") {
            self.api_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(zones) = lookup("PATROL_ASSIGNED_ZONES") {
            let zones: Vec<String> = zones
                .split(',')
                .map(str::trim)
                .filter(|z| !z.is_empty())
                .map(ToString::to_string)
                .collect();
            if zones.is_empty() {
                return Err(ConfigError::Value {
                    key: "PATROL_ASSIGNED_ZONES",
                    message: "no zone names given".to_string(),
                });
            }
            self.assigned_zones = zones;
        }
        Ok(())
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Report spacing, or `None` when reporting is off.
    #[must_use]
    pub const fn report_interval(&self) -> Option<Duration> {
        if self.report_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.report_interval_ms))
        }
    }

    /// Channel settings derived from this configuration.
    #[must_use]
    pub fn channel(&self) -> ChannelConfig {
        let mut channel = ChannelConfig::new(self.socket_url.clone());
        channel.reconnect_delay = self.reconnect_delay();
        channel.max_attempts = self.max_reconnect_attempts;
        channel
    }
}
