//! Bridge configuration.
//!
//! Loaded from a TOML file. Out-of-range numeric settings are clamped back
//! to their defaults with a warning; they are never fatal. Device rows are
//! different: an invalid row aborts startup, which is the registry's job to
//! enforce.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

fn default_broker_port() -> u16 {
    1886
}

fn default_broker_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_telemetry_min_interval_secs() -> u64 {
    30
}

fn default_poll_timeout_ms() -> u64 {
    6000
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

/// One configured device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRow {
    /// Display name. Sanitized into the stable device key.
    pub name: String,
    /// IPv4 address of the device on the local network.
    pub ip: String,
    /// Scheme used for the poll channel.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Port of the device's HTTP remote-control endpoint.
    pub port: u16,
    /// Password for the poll channel and push-channel authentication.
    pub password: String,
    /// Disabled devices keep their stored points but get no transports.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// TCP port the embedded broker listens on.
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Address the embedded broker binds.
    #[serde(default = "default_broker_listen")]
    pub broker_listen: String,
    /// Username devices must present on the push channel.
    #[serde(default)]
    pub broker_username: String,
    /// Password devices must present on the push channel.
    #[serde(default)]
    pub broker_password: String,
    /// Accept any credentials on the push channel (address checks still
    /// apply).
    #[serde(default)]
    pub skip_credential_check: bool,
    /// Minimum seconds between accepted telemetry snapshots per session.
    #[serde(default = "default_telemetry_min_interval_secs")]
    pub telemetry_min_interval_secs: u64,
    /// Poll-channel request timeout in milliseconds.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Seconds between scheduled info polls per device.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Write telemetry values even when unchanged (refreshes timestamps).
    #[serde(default)]
    pub update_unchanged_values: bool,
    /// Materialize event points for the well-known event names at startup
    /// instead of on first occurrence.
    #[serde(default)]
    pub create_default_event_points: bool,
    /// Configured devices.
    #[serde(default)]
    pub devices: Vec<DeviceRow>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker_port: default_broker_port(),
            broker_listen: default_broker_listen(),
            broker_username: String::new(),
            broker_password: String::new(),
            skip_credential_check: false,
            telemetry_min_interval_secs: default_telemetry_min_interval_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            update_unchanged_values: false,
            create_default_event_points: false,
            devices: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load a configuration from a TOML file and normalize it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;
        config.normalize();
        Ok(config)
    }

    /// Clamp out-of-range settings back to their defaults, with a warning.
    pub fn normalize(&mut self) {
        if self.broker_port == 0 {
            tracing::warn!(
                port = self.broker_port,
                "broker port out of range, using default 1886"
            );
            self.broker_port = default_broker_port();
        }
        if self.telemetry_min_interval_secs < 2 || self.telemetry_min_interval_secs > 120 {
            tracing::warn!(
                interval = self.telemetry_min_interval_secs,
                "telemetry interval outside 2-120 s, using default 30"
            );
            self.telemetry_min_interval_secs = default_telemetry_min_interval_secs();
        }
        if self.poll_timeout_ms < 500 || self.poll_timeout_ms > 15_000 {
            tracing::warn!(
                timeout_ms = self.poll_timeout_ms,
                "poll timeout outside 500-15000 ms, using default 6000"
            );
            self.poll_timeout_ms = default_poll_timeout_ms();
        }
        if self.poll_interval_secs < 2 {
            tracing::warn!(
                interval = self.poll_interval_secs,
                "poll interval below 2 s, using default 60"
            );
            self.poll_interval_secs = default_poll_interval_secs();
        }
    }

    pub fn telemetry_min_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_min_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
