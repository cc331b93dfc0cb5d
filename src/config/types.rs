//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub target: TargetConfig,
    pub relay: RelaySettings,
    pub monitoring: MonitoringConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Port to listen on; 0 asks the OS for any free port
    pub port: u16,
}

/// Target endpoint the relay forwards to
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

/// Relay tuning knobs
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Read buffer size per pump, in bytes
    pub buffer_size: usize,
    /// How long the upstream pump sleeps after discarding a chunk in drop mode
    #[serde(with = "humantime_serde")]
    pub drop_poll_interval: Duration,
    /// Upper bound on how long `stop` waits for active connections to drain
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Start with upstream drop mode already engaged
    pub start_blocked: bool,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            target: TargetConfig::default(),
            relay: RelaySettings::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { port: 0 }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9092,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            drop_poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            start_blocked: false,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
