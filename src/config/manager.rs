//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        // Override with environment variables if present
        if let Ok(port) = std::env::var("FAULTRELAY_LISTEN_PORT") {
            config.listener.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid FAULTRELAY_LISTEN_PORT: {}", port))?;
        }

        if let Ok(host) = std::env::var("FAULTRELAY_TARGET_HOST") {
            config.target.host = host;
        }

        if let Ok(port) = std::env::var("FAULTRELAY_TARGET_PORT") {
            config.target.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid FAULTRELAY_TARGET_PORT: {}", port))?;
        }

        if let Ok(buffer_size) = std::env::var("FAULTRELAY_BUFFER_SIZE") {
            config.relay.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid FAULTRELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(interval) = std::env::var("FAULTRELAY_DROP_POLL_INTERVAL") {
            config.relay.drop_poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid FAULTRELAY_DROP_POLL_INTERVAL: {}", interval))?;
        }

        if let Ok(timeout) = std::env::var("FAULTRELAY_SHUTDOWN_TIMEOUT") {
            config.relay.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid FAULTRELAY_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("FAULTRELAY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_target_config()
            .with_context(|| "Target configuration validation failed")?;

        self.validate_relay_settings()
            .with_context(|| "Relay settings validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    /// Validate target configuration
    fn validate_target_config(&self) -> Result<()> {
        if self.target.host.is_empty() {
            bail!("target.host must not be empty");
        }

        if self.target.port == 0 {
            bail!("target.port must be greater than 0");
        }

        Ok(())
    }

    /// Validate relay settings
    fn validate_relay_settings(&self) -> Result<()> {
        if self.relay.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if self.relay.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.relay.drop_poll_interval.is_zero() {
            bail!("drop_poll_interval must be greater than 0");
        }

        if self.relay.drop_poll_interval > std::time::Duration::from_secs(10) {
            bail!("drop_poll_interval cannot exceed 10 seconds");
        }

        if self.relay.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        Ok(())
    }

    /// Validate monitoring configuration
    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        listen_port: Option<u16>,
        target_host: Option<&str>,
        target_port: Option<u16>,
        buffer_size: Option<usize>,
        start_blocked: bool,
    ) {
        if let Some(port) = listen_port {
            self.listener.port = port;
            tracing::info!("CLI override: listen port set to {}", port);
        }

        if let Some(host) = target_host {
            self.target.host = host.to_string();
            tracing::info!("CLI override: target host set to {}", host);
        }

        if let Some(port) = target_port {
            self.target.port = port;
            tracing::info!("CLI override: target port set to {}", port);
        }

        if let Some(buffer_size) = buffer_size {
            self.relay.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if start_blocked {
            self.relay.start_blocked = true;
            tracing::info!("CLI override: starting with upstream drop mode engaged");
        }
    }
}
