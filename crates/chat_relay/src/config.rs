//! Configuration management for the chat relay.
//!
//! This module handles loading, validation, and conversion of relay
//! configuration from TOML files and command-line arguments.

use crate::cli::CliArgs;
use anyhow::{Context, Result};
use chat_core::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Relay settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Network and behavior settings for the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind to (e.g., "127.0.0.1:8080")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Path that upgrades to a WebSocket session
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Capacity of the event queue feeding the dispatcher
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Per-send timeout in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Seconds of client silence before disconnecting (0 to disable)
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Treat a dropped connection as a `leave`
    #[serde(default = "default_leave_on_disconnect")]
    pub leave_on_disconnect: bool,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_leave_on_disconnect() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ws_path: default_ws_path(),
            max_connections: default_max_connections(),
            event_queue_capacity: default_event_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            idle_timeout_secs: 0,
            leave_on_disconnect: default_leave_on_disconnect(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration file is written at
    /// `path` and the defaults are returned.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Apply command-line overrides on top of the file values.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(bind_address) = &args.bind_address {
            self.server.bind_address = bind_address.clone();
        }
        if let Some(log_level) = &args.log_level {
            self.logging.level = log_level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Validates the settings that the relay core does not check itself.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or a description of the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    /// Converts the file settings into a validated relay core configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let bind_address: SocketAddr = self
            .server
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))?;

        let config = ServerConfig::new(bind_address)
            .with_ws_path(self.server.ws_path.clone())
            .with_max_connections(self.server.max_connections)
            .with_event_queue_capacity(self.server.event_queue_capacity)
            .with_send_timeout_ms(self.server.send_timeout_ms)
            .with_idle_timeout_secs(self.server.idle_timeout_secs)
            .with_leave_on_disconnect(self.server.leave_on_disconnect);
        config.validate()?;
        Ok(config)
    }
}
