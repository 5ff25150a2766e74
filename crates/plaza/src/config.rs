//! Configuration management for the plaza server.
//!
//! Loads the TOML file, applies defaults for missing fields, validates it and
//! converts it into the core's [`ServerConfig`].

use anyhow::{Context, Result};
use plaza_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// TCP address for login, chat and control traffic
    #[serde(default = "default_reliable_bind_address")]
    pub reliable_bind_address: String,
    /// UDP address for position and state updates
    #[serde(default = "default_unreliable_bind_address")]
    pub unreliable_bind_address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// A client that stops reading for this long is disconnected
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Only sessions that identified themselves may bind a UDP address
    #[serde(default = "default_true")]
    pub bind_unreliable_requires_ready: bool,
}

/// Session aging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_afk_timeout_secs")]
    pub afk_timeout_secs: u64,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

fn default_reliable_bind_address() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_unreliable_bind_address() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_afk_timeout_secs() -> u64 {
    120
}

fn default_session_timeout_secs() -> u64 {
    600
}

fn default_supervisor_interval_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            reliable_bind_address: default_reliable_bind_address(),
            unreliable_bind_address: default_unreliable_bind_address(),
            max_connections: default_max_connections(),
            read_buffer_size: default_read_buffer_size(),
            write_timeout_ms: default_write_timeout_ms(),
            bind_unreliable_requires_ready: true,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            afk_timeout_secs: default_afk_timeout_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
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

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes a default configuration file at
    /// `path` and returns the defaults.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, address) in [
            ("reliable", &self.server.reliable_bind_address),
            ("unreliable", &self.server.unreliable_bind_address),
        ] {
            if address.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid {name} bind address: {address}"));
            }
        }

        if self.session.afk_timeout_secs >= self.session.session_timeout_secs {
            return Err(format!(
                "afk_timeout_secs ({}) must be less than session_timeout_secs ({})",
                self.session.afk_timeout_secs, self.session.session_timeout_secs
            ));
        }
        if self.session.supervisor_interval_ms == 0 {
            return Err("supervisor_interval_ms must be greater than zero".to_string());
        }
        if self.server.max_connections == 0 {
            return Err("max_connections must be greater than zero".to_string());
        }
        if self.server.write_timeout_ms == 0 {
            return Err("write_timeout_ms must be greater than zero".to_string());
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {VALID_LEVELS:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    pub fn to_server_config(&self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            reliable_bind_address: self
                .server
                .reliable_bind_address
                .parse()
                .context("reliable bind address")?,
            unreliable_bind_address: self
                .server
                .unreliable_bind_address
                .parse()
                .context("unreliable bind address")?,
            afk_timeout: Duration::from_secs(self.session.afk_timeout_secs),
            session_timeout: Duration::from_secs(self.session.session_timeout_secs),
            supervisor_interval: Duration::from_millis(self.session.supervisor_interval_ms),
            max_connections: self.server.max_connections,
            read_buffer_size: self.server.read_buffer_size,
            write_timeout: Duration::from_millis(self.server.write_timeout_ms),
            bind_unreliable_requires_ready: self.server.bind_unreliable_requires_ready,
        })
    }
}
