//! Configuration management for the universe host.
//!
//! This module handles loading, validation, and conversion of the host
//! configuration from TOML files into the library's [`ServerConfig`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use universe_server::access::Account;
use universe_server::config::{default_hub_workers, WorldSettings};
use universe_server::world::{Fidelity, FidelitySettings};
use universe_server::ServerConfig;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub world: WorldSection,
    /// Named accounts, keyed by account name
    #[serde(default)]
    pub accounts: HashMap<String, Account>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Network, identity and timing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    /// Network address to bind the listener to (e.g., "0.0.0.0:21025")
    pub bind_address: String,
    #[serde(default = "default_true")]
    pub listen: bool,
    /// Maximum number of concurrent remote clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Directory for client contexts and world snapshots
    #[serde(default = "default_storage_directory")]
    pub storage_directory: String,
    /// Stable server identity; a random one is used when unset
    #[serde(default)]
    pub server_uuid: Option<Uuid>,
    /// Connection hub workers; derived from the CPU count when unset
    #[serde(default)]
    pub hub_workers: Option<usize>,
    #[serde(default = "default_pool_workers")]
    pub pool_workers: usize,
    #[serde(default = "default_true")]
    pub allow_compression: bool,
    #[serde(default)]
    pub asset_digest: String,
    #[serde(default)]
    pub allow_asset_mismatch: bool,
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_main_loop_interval")]
    pub main_loop_interval_ms: u64,
    #[serde(default = "default_time_broadcast")]
    pub time_broadcast_secs: u64,
    #[serde(default = "default_client_persist")]
    pub client_persist_secs: u64,
}

/// World lifecycle and simulation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldSection {
    /// World updates per second
    pub tick_rate: f64,
    pub initial_fidelity: Fidelity,
    /// Forward world output right after each world update
    pub immediate_forwarding: bool,
    pub idle_timeout_secs: u64,
    pub broken_retention_secs: u64,
    pub flight_debounce_ms: u64,
    pub temp_sweep_secs: u64,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_clients() -> usize {
    8
}

fn default_storage_directory() -> String {
    "storage".to_string()
}

fn default_pool_workers() -> usize {
    2
}

fn default_handshake_timeout() -> u64 {
    15
}

/// Default for connection_timeout_secs
pub fn default_connection_timeout() -> u64 {
    60
}

fn default_main_loop_interval() -> u64 {
    10
}

fn default_time_broadcast() -> u64 {
    5
}

fn default_client_persist() -> u64 {
    60
}

impl Default for WorldSection {
    fn default() -> Self {
        Self {
            tick_rate: 60.0,
            initial_fidelity: Fidelity::High,
            immediate_forwarding: true,
            idle_timeout_secs: 30,
            broken_retention_secs: 60,
            flight_debounce_ms: 500,
            temp_sweep_secs: 60,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: "0.0.0.0:21025".to_string(),
                listen: true,
                max_clients: default_max_clients(),
                storage_directory: default_storage_directory(),
                server_uuid: None,
                hub_workers: None,
                pool_workers: default_pool_workers(),
                allow_compression: true,
                asset_digest: String::new(),
                allow_asset_mismatch: false,
                allow_anonymous: true,
                handshake_timeout_secs: default_handshake_timeout(),
                connection_timeout_secs: default_connection_timeout(),
                main_loop_interval_ms: default_main_loop_interval(),
                time_broadcast_secs: default_time_broadcast(),
                client_persist_secs: default_client_persist(),
            },
            world: WorldSection::default(),
            accounts: HashMap::new(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the
    /// specified path and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if loading/creation failed.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("📝 Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the application configuration to the universe server configuration.
    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        let server = &self.server;
        let world = &self.world;
        Ok(ServerConfig {
            bind_address: server.bind_address.parse()?,
            listening_enabled: server.listen,
            max_clients: server.max_clients,
            storage_directory: PathBuf::from(&server.storage_directory),
            hub_workers: server.hub_workers.unwrap_or_else(default_hub_workers),
            pool_workers: server.pool_workers,
            server_uuid: server.server_uuid.unwrap_or_else(Uuid::new_v4),
            allow_compression: server.allow_compression,
            asset_digest: server.asset_digest.clone(),
            allow_asset_mismatch: server.allow_asset_mismatch,
            allow_anonymous: server.allow_anonymous,
            accounts: self.accounts.clone(),
            handshake_timeout: Duration::from_secs(server.handshake_timeout_secs),
            connection_timeout: Duration::from_secs(server.connection_timeout_secs),
            main_loop_interval: Duration::from_millis(server.main_loop_interval_ms),
            time_broadcast_interval: Duration::from_secs(server.time_broadcast_secs),
            client_persist_interval: Duration::from_secs(server.client_persist_secs),
            world: WorldSettings {
                tick_rate: world.tick_rate,
                fidelity: FidelitySettings {
                    initial: world.initial_fidelity,
                    ..FidelitySettings::default()
                },
                immediate_forwarding: world.immediate_forwarding,
            },
            world_idle_timeout: Duration::from_secs(world.idle_timeout_secs),
            broken_world_retention: Duration::from_secs(world.broken_retention_secs),
            flight_debounce: Duration::from_millis(world.flight_debounce_ms),
            temp_world_sweep_interval: Duration::from_secs(world.temp_sweep_secs),
            ..ServerConfig::default()
        })
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }
        if self.server.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.server.storage_directory.is_empty() {
            return Err("Storage directory cannot be empty".to_string());
        }
        if self.server.pool_workers == 0 || self.server.hub_workers == Some(0) {
            return Err("Worker counts must be at least 1".to_string());
        }
        if self.server.main_loop_interval_ms == 0 {
            return Err("main_loop_interval_ms must be positive".to_string());
        }
        if !(self.world.tick_rate > 0.0 && self.world.tick_rate <= 1000.0) {
            return Err(format!("World tick rate {} is out of range (0, 1000]", self.world.tick_rate));
        }
        if let Some((name, _)) = self.accounts.iter().find(|(_, account)| account.password.is_empty()) {
            return Err(format!("Account {name} has an empty password"));
        }
        if !self.server.allow_anonymous && self.accounts.is_empty() {
            return Err("Anonymous connections are disabled but no accounts are configured".to_string());
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
}
