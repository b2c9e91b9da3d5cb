//! Configuration management for minewatch.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::risk::ThresholdTable;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default configuration directory name.
const CONFIG_DIR_NAME: &str = "minewatch";

/// Environment variable prefix.
const ENV_PREFIX: &str = "MINEWATCH_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `MINEWATCH_`, `__` between sections)
/// 2. TOML config file at `~/.config/minewatch/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection configuration.
    pub broker: BrokerConfig,
    /// Aggregation configuration.
    pub pipeline: PipelineConfig,
    /// Risk thresholds.
    pub thresholds: ThresholdTable,
    /// Fallback simulation configuration.
    pub simulation: SimulationConfig,
    /// External model configuration.
    pub delegate: DelegateConfig,
    /// Alert log configuration.
    pub alerts: AlertConfig,
    /// Snapshot server configuration.
    pub server: ServerConfig,
}

/// Broker-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Topic carrying helmet telemetry.
    pub topic: String,
    /// MQTT client id.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Fixed delay between reconnect attempts in milliseconds.
    pub reconnect_backoff_ms: u64,
    /// Capacity of the queue between the receive loop and the store writer.
    pub channel_capacity: usize,
}

/// Aggregation-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Interval between snapshots in milliseconds.
    pub tick_interval_ms: u64,
    /// Maximum age of a live reading before fallback, in milliseconds.
    pub staleness_window_ms: u64,
    /// Readings kept per helmet.
    pub history_capacity: usize,
    /// Maximum number of helmets tracked.
    pub max_helmets: usize,
    /// Helmets expected on shift; always present in snapshots.
    pub roster: Vec<RosterEntry>,
}

/// A rostered helmet and who wears it.
///
/// Deserializes from a bare id (`"HELMET_001"`) or a table
/// (`{ id = "HELMET_001", miner = "John Smith", location = "Tunnel A-1" }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RosterEntryRepr")]
pub struct RosterEntry {
    /// Helmet id.
    pub id: String,
    /// Miner assigned to the helmet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miner: Option<String>,
    /// Where the miner is stationed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RosterEntryRepr {
    Id(String),
    Entry {
        id: String,
        #[serde(default)]
        miner: Option<String>,
        #[serde(default)]
        location: Option<String>,
    },
}

impl From<RosterEntryRepr> for RosterEntry {
    fn from(repr: RosterEntryRepr) -> Self {
        match repr {
            RosterEntryRepr::Id(id) => Self::from(id),
            RosterEntryRepr::Entry {
                id,
                miner,
                location,
            } => Self {
                id,
                miner,
                location,
            },
        }
    }
}

impl RosterEntry {
    /// An entry with a miner and location.
    #[must_use]
    pub fn assigned(id: impl Into<String>, miner: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            miner: Some(miner.into()),
            location: Some(location.into()),
        }
    }
}

impl From<String> for RosterEntry {
    fn from(id: String) -> Self {
        Self {
            id,
            miner: None,
            location: None,
        }
    }
}

impl From<&str> for RosterEntry {
    fn from(id: &str) -> Self {
        Self::from(id.to_string())
    }
}

/// Simulation-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Substitute simulated readings for stale helmets.
    pub enabled: bool,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
}

/// External model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    /// Consult the external model.
    pub enabled: bool,
    /// Program to run.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Per-prediction timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Alert log configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Maximum number of alerts kept in memory.
    pub capacity: usize,
}

/// Snapshot server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve snapshots over HTTP.
    pub enabled: bool,
    /// Address to bind.
    pub bind_addr: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            topic: "wokwi/coalmine/sensors".to_string(),
            client_id: "minewatch".to_string(),
            keep_alive_secs: 60,
            reconnect_backoff_ms: 5_000,
            channel_capacity: 256,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            staleness_window_ms: 5_000,
            history_capacity: crate::store::DEFAULT_HISTORY_CAPACITY,
            max_helmets: 50,
            roster: default_roster(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed: None,
        }
    }
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: String::new(),
            args: Vec::new(),
            timeout_ms: 500,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "127.0.0.1:8050".to_string(),
        }
    }
}

/// Default helmet roster.
fn default_roster() -> Vec<RosterEntry> {
    [
        ("HELMET_001", "John Smith", "Tunnel A-1"),
        ("HELMET_002", "Maria Garcia", "Tunnel A-2"),
        ("HELMET_003", "David Chen", "Tunnel B-1"),
        ("HELMET_004", "Sarah Johnson", "Tunnel B-2"),
        ("HELMET_005", "Michael Brown", "Tunnel C-1"),
        ("HELMET_006", "Lisa Wilson", "Tunnel C-2"),
        ("HELMET_007", "Robert Davis", "Central Hub"),
        ("HELMET_008", "Emma Taylor", "Exit Shaft"),
    ]
    .into_iter()
    .map(|(id, miner, location)| RosterEntry::assigned(id, miner, location))
    .collect()
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        // Broker
        if self.broker.host.trim().is_empty() {
            return Err(Error::config_validation("broker.host must not be empty"));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(Error::config_validation("broker.topic must not be empty"));
        }
        if self.broker.reconnect_backoff_ms == 0 {
            return Err(Error::config_validation(
                "broker.reconnect_backoff_ms must be greater than 0",
            ));
        }
        if self.broker.channel_capacity == 0 {
            return Err(Error::config_validation(
                "broker.channel_capacity must be greater than 0",
            ));
        }

        // Pipeline
        if self.pipeline.tick_interval_ms == 0 {
            return Err(Error::config_validation(
                "pipeline.tick_interval_ms must be greater than 0",
            ));
        }
        if self.pipeline.staleness_window_ms == 0 {
            return Err(Error::config_validation(
                "pipeline.staleness_window_ms must be greater than 0",
            ));
        }
        if self.pipeline.history_capacity == 0 {
            return Err(Error::config_validation(
                "pipeline.history_capacity must be greater than 0",
            ));
        }
        self.validate_roster()?;

        self.thresholds.validate()?;

        if self.delegate.enabled {
            if self.delegate.command.trim().is_empty() {
                return Err(Error::config_validation(
                    "delegate.command must be set when the delegate is enabled",
                ));
            }
            if self.delegate.timeout_ms == 0 {
                return Err(Error::config_validation(
                    "delegate.timeout_ms must be greater than 0",
                ));
            }
        }

        if self.alerts.capacity == 0 {
            return Err(Error::config_validation(
                "alerts.capacity must be greater than 0",
            ));
        }

        if self.server.enabled {
            self.bind_addr()?;
        }

        Ok(())
    }

    fn validate_roster(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for RosterEntry { id, .. } in &self.pipeline.roster {
            if id.trim().is_empty() || id.trim() != id {
                return Err(Error::config_validation(format!(
                    "invalid roster id {id:?}"
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(Error::config_validation(format!(
                    "duplicate roster id {id:?}"
                )));
            }
        }
        if self.pipeline.roster.len() > self.pipeline.max_helmets {
            return Err(Error::config_validation(format!(
                "roster has {} helmets but max_helmets is {}",
                self.pipeline.roster.len(),
                self.pipeline.max_helmets
            )));
        }
        Ok(())
    }

    /// Parse the server bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server.bind_addr.parse().map_err(|_| {
            Error::config_validation(format!(
                "invalid server.bind_addr: {}",
                self.server.bind_addr
            ))
        })
    }

    /// Ids of the rostered helmets.
    #[must_use]
    pub fn roster_ids(&self) -> Vec<String> {
        self.pipeline.roster.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Get the tick interval as a Duration.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.tick_interval_ms)
    }

    /// Get the staleness window as a Duration.
    #[must_use]
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.pipeline.staleness_window_ms)
    }

    /// Get the reconnect backoff as a Duration.
    #[must_use]
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.broker.reconnect_backoff_ms)
    }

    /// Get the keep-alive interval as a Duration.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.broker.keep_alive_secs)
    }
}
