//! Keeper configuration loading and validation
//!
//! The configuration is a TOML file living next to the data directory. It is
//! read at startup and re-read on SIGHUP; the keeper loop applies whatever
//! changed without restarting where it can.

use crate::defaults::{NETWORK_PARTITION_TIMEOUT, REPLICA_USERNAME};
use crate::{CoreError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level TOML structure of the keeper configuration file
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    node: NodeSection,
    postgres: PostgresSection,
    #[serde(default)]
    monitor: MonitorSection,
    #[serde(default)]
    timeouts: TimeoutsSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct NodeSection {
    /// Node name, used in logs and reported to the monitor
    name: String,
    /// Hostname peers use to reach this node
    host: String,
    /// Postgres port
    #[serde(default = "default_pg_port")]
    port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct PostgresSection {
    /// Postgres data directory
    pgdata: PathBuf,
    /// Replication user probed for attached standbys
    #[serde(default = "default_replication_user")]
    replication_user: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
struct MonitorSection {
    /// Monitor connection URI; the client for it is provided by the caller
    #[serde(default)]
    uri: Option<String>,
    /// Run without a monitor, taking the goal state from the state file
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct TimeoutsSection {
    /// Seconds without monitor nor standby contact before a primary
    /// self-demotes
    #[serde(default = "default_network_partition_timeout")]
    network_partition_timeout: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            network_partition_timeout: default_network_partition_timeout(),
        }
    }
}

const fn default_pg_port() -> u16 {
    5432
}

fn default_replication_user() -> String {
    REPLICA_USERNAME.to_string()
}

const fn default_network_partition_timeout() -> u64 {
    NETWORK_PARTITION_TIMEOUT
}

/// Validated keeper configuration
#[derive(Debug, Clone, PartialEq)]
pub struct KeeperConfig {
    /// Path the configuration was loaded from, for reloads
    pub config_path: PathBuf,
    pub node_name: String,
    pub node_host: String,
    pub node_port: u16,
    pub pgdata: PathBuf,
    pub replication_user: String,
    pub monitor_uri: Option<String>,
    pub monitor_disabled: bool,
    pub network_partition_timeout: u64,
}

impl KeeperConfig {
    /// Load and validate the configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigurationError(format!(
                "Failed to read config \"{}\": {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(path, &data)
    }

    fn parse(path: &Path, data: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(data)
            .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;

        let config = Self {
            config_path: path.to_path_buf(),
            node_name: file.node.name,
            node_host: file.node.host,
            node_port: file.node.port,
            pgdata: file.postgres.pgdata,
            replication_user: file.postgres.replication_user,
            monitor_uri: file.monitor.uri,
            monitor_disabled: file.monitor.disabled,
            network_partition_timeout: file.timeouts.network_partition_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(CoreError::ConfigurationError(
                "node.name: cannot be empty".to_string(),
            ));
        }
        if self.node_host.trim().is_empty() {
            return Err(CoreError::ConfigurationError(
                "node.host: cannot be empty".to_string(),
            ));
        }
        if self.node_port == 0 {
            return Err(CoreError::ConfigurationError(
                "node.port: must be 1..=65535".to_string(),
            ));
        }
        if self.pgdata.as_os_str().is_empty() {
            return Err(CoreError::ConfigurationError(
                "postgres.pgdata: cannot be empty".to_string(),
            ));
        }
        if self.network_partition_timeout == 0 {
            return Err(CoreError::ConfigurationError(
                "timeouts.networkPartitionTimeout: must be > 0".to_string(),
            ));
        }
        if !self.monitor_disabled && self.monitor_uri.is_none() {
            return Err(CoreError::ConfigurationError(
                "monitor.uri: required unless monitor.disabled = true".to_string(),
            ));
        }
        Ok(())
    }

    /// Re-read the configuration file. Returns the freshly loaded config so
    /// the caller can decide what changed.
    pub fn reload(&self) -> Result<Self> {
        debug!("Reloading configuration from \"{}\"", self.config_path.display());
        Self::load(&self.config_path)
    }

    /// Path of the supervisor pidfile
    pub fn pidfile_path(&self) -> PathBuf {
        self.pgdata.join("mizar.pid")
    }

    /// Path of the persisted keeper state
    pub fn state_file_path(&self) -> PathBuf {
        self.pgdata.join("mizar_keeper.state.json")
    }

    /// Path of the externally maintained nodes file (monitor-disabled mode)
    pub fn nodes_file_path(&self) -> PathBuf {
        self.pgdata.join("mizar_nodes.json")
    }
}
