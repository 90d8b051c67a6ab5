//! Layered TOML configuration, following the reference daemon's config
//! module: nested structs, per-field `serde(default)`, and an explicit
//! `Default` impl for every struct so a missing file yields a fully
//! populated configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            transport: TransportConfig::default(),
            http: HttpConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Product identifier baked into the agent id: `{product_agent_id}_{mac}_agent`.
    #[serde(default = "default_product_agent_id")]
    pub product_agent_id: String,
    /// Network interface whose MAC address identifies this host.
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            product_agent_id: default_product_agent_id(),
            interface: default_interface(),
        }
    }
}

fn default_product_agent_id() -> String {
    "681ac31f6cc0a3de12b5020a".to_string()
}

fn default_interface() -> String {
    "eth0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_primary_broker")]
    pub primary: BrokerConfig,
    #[serde(default = "default_telemetry_broker")]
    pub telemetry: BrokerConfig,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_online_beacon_secs")]
    pub online_beacon_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_broker(),
            telemetry: default_telemetry_broker(),
            keepalive_secs: default_keepalive_secs(),
            online_beacon_secs: default_online_beacon_secs(),
        }
    }
}

fn default_primary_broker() -> BrokerConfig {
    BrokerConfig {
        host: "39.105.185.216".to_string(),
        port: default_mqtt_port(),
    }
}

fn default_telemetry_broker() -> BrokerConfig {
    BrokerConfig {
        host: "121.5.162.11".to_string(),
        port: default_mqtt_port(),
    }
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_online_beacon_secs() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_retries")]
    pub retries: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_http_base_url(),
            retries: default_http_retries(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_http_base_url() -> String {
    "http://39.105.185.216:8848".to_string()
}

fn default_http_retries() -> u32 {
    3
}

fn default_http_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: String,
    #[serde(default = "default_agent_dir")]
    pub agent_dir: String,
    #[serde(default = "default_max_backup_count")]
    pub max_backup_count: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            agent_dir: default_agent_dir(),
            max_backup_count: default_max_backup_count(),
        }
    }
}

fn default_downloads_dir() -> String {
    "downloads".to_string()
}

fn default_agent_dir() -> String {
    ".".to_string()
}

fn default_max_backup_count() -> usize {
    3
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    } else {
        info!(path = %path.display(), "configuration file not found, using defaults");
        Ok(Config::default())
    }
}

/// Write a pretty-printed default configuration to `path`, for first-run
/// bootstrapping.
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.paths.max_backup_count, 3);
        assert_eq!(config.transport.online_beacon_secs, 2);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        save_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.identity.interface, "eth0");
    }

    #[test]
    fn partial_file_fills_in_missing_fields_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[identity]\nproduct_agent_id = \"custom\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.identity.product_agent_id, "custom");
        assert_eq!(config.identity.interface, "eth0");
    }
}
