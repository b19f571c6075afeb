// Configuration management for the peerlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/peerlink/config.json
// - Linux: ~/.config/peerlink/config.json
// - Windows: %APPDATA%\peerlink\config.json

use anyhow::{Context, Result};
use peerlink_core::{AddressEncoding, PeerConfig, RelayServerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay to dial, `host:port` or `tcp://host:port`
    pub relay_address: String,

    /// Peer id used when `--id` is not given
    pub peer_id: Option<String>,

    /// Port the `relay` command listens on
    pub listen_port: u16,

    /// Sender attribution the relay should use for us
    pub encoding: AddressEncoding,

    /// Relay settings
    pub relay: RelaySettings,

    /// Stream and session settings
    pub peer: PeerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Maximum concurrent connections
    pub max_connections: usize,

    /// Let a reconnecting peer evict its old connection
    pub client_overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Stream high-water mark in bytes
    pub high_water_mark: usize,

    /// Session unregister acknowledgement timeout in milliseconds
    pub unregister_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_address: "tcp://127.0.0.1:7600".to_string(),
            peer_id: None,
            listen_port: 7600,
            encoding: AddressEncoding::LeadingArg,
            relay: RelaySettings::default(),
            peer: PeerSettings::default(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        let defaults = RelayServerConfig::default();
        Self {
            max_connections: defaults.max_connections,
            client_overwrite: defaults.client_overwrite,
        }
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        let defaults = PeerConfig::default();
        Self {
            high_water_mark: defaults.stream_high_water_mark,
            unregister_timeout_ms: defaults.unregister_timeout.as_millis() as u64,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("peerlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, or create it
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The caller saves.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "relay_address" => self.relay_address = value.to_string(),
            "peer_id" => {
                self.peer_id = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "encoding" => {
                self.encoding = match value {
                    "leading-arg" => AddressEncoding::LeadingArg,
                    "event-suffix" => AddressEncoding::EventSuffix,
                    _ => anyhow::bail!("Invalid encoding (leading-arg or event-suffix): {}", value),
                };
            }
            "max_connections" => {
                self.relay.max_connections = value.parse().context("Invalid number")?;
            }
            "client_overwrite" => {
                self.relay.client_overwrite = value.parse().context("Invalid boolean value")?;
            }
            "high_water_mark" => {
                let mark: usize = value.parse().context("Invalid number")?;
                if mark == 0 {
                    anyhow::bail!("high_water_mark must be at least 1");
                }
                self.peer.high_water_mark = mark;
            }
            "unregister_timeout_ms" => {
                self.peer.unregister_timeout_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("relay_address".to_string(), self.relay_address.clone()),
            (
                "peer_id".to_string(),
                self.peer_id.clone().unwrap_or_else(|| "(unset)".to_string()),
            ),
            ("listen_port".to_string(), self.listen_port.to_string()),
            ("encoding".to_string(), encoding_name(self.encoding).to_string()),
            ("max_connections".to_string(), self.relay.max_connections.to_string()),
            ("client_overwrite".to_string(), self.relay.client_overwrite.to_string()),
            ("high_water_mark".to_string(), self.peer.high_water_mark.to_string()),
            (
                "unregister_timeout_ms".to_string(),
                self.peer.unregister_timeout_ms.to_string(),
            ),
        ]
    }

    /// Peer settings for the core client
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            encoding: self.encoding,
            unregister_timeout: Duration::from_millis(self.peer.unregister_timeout_ms),
            stream_high_water_mark: self.peer.high_water_mark,
            ..Default::default()
        }
    }

    /// Relay settings for the core server
    pub fn relay_config(&self, overwrite: bool) -> RelayServerConfig {
        RelayServerConfig {
            max_connections: self.relay.max_connections,
            client_overwrite: overwrite || self.relay.client_overwrite,
            ..Default::default()
        }
    }
}

fn encoding_name(encoding: AddressEncoding) -> &'static str {
    match encoding {
        AddressEncoding::LeadingArg => "leading-arg",
        AddressEncoding::EventSuffix => "event-suffix",
    }
}
