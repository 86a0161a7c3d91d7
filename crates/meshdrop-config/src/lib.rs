//! Shared configuration for meshdrop tools
//!
//! Reads from ~/.meshdrop/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default STUN servers used for ICE
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Signaling relay (room server) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Maximum participants per room
    #[serde(default = "default_max_room_size")]
    pub max_room_size: usize,
    /// How often empty/idle rooms are swept
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_room_idle_timeout_secs")]
    pub room_idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_room_size: default_max_room_size(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            room_idle_timeout_secs: default_room_idle_timeout_secs(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_max_room_size() -> usize {
    10
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_room_idle_timeout_secs() -> u64 {
    24 * 3600
}

/// Client-side signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            stun_servers: default_stun_servers(),
        }
    }
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:3001/ws".to_string()
}

fn default_stun_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

/// File transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// How long an offer may stay unanswered
    #[serde(default = "default_offer_timeout_ms")]
    pub offer_timeout_ms: u64,
    /// Sending pauses once the channel buffers more than this
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
    /// ...and resumes once it has drained to this
    #[serde(default = "default_low_water_bytes")]
    pub low_water_bytes: usize,
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,
    /// Delay before the initiator re-offers after a link failure
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Incoming offers above this size are declined
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            offer_timeout_ms: default_offer_timeout_ms(),
            max_buffered_bytes: default_max_buffered_bytes(),
            low_water_bytes: default_low_water_bytes(),
            drain_poll_ms: default_drain_poll_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            max_file_size: default_max_file_size(),
            download_dir: default_download_dir(),
        }
    }
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_offer_timeout_ms() -> u64 {
    15_000
}

fn default_max_buffered_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_low_water_bytes() -> usize {
    1024 * 1024
}

fn default_drain_poll_ms() -> u64 {
    100
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_download_dir() -> String {
    dirs::download_dir()
        .unwrap_or_else(|| get_config_dir().join("downloads"))
        .to_string_lossy()
        .to_string()
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Parse a config file at an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the meshdrop directory (~/.meshdrop)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MESHDROP_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshdrop")
}

/// Get the config file path (~/.meshdrop/config.toml)
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.max_room_size, 10);
        assert_eq!(config.transfer.chunk_size, 65536);
        assert_eq!(config.transfer.offer_timeout_ms, 15_000);
        assert!(!config.signaling.stun_servers.is_empty());
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.relay.bind_address, "0.0.0.0:3001");
        assert_eq!(config.transfer.max_buffered_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[relay]
max_room_size = 4

[transfer]
offer_timeout_ms = 500
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.relay.max_room_size, 4);
        assert_eq!(config.relay.cleanup_interval_secs, 3600);
        assert_eq!(config.transfer.offer_timeout_ms, 500);
        assert_eq!(config.transfer.low_water_bytes, 1024 * 1024);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.signaling.relay_url = "ws://relay.example:9000/ws".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.signaling.relay_url, "ws://relay.example:9000/ws");
        assert_eq!(loaded.relay.max_room_size, config.relay.max_room_size);
    }

    #[test]
    fn test_load_from_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "relay = [not valid").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
