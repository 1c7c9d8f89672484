//! Client configuration
//!
//! Tunables for the swarm, loadable from a JSON file. Durations are whole
//! seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::TorrentError;

/// Configuration shared by the swarm manager and its peer connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory the torrent content is stored under
    pub output_dir: PathBuf,
    /// Port announced to trackers and listened on for inbound peers
    pub listen_port: u16,
    /// Accept inbound peer connections
    pub accept_inbound: bool,
    /// Upper bound on connecting plus connected peers
    pub max_peers: usize,
    /// Peers requested per announce (-1 lets the tracker decide)
    pub num_wanted: i32,
    /// Missing-block fraction below which end-game interest applies
    pub endgame_threshold: f64,
    /// Size of each sub-block request
    pub request_chunk_size: u32,
    /// Largest request served to a peer; larger is a protocol violation
    pub max_request_len: u32,
    /// Seconds between keep-alives
    pub keepalive_interval: u64,
    /// Seconds without inbound traffic before a connection is dropped
    pub idle_timeout: u64,
    /// Seconds an outstanding block request may go unanswered
    pub request_timeout: u64,
    /// Seconds allowed for an outbound TCP connect
    pub connect_timeout: u64,
    /// Hash failures tolerated from one peer before disconnecting it
    pub max_hash_failures: u32,
    /// Unchoke peers as soon as they declare interest
    pub auto_unchoke: bool,
    /// Seconds between rebalance attempts when idle
    pub rebalance_interval: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            listen_port: 6881,
            accept_inbound: true,
            max_peers: 50,
            num_wanted: -1,
            endgame_threshold: 0.05,
            request_chunk_size: 16 * 1024,
            max_request_len: 32 * 1024,
            keepalive_interval: 30,
            idle_timeout: 120,
            request_timeout: 60,
            connect_timeout: 10,
            max_hash_failures: 3,
            auto_unchoke: true,
            rebalance_interval: 60,
        }
    }
}

impl ClientConfig {
    /// Load a configuration from a JSON file; missing keys take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            error!("Failed to read config file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read config file", path.display().to_string(), e.to_string())
        })?;
        Self::from_json(&text)
    }

    /// Parse a configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| {
            error!("Invalid configuration: {}", e);
            TorrentError::config_error(format!("Invalid configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "listen_port").into());
        }

        if self.max_peers == 0 {
            return Err(TorrentError::config_error_with_field("max_peers must be at least 1", "max_peers").into());
        }

        if !(0.0..=1.0).contains(&self.endgame_threshold) {
            return Err(TorrentError::config_error_with_field(
                "endgame_threshold must be within [0, 1]",
                "endgame_threshold",
            )
            .into());
        }

        if self.request_chunk_size == 0 || self.request_chunk_size > self.max_request_len {
            return Err(TorrentError::config_error_with_field(
                format!("request_chunk_size must be within 1..={}", self.max_request_len),
                "request_chunk_size",
            )
            .into());
        }

        if self.keepalive_interval == 0 || self.idle_timeout <= self.keepalive_interval {
            return Err(TorrentError::config_error_with_field(
                "idle_timeout must exceed a non-zero keepalive_interval",
                "idle_timeout",
            )
            .into());
        }

        if self.request_timeout == 0 {
            return Err(TorrentError::config_error_with_field("request_timeout cannot be 0", "request_timeout").into());
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("output_dir cannot be empty", "output_dir").into());
        }

        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn rebalance(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval)
    }

    /// Get the listen address for incoming connections
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_chunk_size, 16384);
        assert_eq!(config.max_request_len, 32768);
        assert_eq!(config.endgame_threshold, 0.05);
        assert_eq!(config.keepalive(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = ClientConfig { listen_port: 0, ..Default::default() };
        assert!(config.validate().is_err());

        config = ClientConfig { max_peers: 0, ..Default::default() };
        assert!(config.validate().is_err());

        config = ClientConfig { endgame_threshold: 1.5, ..Default::default() };
        assert!(config.validate().is_err());

        config = ClientConfig { request_chunk_size: 40000, ..Default::default() };
        assert!(config.validate().is_err());

        config = ClientConfig { idle_timeout: 10, ..Default::default() };
        assert!(config.validate().is_err());

        config = ClientConfig { request_timeout: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let config = ClientConfig::from_json(r#"{"max_peers": 8, "auto_unchoke": false}"#).unwrap();
        assert_eq!(config.max_peers, 8);
        assert!(!config.auto_unchoke);
        assert_eq!(config.listen_port, 6881);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(ClientConfig::from_json("{not json").is_err());
        assert!(ClientConfig::from_json(r#"{"listen_port": 0}"#).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        let config = ClientConfig { max_peers: 3, ..Default::default() };
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(ClientConfig::from_file(&path).unwrap(), config);
    }
}
