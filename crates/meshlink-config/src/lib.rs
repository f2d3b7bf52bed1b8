//! Shared configuration for meshlink tools
//!
//! Reads from ~/.meshlink/config.toml

use anyhow::{Context, Result};
use meshlink::{InvitationConfig, PresenceConfig, SwarmConfig, TcpTransportConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default signal server for tools that connect to one
pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:7470";

/// Top-level config structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub swarm: SwarmSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub invitation: InvitationSection,
    #[serde(default)]
    pub signal: SignalSection,
    #[serde(default)]
    pub tcp: TcpSection,
}

/// Swarm timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmSection {
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Announce intervals a silent peer is kept before it is forgotten
    #[serde(default = "default_peer_expiry_intervals")]
    pub peer_expiry_intervals: u32,
}

impl Default for SwarmSection {
    fn default() -> Self {
        Self {
            announce_interval_ms: default_announce_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            peer_expiry_intervals: default_peer_expiry_intervals(),
        }
    }
}

fn default_announce_interval_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_peer_expiry_intervals() -> u32 {
    3
}

impl SwarmSection {
    pub fn to_runtime(&self) -> SwarmConfig {
        SwarmConfig {
            announce_interval: Duration::from_millis(self.announce_interval_ms.max(1)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            peer_expiry_intervals: self.peer_expiry_intervals.max(1),
            ..SwarmConfig::default()
        }
    }
}

/// Presence heartbeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeats a peer may miss before it is evicted
    #[serde(default = "default_missed_beats")]
    pub missed_beats_threshold: u32,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_beats_threshold: default_missed_beats(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_missed_beats() -> u32 {
    3
}

impl PresenceSection {
    pub fn to_runtime(&self) -> PresenceConfig {
        PresenceConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            missed_beats_threshold: self.missed_beats_threshold,
        }
    }
}

/// Invitation lifetime and authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationSection {
    #[serde(default = "default_invitation_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
    #[serde(default = "default_auth_code_length")]
    pub auth_code_length: usize,
    #[serde(default = "default_close_delay_ms")]
    pub close_delay_ms: u64,
}

impl Default for InvitationSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_invitation_timeout_ms(),
            max_auth_attempts: default_max_auth_attempts(),
            auth_code_length: default_auth_code_length(),
            close_delay_ms: default_close_delay_ms(),
        }
    }
}

fn default_invitation_timeout_ms() -> u64 {
    180_000
}

fn default_max_auth_attempts() -> u32 {
    3
}

fn default_auth_code_length() -> usize {
    6
}

fn default_close_delay_ms() -> u64 {
    200
}

impl InvitationSection {
    pub fn to_runtime(&self) -> InvitationConfig {
        InvitationConfig {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            max_auth_attempts: self.max_auth_attempts,
            auth_code_length: self.auth_code_length,
            close_delay: Duration::from_millis(self.close_delay_ms),
        }
    }
}

/// Signal server endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSection {
    /// Server the tools connect to
    #[serde(default = "default_signal_url")]
    pub url: String,
    /// Address `signal-server` listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for SignalSection {
    fn default() -> Self {
        Self {
            url: default_signal_url(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_signal_url() -> String {
    DEFAULT_SIGNAL_URL.to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:7470".to_string()
}

/// TCP transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSection {
    #[serde(default = "default_tcp_bind_host")]
    pub bind_host: String,
    #[serde(default)]
    pub advertise_host: Option<String>,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            bind_host: default_tcp_bind_host(),
            advertise_host: None,
            max_frame_len: default_max_frame_len(),
        }
    }
}

fn default_tcp_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_frame_len() -> usize {
    meshlink::tcp::DEFAULT_MAX_FRAME_LEN
}

impl TcpSection {
    pub fn to_runtime(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            bind_host: self.bind_host.clone(),
            advertise_host: self.advertise_host.clone(),
            max_frame_len: self.max_frame_len,
        }
    }
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

    /// Load config from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to the default location
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

/// Get the meshlink directory (~/.meshlink)
pub fn get_meshlink_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MESHLINK_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshlink")
}

/// Get the config file path (~/.meshlink/config.toml)
pub fn get_config_path() -> PathBuf {
    get_meshlink_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.invitation.max_auth_attempts, 3);
        assert_eq!(config.presence.missed_beats_threshold, 3);
        assert_eq!(config.signal.url, DEFAULT_SIGNAL_URL);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[invitation]
max_auth_attempts = 5

[presence]
heartbeat_interval_ms = 250
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.invitation.max_auth_attempts, 5);
        assert_eq!(config.invitation.auth_code_length, 6);
        assert_eq!(config.presence.heartbeat_interval_ms, 250);
        assert_eq!(config.presence.missed_beats_threshold, 3);
        assert_eq!(config.swarm, SwarmSection::default());
    }

    #[test]
    fn test_runtime_conversion() {
        let config = Config::default();
        let swarm = config.swarm.to_runtime();
        assert_eq!(swarm.announce_interval, Duration::from_secs(2));
        assert_eq!(swarm.retry_delay, Duration::from_millis(500));
        assert_eq!(swarm.peer_expiry(), Duration::from_secs(6));

        let presence = config.presence.to_runtime();
        assert_eq!(presence.peer_timeout(), Duration::from_secs(3));

        let invitation = config.invitation.to_runtime();
        assert_eq!(invitation.default_timeout, Duration::from_secs(180));
        assert_eq!(invitation.close_delay, Duration::from_millis(200));

        let tcp = config.tcp.to_runtime();
        assert_eq!(tcp.bind_host, "127.0.0.1");
        assert!(tcp.advertise_host.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.invitation.default_timeout_ms = 60_000;
        config.tcp.advertise_host = Some("10.0.0.2".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[swarm\nbroken").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
