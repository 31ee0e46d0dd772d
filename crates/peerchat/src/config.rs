//! Configuration management for the PeerChat client and relay.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/peerchat/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling relay used when nothing else is configured.
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";

/// File holding the generated peer id inside the data directory.
const PEER_ID_FILE: &str = "peer_id";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("peer_id may only contain ASCII letters, digits, '-', '_' and '.', got {0:?}")]
    InvalidPeerId(String),

    #[error("signaling_url must start with ws:// or wss://, got {0}")]
    InvalidSignalingUrl(String),

    #[error("connect_timeout_secs must be between 1 and 600, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("chunk_size must be between 1 and 262144 bytes, got {0}")]
    InvalidChunkSize(usize),

    #[error("max_file_size must be greater than 0, got {0}")]
    InvalidMaxFileSize(u64),

    #[error("relay bind must be a socket address, got {0}")]
    InvalidBindAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest chunk a data channel message should carry.
const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Local identity, storage and logging.
    pub client: ClientConfig,

    /// Signaling and WebRTC configuration.
    pub network: NetworkConfig,

    /// File transfer configuration.
    pub files: FilesConfig,

    /// Profile advertised to connected peers.
    pub profile: ProfileConfig,

    /// Bundled relay server.
    pub relay: RelayConfig,
}

/// Local client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory for contacts, history and the identity key.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write a daily rolling log file under `data_dir/logs`.
    pub log_to_file: bool,

    /// Identity registered with the relay. Empty means generate and persist.
    pub peer_id: String,
}

/// Network configuration for signaling and WebRTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// URL of the signaling relay.
    pub signaling_url: String,

    /// List of STUN servers for NAT traversal.
    pub stun_servers: Vec<String>,

    /// Seconds a connect attempt may take before it is abandoned.
    pub connect_timeout_secs: u64,

    /// Reconnect to the relay after the socket drops.
    pub auto_reconnect: bool,

    /// Delay between relay reconnect attempts.
    pub reconnect_delay_secs: u64,
}

/// File transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesConfig {
    /// Payload bytes per binary chunk.
    pub chunk_size: usize,

    /// Where completed incoming files are written.
    pub download_dir: PathBuf,

    /// Largest incoming file accepted, in bytes (default: 100MB).
    pub max_file_size: u64,
}

/// Profile information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProfileConfig {
    pub nickname: Option<String>,
    pub avatar: Option<String>,
}

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the relay listens on.
    pub bind: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
            peer_id: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            connect_timeout_secs: 30,
            auto_reconnect: true,
            reconnect_delay_secs: 2,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            chunk_size: protocol::FILE_CHUNK_SIZE,
            download_dir: default_download_dir(),
            max_file_size: 100 * 1024 * 1024, // 100MB
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerchat")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerchat")
}

/// Returns the default download directory.
fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| default_data_dir().join("downloads"))
}

fn is_valid_peer_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PEERCHAT_SIGNALING_URL: Override signaling relay URL
    /// - PEERCHAT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PEERCHAT_PEER_ID: Override the local peer id
    /// - PEERCHAT_NICKNAME: Override the profile nickname
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PEERCHAT_SIGNALING_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding signaling_url from environment: {}", url);
                self.network.signaling_url = url;
            }
        }

        if let Ok(level) = std::env::var("PEERCHAT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.client.log_level = level;
            }
        }

        if let Ok(peer_id) = std::env::var("PEERCHAT_PEER_ID") {
            if !peer_id.is_empty() {
                tracing::info!("Overriding peer_id from environment: {}", peer_id);
                self.client.peer_id = peer_id;
            }
        }

        if let Ok(nickname) = std::env::var("PEERCHAT_NICKNAME") {
            if !nickname.is_empty() {
                self.profile.nickname = Some(nickname);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // An empty peer id is filled in later by resolve_peer_id
        if !self.client.peer_id.is_empty() && !is_valid_peer_id(&self.client.peer_id) {
            return Err(ConfigError::InvalidPeerId(self.client.peer_id.clone()));
        }

        let url = &self.network.signaling_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidSignalingUrl(url.clone()));
        }

        let timeout = self.network.connect_timeout_secs;
        if timeout == 0 || timeout > 600 {
            return Err(ConfigError::InvalidConnectTimeout(timeout));
        }

        let chunk = self.files.chunk_size;
        if chunk == 0 || chunk > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(chunk));
        }

        if self.files.max_file_size == 0 {
            return Err(ConfigError::InvalidMaxFileSize(self.files.max_file_size));
        }

        if self.relay.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(self.relay.bind.clone()));
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        Ok(())
    }

    /// Returns the configured peer id, or the one persisted in `data_dir`,
    /// generating and saving a new one on first use.
    pub fn resolve_peer_id(&self) -> Result<String> {
        if !self.client.peer_id.is_empty() {
            return Ok(self.client.peer_id.clone());
        }

        let path = self.client.data_dir.join(PEER_ID_FILE);
        if path.exists() {
            let stored = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read peer id: {}", path.display()))?;
            let stored = stored.trim();
            if is_valid_peer_id(stored) {
                return Ok(stored.to_string());
            }
            tracing::warn!(path = %path.display(), "stored peer id is invalid, regenerating");
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        fs::create_dir_all(&self.client.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                self.client.data_dir.display()
            )
        })?;
        fs::write(&path, &id)
            .with_context(|| format!("Failed to write peer id: {}", path.display()))?;
        tracing::info!(peer_id = %id, "generated new peer id");
        Ok(id)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        for var in [
            "PEERCHAT_SIGNALING_URL",
            "PEERCHAT_LOG_LEVEL",
            "PEERCHAT_PEER_ID",
            "PEERCHAT_NICKNAME",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.client.log_level, "info");
        assert!(config.client.peer_id.is_empty());
        assert_eq!(config.network.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.network.stun_servers.len(), 2);
        assert_eq!(config.network.connect_timeout_secs, 30);
        assert_eq!(config.files.chunk_size, 16384);
        assert_eq!(config.files.max_file_size, 100 * 1024 * 1024);
        assert!(config.profile.nickname.is_none());
        assert_eq!(config.relay.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("peerchat"));
        assert!(!config.log_to_file);
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[client]
log_level = "debug"

[files]
chunk_size = 8192
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.client.log_level, "debug");
        assert_eq!(config.files.chunk_size, 8192);
        // Unspecified sections keep their defaults
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[client]
data_dir = "/tmp/peerchat"
log_level = "warn"
log_to_file = true
peer_id = "alice"

[network]
signaling_url = "wss://relay.example.com/ws"
stun_servers = ["stun:stun.example.com:3478"]
connect_timeout_secs = 10
auto_reconnect = false
reconnect_delay_secs = 5

[files]
chunk_size = 4096
download_dir = "/tmp/downloads"
max_file_size = 1048576

[profile]
nickname = "Alice"
avatar = "data:image/png;base64,AAAA"

[relay]
bind = "0.0.0.0:9000"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.client.data_dir, PathBuf::from("/tmp/peerchat"));
        assert!(config.client.log_to_file);
        assert_eq!(config.client.peer_id, "alice");
        assert_eq!(config.network.signaling_url, "wss://relay.example.com/ws");
        assert_eq!(config.network.stun_servers.len(), 1);
        assert_eq!(config.network.connect_timeout_secs, 10);
        assert!(!config.network.auto_reconnect);
        assert_eq!(config.files.download_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.files.max_file_size, 1048576);
        assert_eq!(config.profile.nickname.as_deref(), Some("Alice"));
        assert_eq!(config.relay.bind, "0.0.0.0:9000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[client\nlog_level = ");
        assert!(result.is_err());
    }

    #[test]
    fn test_helpful_error_messages() {
        let toml = r#"
[network]
connect_timeout_secs = "soon"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.client.peer_id = "bob".to_string();
        config.profile.nickname = Some("Bob".to_string());
        config.files.chunk_size = 1024;

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.network.signaling_url = "ws://localhost:9999/ws".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "this is not toml = = =").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("peerchat/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_signaling_url() {
        clear_env();
        std::env::set_var("PEERCHAT_SIGNALING_URL", "wss://test.example.com/ws");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.signaling_url, "wss://test.example.com/ws");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("PEERCHAT_SIGNALING_URL", "");
        std::env::set_var("PEERCHAT_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_identity() {
        clear_env();
        std::env::set_var("PEERCHAT_PEER_ID", "carol");
        std::env::set_var("PEERCHAT_NICKNAME", "Carol");
        std::env::set_var("PEERCHAT_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.client.peer_id, "carol");
        assert_eq!(config.profile.nickname.as_deref(), Some("Carol"));
        assert_eq!(config.client.log_level, "trace");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_peer_id() {
        let mut config = Config::default();
        config.client.peer_id = "alice smith".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPeerId("alice smith".to_string()))
        );

        config.client.peer_id = "alice-01_x.y".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_signaling_url() {
        let mut config = Config::default();
        for bad in ["http://relay", "https://relay", "", "relay:8080"] {
            config.network.signaling_url = bad.to_string();
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidSignalingUrl(bad.to_string()))
            );
        }
        config.network.signaling_url = "wss://relay.example.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_connect_timeout() {
        let mut config = Config::default();
        config.network.connect_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConnectTimeout(0)));

        config.network.connect_timeout_secs = 601;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConnectTimeout(601))
        );

        config.network.connect_timeout_secs = 600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_chunk_size() {
        let mut config = Config::default();
        config.files.chunk_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidChunkSize(0)));

        config.files.chunk_size = MAX_CHUNK_SIZE + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidChunkSize(MAX_CHUNK_SIZE + 1))
        );
    }

    #[test]
    fn test_validate_max_file_size_zero() {
        let mut config = Config::default();
        config.files.max_file_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxFileSize(0)));
    }

    #[test]
    fn test_validate_bind_address() {
        let mut config = Config::default();
        config.relay.bind = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.client.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.client.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_configured_peer_id() {
        let mut config = Config::default();
        config.client.peer_id = "alice".to_string();
        assert_eq!(config.resolve_peer_id().unwrap(), "alice");
    }

    #[test]
    fn test_resolve_generated_peer_id_is_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.client.data_dir = temp_dir.path().join("data");

        let first = config.resolve_peer_id().unwrap();
        assert!(is_valid_peer_id(&first));
        assert!(config.client.data_dir.join(PEER_ID_FILE).exists());

        let second = config.resolve_peer_id().unwrap();
        assert_eq!(first, second);
    }
}
