//! Configuration module
//!
//! Handles loading and saving dotwire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::document::{FileStore, DOT_EXTENSION};
use crate::network::NetworkConfig;
use crate::protocol::{DEFAULT_DATAGRAM_PORT, DEFAULT_STREAM_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port for the stream transport
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// Port for the datagram transport
    #[serde(default = "default_datagram_port")]
    pub datagram_port: u16,
    /// Where received documents are stored
    #[serde(default = "default_server_storage")]
    pub storage_dir: PathBuf,
    /// Sample documents copied into an empty storage directory
    pub samples_dir: Option<PathBuf>,
    /// File extension for stored documents
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_stream_port() -> u16 {
    DEFAULT_STREAM_PORT
}

fn default_datagram_port() -> u16 {
    DEFAULT_DATAGRAM_PORT
}

fn default_server_storage() -> PathBuf {
    PathBuf::from("server_storage")
}

fn default_extension() -> String {
    DOT_EXTENSION.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            stream_port: default_stream_port(),
            datagram_port: default_datagram_port(),
            storage_dir: default_server_storage(),
            samples_dir: None,
            extension: default_extension(),
        }
    }
}

impl ServerConfig {
    /// Network settings for a server listening on `port`
    pub fn network(&self, port: u16) -> NetworkConfig {
        NetworkConfig::new(port).with_bind_address(self.bind_address.clone())
    }

    /// Document store in `dir`, or the configured storage directory
    pub fn store(&self, dir: Option<PathBuf>) -> FileStore {
        FileStore::new(dir.unwrap_or_else(|| self.storage_dir.clone()))
            .with_extension(self.extension.clone())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address (`host:port`); the transport's default port on localhost if unset
    pub server: Option<String>,
    /// Where acknowledged documents are stored
    #[serde(default = "default_client_storage")]
    pub storage_dir: PathBuf,
    /// Connection timeout in ms
    #[serde(default = "default_timeout")]
    pub connect_timeout_ms: u64,
    /// How long to wait for an acknowledgment, in ms
    #[serde(default = "default_timeout")]
    pub ack_timeout_ms: u64,
    /// File extension for acknowledged documents
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_client_storage() -> PathBuf {
    PathBuf::from("client_storage")
}

fn default_timeout() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            storage_dir: default_client_storage(),
            connect_timeout_ms: default_timeout(),
            ack_timeout_ms: default_timeout(),
            extension: default_extension(),
        }
    }
}

impl ClientConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Network settings for reaching a server on `port`.
    ///
    /// `ack_timeout_ms` overrides the configured acknowledgment timeout.
    pub fn network(&self, port: u16, ack_timeout_ms: Option<u64>) -> NetworkConfig {
        let mut network = NetworkConfig::new(port)
            .with_ack_timeout(Duration::from_millis(ack_timeout_ms.unwrap_or(self.ack_timeout_ms)));
        network.connect_timeout_ms = self.connect_timeout_ms;
        network
    }

    /// Document store in `dir`, or the configured storage directory
    pub fn store(&self, dir: Option<PathBuf>) -> FileStore {
        FileStore::new(dir.unwrap_or_else(|| self.storage_dir.clone()))
            .with_extension(self.extension.clone())
    }

    /// Server address, falling back to localhost on `default_port`
    pub fn server_or(&self, default_port: u16) -> String {
        self.server
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", default_port))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("dotwire/config.toml")),
            Some(PathBuf::from("./dotwire.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerConfig {
            samples_dir: Some(PathBuf::from("samples")),
            ..Default::default()
        },
        client: ClientConfig {
            server: Some(format!("localhost:{}", DEFAULT_STREAM_PORT)),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.stream_port, DEFAULT_STREAM_PORT);
        assert_eq!(config.server.datagram_port, DEFAULT_DATAGRAM_PORT);
        assert_eq!(config.client.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.client.server_or(8081), "localhost:8081");
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.server.stream_port = 9000;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.server.stream_port, 9000);
        assert_eq!(loaded.client.storage_dir, config.client.storage_dir);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[client]\nserver = \"10.0.0.2:8081\"\n").unwrap();
        assert_eq!(config.client.server.as_deref(), Some("10.0.0.2:8081"));
        assert_eq!(config.client.ack_timeout_ms, 5000);
        assert_eq!(config.server.storage_dir, PathBuf::from("server_storage"));
    }

    #[test]
    fn test_missing_file() {
        let tmp = TempDir::new().unwrap();
        let result = Config::load(&tmp.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.server.samples_dir, Some(PathBuf::from("samples")));
    }

    #[test]
    fn test_client_network_timeouts() {
        let client: ClientConfig =
            toml::from_str("ack_timeout_ms = 750\nconnect_timeout_ms = 300\n").unwrap();

        let network = client.network(DEFAULT_STREAM_PORT, None);
        assert_eq!(network.ack_timeout(), Some(Duration::from_millis(750)));
        assert_eq!(network.connect_timeout(), Duration::from_millis(300));

        let network = client.network(DEFAULT_STREAM_PORT, Some(2000));
        assert_eq!(network.ack_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_store_extension_and_dir() {
        let server: ServerConfig = toml::from_str("extension = \"gv\"\n").unwrap();
        assert_eq!(ServerConfig::default().extension, "dot");

        let store = server.store(None);
        assert_eq!(store.dir(), Path::new("server_storage"));
        assert_eq!(store.path_for("g1").unwrap(), PathBuf::from("server_storage/g1.gv"));

        let store = ClientConfig::default().store(Some(PathBuf::from("out")));
        assert_eq!(store.dir(), Path::new("out"));
        assert_eq!(store.path_for("g1").unwrap(), PathBuf::from("out/g1.dot"));
    }

    #[test]
    fn test_server_network() {
        let network = ServerConfig::default().network(DEFAULT_DATAGRAM_PORT);
        assert_eq!(network.bind_addr(), "0.0.0.0:8081");
    }
}
