//! Configuration handling for irlink

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::lirc::client::{CaptureOptions, ConnectionOptions};
use crate::lirc::transmitters::{DEFAULT_PORT_COUNT, TransmitterMask};
use crate::lirc::transport::{DEFAULT_SOCKET_PATH, DEFAULT_TCP_PORT};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub transmitters: TransmittersConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP endpoint, `host` or `host:port`
    pub address: String,
    /// Unix socket path; takes precedence over `address` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,
    /// Deadline for one response block
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmittersConfig {
    pub port_count: usize,
    /// Ports to select right after connecting (1-based)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub begin_timeout_ms: u64,
    pub ending_timeout_ms: u64,
    pub max_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: format!("localhost:{}", DEFAULT_TCP_PORT),
            socket: None,
            timeout_ms: 5000,
        }
    }
}

impl Default for TransmittersConfig {
    fn default() -> Self {
        Self {
            port_count: DEFAULT_PORT_COUNT,
            default: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            begin_timeout_ms: 10_000,
            ending_timeout_ms: 300,
            max_size: 500,
        }
    }
}

/// Where the daemon is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Config file path (respects XDG_CONFIG_HOME and HOME)
    pub fn default_path() -> PathBuf {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("irlink").join("config.toml");
        }

        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join("irlink").join("config.toml");
        }

        if let Some(config) = dirs::config_dir() {
            return config.join("irlink").join("config.toml");
        }

        PathBuf::from("irlink.toml")
    }

    /// Config with the daemon reached over the conventional Unix socket
    pub fn local_socket() -> Self {
        let mut config = Self::default();
        config.daemon.socket = Some(PathBuf::from(DEFAULT_SOCKET_PATH));
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.timeout_ms == 0 {
            return Err(ConfigError::Invalid("daemon.timeout_ms must be positive".to_string()));
        }
        if self.capture.max_size == 0 {
            return Err(ConfigError::Invalid("capture.max_size must be positive".to_string()));
        }
        self.default_mask()?;
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        match &self.daemon.socket {
            Some(path) => Endpoint::Unix(path.clone()),
            None => Endpoint::Tcp(self.daemon.address.clone()),
        }
    }

    /// Mask for `[transmitters] default`, checked against the port count
    pub fn default_mask(&self) -> Result<Option<TransmitterMask>, ConfigError> {
        let width = self.transmitters.port_count;
        // Checks the port count even when no default is configured
        TransmitterMask::none(width).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        self.transmitters
            .default
            .as_ref()
            .map(|ports| TransmitterMask::from_ports(ports.iter().copied(), width))
            .transpose()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            timeout: Duration::from_millis(self.daemon.timeout_ms),
            port_count: self.transmitters.port_count,
            capture: CaptureOptions {
                begin_timeout: Duration::from_millis(self.capture.begin_timeout_ms),
                ending_timeout: Duration::from_millis(self.capture.ending_timeout_ms),
                max_size: self.capture.max_size,
            },
        }
    }
}
