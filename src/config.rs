use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Default listening port
pub const DEFAULT_PORT: u16 = 3479;

/// Configuration for a mesh node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Address to listen on
    pub listen_addr: IpAddr,

    /// Listening port; 0 picks an ephemeral port at bind time
    pub port: u16,

    /// Dial timeout in seconds
    pub connect_timeout: u64,

    /// Admission handshake timeout in seconds
    pub handshake_timeout: u64,

    /// Keep-alive send interval in seconds
    pub keep_alive_interval: u64,

    /// Idle bound in seconds after which a silent connection is closed
    pub idle_timeout: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".parse().unwrap(),
            port: DEFAULT_PORT,
            connect_timeout: 10,
            handshake_timeout: 5,
            keep_alive_interval: 5,
            idle_timeout: 120,
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let config_str = fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&config_str)
            .map_err(|e| MeshError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), MeshError> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| MeshError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, config_str)
            .map_err(|e| MeshError::Config(format!("Failed to write config file: {}", e)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}
