use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::protocol::validate_name;
use crate::utils::{P2PError, Result};

pub const DEFAULT_TRACKER_PORT: u16 = 8000;
pub const DEFAULT_TRANSFER_PORT: u16 = 9001;
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub ping_timeout_secs: u64,
    pub max_line_len: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_TRACKER_PORT,
            ping_timeout_secs: 3,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

impl TrackerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| P2PError::ConfigError(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_timeout_secs == 0 {
            return Err(P2PError::ConfigError(
                "ping timeout must be at least one second".to_string(),
            ));
        }
        if self.max_line_len < 64 {
            return Err(P2PError::ConfigError(format!(
                "max line length {} is too small",
                self.max_line_len
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub hostname: String,
    /// Tracker control address (host:port)
    pub tracker_addr: String,
    /// Port for incoming transfers; 0 picks an ephemeral port
    pub transfer_port: u16,
    pub shared_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_line_len: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            hostname: "peer".to_string(),
            tracker_addr: format!("127.0.0.1:{}", DEFAULT_TRACKER_PORT),
            transfer_port: DEFAULT_TRANSFER_PORT,
            shared_dir: PathBuf::from("./shared"),
            request_timeout_secs: 10,
            connect_timeout_secs: 5,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

impl PeerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| P2PError::ConfigError(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.hostname)
            .map_err(|e| P2PError::ConfigError(format!("invalid hostname: {}", e)))?;
        if self.tracker_addr.trim().is_empty() {
            return Err(P2PError::ConfigError(
                "tracker address is required".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(P2PError::ConfigError(
                "timeouts must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
