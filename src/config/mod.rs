//! Configuration management

use crate::rate::Rate;
use crate::DEFAULT_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunable options of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum allowed exchange-rate degradation relative to the first
    /// measured rate.
    pub slippage: Rate,
    /// Pad every encrypted packet to the maximum plaintext size.
    pub enable_padding: bool,
    /// Opaque identifier forwarded by the server that handed out the
    /// shared secret.
    pub connection_tag: Option<String>,
    /// The peer's cap on concurrently open streams.
    pub max_remote_streams: u64,
    /// Per-direction data window in bytes.
    pub connection_buffer_size: u64,
    /// Minimum number of significant digits the rate probe must measure.
    pub min_exchange_rate_precision: u32,
    /// Milliseconds of inactivity before the connection destroys itself.
    /// Zero disables the idle timer.
    pub idle_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            slippage: Rate::new(1, 100).unwrap_or(Rate::ZERO),
            enable_padding: false,
            connection_tag: None,
            max_remote_streams: 10,
            connection_buffer_size: DEFAULT_BUFFER_SIZE,
            min_exchange_rate_precision: 3,
            idle_timeout_ms: 60_000,
        }
    }
}

impl ConnectionConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.slippage.denom() == 0 {
            return Err(crate::Error::Config(
                "slippage denominator must be nonzero".to_string(),
            ));
        }
        if !self.slippage.is_proper() {
            return Err(crate::Error::Config(format!(
                "slippage must be within [0, 1], got {}",
                self.slippage
            )));
        }
        if self.connection_buffer_size == 0 {
            return Err(crate::Error::Config(
                "connection_buffer_size must be positive".to_string(),
            ));
        }
        if self.max_remote_streams == 0 {
            return Err(crate::Error::Config(
                "max_remote_streams must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
