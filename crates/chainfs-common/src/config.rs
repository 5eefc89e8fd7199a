//! Configuration types for ChainFS
//!
//! This module defines the configuration consumed by the transfer pipeline
//! and the data node. Every field has a default so partial TOML files load.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Root configuration for ChainFS
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block transfer configuration
    pub transfer: TransferConfig,
    /// Data node configuration
    pub node: NodeConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))?;
        config.transfer.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }
}

/// Streaming parameters shared by writers, readers and nodes
///
/// None of these are negotiated on the wire; both ends must agree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum payload bytes per packet (default: 64 KiB)
    pub max_packet_size: usize,
    /// Packet slots per transfer queue (default: 10)
    pub queue_capacity: usize,
    /// Socket read/write timeout in milliseconds (default: 30s)
    pub io_timeout_ms: u64,
    /// Connect timeout in milliseconds (default: 30s)
    pub connect_timeout_ms: u64,
    /// Block size in bytes (default: 64 MiB)
    pub block_size: u64,
    /// Replicas per block (default: 3)
    pub replication_factor: usize,
    /// Addresses considered to be on this host when choosing a replica
    pub local_addrs: Vec<IpAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 64 * 1024,        // 64 KiB
            queue_capacity: 10,
            io_timeout_ms: 30_000,
            connect_timeout_ms: 30_000,
            block_size: 64 * 1024 * 1024,      // 64 MiB
            replication_factor: 3,
            local_addrs: Vec::new(),
        }
    }
}

impl TransferConfig {
    /// Socket read/write timeout
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Connect timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check the invariants the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity < 2 {
            return Err(Error::Configuration(format!(
                "queue_capacity must be at least 2, got {}",
                self.queue_capacity
            )));
        }
        if self.max_packet_size == 0 || self.max_packet_size > u32::MAX as usize {
            return Err(Error::Configuration(format!(
                "max_packet_size out of range: {}",
                self.max_packet_size
            )));
        }
        if self.block_size == 0 {
            return Err(Error::Configuration("block_size must be non-zero".into()));
        }
        if self.replication_factor == 0 {
            return Err(Error::Configuration(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.io_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::Configuration("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Data node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listen address for the block transfer protocol
    pub listen: SocketAddr,
    /// Log level
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9866)),
            log_level: "info".to_string(),
        }
    }
}
