//! ChainFS Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions, checksum helpers
//! and configuration used by the block transfer pipeline and the data node.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::PacketChecksum;
pub use config::{Config, NodeConfig, TransferConfig};
pub use error::{Error, Result};
pub use types::*;
