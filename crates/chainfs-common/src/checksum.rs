//! Checksum utilities for ChainFS
//!
//! Every packet on the wire carries a CRC32C over its payload. Storage
//! nodes additionally keep a CRC32C per stored block and check it on
//! every read.

use serde::{Deserialize, Serialize};
use std::fmt;

/// CRC32C checksum of one packet payload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketChecksum(u32);

impl PacketChecksum {
    /// Compute the checksum of a payload
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(crc32c::crc32c(data))
    }

    /// Verify a payload against this checksum
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.0
    }

    /// Raw value as sent on the wire
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PacketChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Streaming CRC32C calculator
#[derive(Clone, Debug, Default)]
pub struct ChecksumCalculator {
    crc32c: u32,
    bytes: u64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub const fn new() -> Self {
        Self { crc32c: 0, bytes: 0 }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Current checksum value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.crc32c
    }

    /// Reset the calculator for reuse
    pub fn reset(&mut self) {
        self.crc32c = 0;
        self.bytes = 0;
    }
}
