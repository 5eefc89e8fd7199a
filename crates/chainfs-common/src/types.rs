//! Core type definitions for ChainFS
//!
//! This module defines the identifiers and metadata structures shared by
//! the transfer pipeline, the metadata service contract and the data node.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Unique 128-bit identifier for a block
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Generate a new random block ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw wire bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered list of storage nodes holding one block
///
/// The first entry is the node a writer connects to; the order is the
/// write-forwarding order of chain replication.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, From, Into)]
pub struct ReplicaChain(Vec<SocketAddr>);

impl ReplicaChain {
    /// Create a chain from an ordered node list
    #[must_use]
    pub const fn new(nodes: Vec<SocketAddr>) -> Self {
        Self(nodes)
    }

    /// First hop, if any
    #[must_use]
    pub fn head(&self) -> Option<SocketAddr> {
        self.0.first().copied()
    }

    /// The nodes after the first hop
    #[must_use]
    pub fn downstream(&self) -> &[SocketAddr] {
        self.0.get(1..).unwrap_or(&[])
    }

    /// All nodes in chain order
    #[must_use]
    pub fn nodes(&self) -> &[SocketAddr] {
        &self.0
    }

    /// Number of replicas
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the chain has no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ReplicaChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for node in &self.0 {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{node}")?;
            first = false;
        }
        Ok(())
    }
}

/// A block together with the nodes that hold it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlock {
    /// Block identifier
    pub id: BlockId,
    /// Replica chain for the block
    pub chain: ReplicaChain,
}

/// File metadata as returned by the metadata service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File path
    pub path: String,
    /// Total size in bytes
    pub size: u64,
    /// Ordered block identifiers
    pub block_ids: Vec<BlockId>,
    /// Configured block size; every block but the last is exactly this long
    pub block_size: u64,
    /// True while a writer holds the file open
    pub open_for_write: bool,
}

impl FileInfo {
    /// Index of the block covering `position`
    #[must_use]
    pub const fn block_index(&self, position: u64) -> usize {
        (position / self.block_size) as usize
    }

    /// Byte offset at which block `index` starts
    #[must_use]
    pub const fn block_start(&self, index: usize) -> u64 {
        index as u64 * self.block_size
    }

    /// Length of block `index` given the file size
    #[must_use]
    pub fn block_len(&self, index: usize) -> u64 {
        let start = self.block_start(index);
        self.size.saturating_sub(start).min(self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_bytes() {
        let id = BlockId::new();
        let restored = BlockId::from_bytes(*id.as_bytes());
        assert_eq!(id, restored);
    }

    #[test]
    fn test_replica_chain_downstream() {
        let a: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:7002".parse().unwrap();
        let c: SocketAddr = "127.0.0.1:7003".parse().unwrap();
        let chain = ReplicaChain::new(vec![a, b, c]);

        assert_eq!(chain.head(), Some(a));
        assert_eq!(chain.downstream(), &[b, c]);
        assert_eq!(chain.to_string(), "127.0.0.1:7001 -> 127.0.0.1:7002 -> 127.0.0.1:7003");

        let empty = ReplicaChain::default();
        assert!(empty.head().is_none());
        assert!(empty.downstream().is_empty());
    }

    #[test]
    fn test_file_info_block_math() {
        let info = FileInfo {
            path: "/data/f".into(),
            size: 250,
            block_ids: vec![BlockId::new(), BlockId::new(), BlockId::new()],
            block_size: 100,
            open_for_write: false,
        };

        assert_eq!(info.block_index(0), 0);
        assert_eq!(info.block_index(99), 0);
        assert_eq!(info.block_index(100), 1);
        assert_eq!(info.block_index(249), 2);
        assert_eq!(info.block_start(2), 200);
        assert_eq!(info.block_len(0), 100);
        assert_eq!(info.block_len(2), 50);
        assert_eq!(info.block_len(3), 0);
    }
}
