//! Metadata service contract
//!
//! The streams never decide where blocks live; they ask a metadata service
//! for new blocks, replica chains and file layouts. [`LocalMetadata`] is an
//! in-process implementation that places replicas round-robin over a
//! registered node list.

use chainfs_common::{
    BlockId, Error, FileInfo, LocatedBlock, ReplicaChain, Result, TransferConfig,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

/// Namespace and placement authority consumed by the streams
pub trait MetadataService: Send + Sync {
    /// Create `path` and open it for writing
    fn create_file(&self, path: &str) -> Result<()>;

    /// Append a new block to an open file and choose its replica chain
    fn allocate_or_append_block(&self, path: &str) -> Result<LocatedBlock>;

    /// Record that `block_id` was stored with `length` bytes
    fn commit_block(&self, path: &str, block_id: BlockId, length: u64) -> Result<()>;

    /// Current replica chain of a block
    fn get_replica_chain(&self, block_id: BlockId) -> Result<ReplicaChain>;

    /// Size and block layout of a file
    fn get_file_info(&self, path: &str) -> Result<FileInfo>;

    /// Close a file for writing
    fn close_file(&self, path: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct FileEntry {
    blocks: Vec<BlockId>,
    size: u64,
    open_for_write: bool,
}

#[derive(Debug)]
struct BlockEntry {
    chain: ReplicaChain,
    length: u64,
}

/// In-process metadata service
#[derive(Debug)]
pub struct LocalMetadata {
    block_size: u64,
    replication_factor: usize,
    nodes: RwLock<Vec<SocketAddr>>,
    next_node: AtomicUsize,
    files: RwLock<HashMap<String, FileEntry>>,
    blocks: RwLock<HashMap<BlockId, BlockEntry>>,
}

impl LocalMetadata {
    /// Create a service using the block size and replication factor of `config`
    #[must_use]
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            block_size: config.block_size,
            replication_factor: config.replication_factor,
            nodes: RwLock::new(Vec::new()),
            next_node: AtomicUsize::new(0),
            files: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Make a storage node eligible for new blocks
    pub fn register_node(&self, addr: SocketAddr) {
        let mut nodes = self.nodes.write();
        if !nodes.contains(&addr) {
            nodes.push(addr);
            info!(%addr, "registered storage node");
        }
    }

    /// Override the replica chain of an existing block
    pub fn set_replica_chain(&self, block_id: BlockId, chain: ReplicaChain) -> Result<()> {
        let mut blocks = self.blocks.write();
        let entry = blocks
            .get_mut(&block_id)
            .ok_or(Error::BlockNotFound(block_id))?;
        entry.chain = chain;
        Ok(())
    }

    fn place(&self) -> Result<ReplicaChain> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return Err(Error::metadata("no storage nodes registered"));
        }

        let count = self.replication_factor.min(nodes.len());
        let start = self.next_node.fetch_add(1, Ordering::Relaxed);
        let chain = (0..count)
            .map(|i| nodes[(start + i) % nodes.len()])
            .collect::<Vec<_>>();
        Ok(ReplicaChain::new(chain))
    }
}

impl MetadataService for LocalMetadata {
    fn create_file(&self, path: &str) -> Result<()> {
        let mut files = self.files.write();
        if files.contains_key(path) {
            return Err(Error::metadata(format!("file already exists: {path}")));
        }
        files.insert(
            path.to_string(),
            FileEntry {
                open_for_write: true,
                ..FileEntry::default()
            },
        );
        debug!(path, "created file");
        Ok(())
    }

    fn allocate_or_append_block(&self, path: &str) -> Result<LocatedBlock> {
        let chain = self.place()?;
        let mut files = self.files.write();
        let file = files
            .get_mut(path)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
        if !file.open_for_write {
            return Err(Error::metadata(format!("file is not open for write: {path}")));
        }

        let id = BlockId::new();
        file.blocks.push(id);
        self.blocks.write().insert(
            id,
            BlockEntry {
                chain: chain.clone(),
                length: 0,
            },
        );
        debug!(path, block_id = %id, %chain, "allocated block");
        Ok(LocatedBlock { id, chain })
    }

    fn commit_block(&self, path: &str, block_id: BlockId, length: u64) -> Result<()> {
        if length > self.block_size {
            return Err(Error::metadata(format!(
                "block {block_id} length {length} exceeds block size {}",
                self.block_size
            )));
        }

        let mut files = self.files.write();
        let file = files
            .get_mut(path)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
        if !file.blocks.contains(&block_id) {
            return Err(Error::BlockNotFound(block_id));
        }

        let mut blocks = self.blocks.write();
        let entry = blocks
            .get_mut(&block_id)
            .ok_or(Error::BlockNotFound(block_id))?;
        file.size = file.size - entry.length + length;
        entry.length = length;
        Ok(())
    }

    fn get_replica_chain(&self, block_id: BlockId) -> Result<ReplicaChain> {
        self.blocks
            .read()
            .get(&block_id)
            .map(|entry| entry.chain.clone())
            .ok_or(Error::BlockNotFound(block_id))
    }

    fn get_file_info(&self, path: &str) -> Result<FileInfo> {
        let files = self.files.read();
        let file = files
            .get(path)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
        Ok(FileInfo {
            path: path.to_string(),
            size: file.size,
            block_ids: file.blocks.clone(),
            block_size: self.block_size,
            open_for_write: file.open_for_write,
        })
    }

    fn close_file(&self, path: &str) -> Result<()> {
        let mut files = self.files.write();
        let file = files
            .get_mut(path)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
        file.open_for_write = false;
        info!(path, size = file.size, blocks = file.blocks.len(), "closed file");
        Ok(())
    }
}
