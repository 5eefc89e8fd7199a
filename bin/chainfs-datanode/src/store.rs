//! Block storage for the data node
//!
//! Blocks are written once, after their last packet arrived and the rest
//! of the chain confirmed them. Each stored block keeps a crc32c of its
//! contents that is checked again whenever the block is read.

use chainfs_common::checksum::ChecksumCalculator;
use chainfs_common::{BlockId, Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Finalized block storage
pub trait BlockStore: Send + Sync {
    /// Store a complete block, replacing any previous copy
    fn put(&self, block_id: BlockId, data: Vec<u8>) -> Result<()>;

    /// Fetch a block, verifying its contents
    fn get(&self, block_id: BlockId) -> Result<Arc<[u8]>>;

    /// Check if a block is stored
    fn contains(&self, block_id: BlockId) -> bool;

    /// Identifiers of all stored blocks
    fn block_ids(&self) -> Vec<BlockId>;
}

#[derive(Debug)]
struct StoredBlock {
    data: Arc<[u8]>,
    crc: u32,
}

/// Block store held in memory
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<BlockId, StoredBlock>>,
}

impl MemoryBlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip one stored byte without updating the block checksum
    ///
    /// Simulates media corruption.
    pub fn corrupt(&self, block_id: BlockId, index: usize) -> Result<()> {
        let mut blocks = self.blocks.write();
        let block = blocks
            .get_mut(&block_id)
            .ok_or(Error::BlockNotFound(block_id))?;
        if index >= block.data.len() {
            return Err(Error::invalid_operation(format!(
                "index {index} outside block {block_id} of {} bytes",
                block.data.len()
            )));
        }

        let mut data = block.data.to_vec();
        data[index] ^= 0xff;
        block.data = data.into();
        Ok(())
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, block_id: BlockId, data: Vec<u8>) -> Result<()> {
        let mut calc = ChecksumCalculator::new();
        calc.update(&data);
        debug!(%block_id, len = calc.bytes(), crc = calc.value(), "storing block");

        self.blocks.write().insert(
            block_id,
            StoredBlock {
                data: data.into(),
                crc: calc.value(),
            },
        );
        Ok(())
    }

    fn get(&self, block_id: BlockId) -> Result<Arc<[u8]>> {
        let blocks = self.blocks.read();
        let block = blocks.get(&block_id).ok_or(Error::BlockNotFound(block_id))?;

        let mut calc = ChecksumCalculator::new();
        calc.update(&block.data);
        if calc.value() != block.crc {
            error!(%block_id, "stored block failed checksum verification");
            return Err(Error::ChecksumMismatch {
                expected: block.crc,
                actual: calc.value(),
            });
        }
        Ok(Arc::clone(&block.data))
    }

    fn contains(&self, block_id: BlockId) -> bool {
        self.blocks.read().contains_key(&block_id)
    }

    fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.read().keys().copied().collect()
    }
}
