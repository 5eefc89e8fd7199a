//! ChainFS data node
//!
//! A storage node speaking the block transfer protocol over TCP:
//!
//! - [`service`]: connection handling for block reads and chained writes
//! - [`store`]: block storage behind the service

pub mod service;
pub mod store;

pub use service::DataNode;
pub use store::{BlockStore, MemoryBlockStore};
