//! ChainFS Client - Block transfer pipeline
//!
//! This crate streams file content between clients and storage nodes:
//!
//! - [`packet`]: checksummed unit of streamed block data and its codec
//! - [`queue`]: fixed-capacity single-producer/single-consumer packet ring
//! - [`protocol`]: request headers and status framing
//! - [`transmitter`]: background worker pushing packets down a replica chain
//! - [`write_stream`]: sequential file writer, one transmitter per block
//! - [`read_stream`]: random-access file reader with replica fail-over
//! - [`meta`]: the metadata service contract consumed by the streams

pub mod meta;
pub mod packet;
pub mod protocol;
pub mod queue;
pub mod read_stream;
pub mod replica;
pub mod transmitter;
pub mod write_stream;

// Re-exports
pub use meta::{LocalMetadata, MetadataService};
pub use packet::Packet;
pub use queue::PacketQueue;
pub use read_stream::BlockReadStream;
pub use transmitter::BlockTransmitter;
pub use write_stream::BlockWriteStream;
