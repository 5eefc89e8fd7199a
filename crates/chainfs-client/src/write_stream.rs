//! Sequential block write stream
//!
//! Bytes are staged in a packet-sized buffer and handed to the current
//! block's [`BlockTransmitter`]. A packet never crosses a block boundary:
//! the packet that completes a block is marked last, the transmitter is
//! drained and committed, and the next block is allocated when the next
//! byte arrives. Every block but the file's last therefore carries exactly
//! `block_size` bytes.

use crate::meta::MetadataService;
use crate::transmitter::BlockTransmitter;
use chainfs_common::{Error, Result, TransferConfig};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Application-facing writer for one file
pub struct BlockWriteStream {
    path: String,
    meta: Arc<dyn MetadataService>,
    config: TransferConfig,
    /// Staging buffer, at most one packet
    buffer: Vec<u8>,
    /// Transmitter of the block being written
    current: Option<BlockTransmitter>,
    /// Bytes already enqueued to `current`
    bytes_in_block: u64,
    bytes_written: u64,
    blocks_written: usize,
    closed: bool,
    /// First failure, reported by every later call
    failed: Option<Arc<Error>>,
}

impl BlockWriteStream {
    /// Create `path` and open it for writing
    pub fn create(
        path: impl Into<String>,
        meta: Arc<dyn MetadataService>,
        config: &TransferConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.into();
        meta.create_file(&path)?;
        info!(path = %path, "opened file for write");

        Ok(Self {
            path,
            meta,
            config: config.clone(),
            buffer: Vec::with_capacity(config.max_packet_size),
            current: None,
            bytes_in_block: 0,
            bytes_written: 0,
            blocks_written: 0,
            closed: false,
            failed: None,
        })
    }

    /// File path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bytes accepted so far
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Blocks fully stored and committed so far
    #[must_use]
    pub const fn blocks_written(&self) -> usize {
        self.blocks_written
    }

    /// Append `data` to the file
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_failed()?;
        if self.closed {
            return Err(Error::invalid_operation(format!(
                "write to closed file {}",
                self.path
            )));
        }
        self.write_packets(data).map_err(|e| self.abort(e))
    }

    /// Flush the final packet, wait for the chain and close the file
    pub fn close(&mut self) -> Result<()> {
        self.check_failed()?;
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.finish().map_err(|e| self.abort(e))
    }

    fn write_packets(&mut self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            // A full buffer is only sent once more bytes follow, so the
            // file's final packet always carries data
            if self.buffer.len() == self.packet_limit() {
                self.flush_packet(false)?;
            }

            let take = (self.packet_limit() - self.buffer.len()).min(remaining.len());
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            self.bytes_written += take as u64;

            if self.bytes_in_block + self.buffer.len() as u64 == self.config.block_size {
                self.flush_packet(false)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.buffer.is_empty() || self.current.is_some() {
            self.flush_packet(true)?;
        }
        self.meta.close_file(&self.path)?;
        info!(
            path = %self.path,
            bytes = self.bytes_written,
            blocks = self.blocks_written,
            "closed file"
        );
        Ok(())
    }

    fn check_failed(&self) -> Result<()> {
        match &self.failed {
            Some(cause) => Err(Error::Aborted {
                path: self.path.clone(),
                source: Arc::clone(cause),
            }),
            None => Ok(()),
        }
    }

    /// Remember the first failure and abandon the block in flight
    fn abort(&mut self, err: Error) -> Error {
        let cause = Arc::new(err);
        warn!(path = %self.path, error = %cause, "write stream failed");
        self.failed = Some(Arc::clone(&cause));
        self.current = None;
        self.buffer.clear();
        Error::Aborted {
            path: self.path.clone(),
            source: cause,
        }
    }

    /// Payload limit of the next packet: a full packet or the rest of the block
    fn packet_limit(&self) -> usize {
        let left_in_block = self.config.block_size - self.bytes_in_block;
        usize::try_from(left_in_block).map_or(self.config.max_packet_size, |left| {
            left.min(self.config.max_packet_size)
        })
    }

    fn flush_packet(&mut self, final_packet: bool) -> Result<()> {
        let is_last = final_packet
            || self.bytes_in_block + self.buffer.len() as u64 == self.config.block_size;

        if self.current.is_none() {
            self.start_block()?;
        }
        let Some(tx) = self.current.as_mut() else {
            return Err(Error::invalid_operation("no active block transmitter"));
        };
        tx.check_error()?;
        tx.enqueue(&self.buffer, is_last)?;
        self.bytes_in_block += self.buffer.len() as u64;
        self.buffer.clear();

        if is_last {
            self.finish_block()?;
        }
        Ok(())
    }

    fn start_block(&mut self) -> Result<()> {
        let located = self.meta.allocate_or_append_block(&self.path)?;
        debug!(
            path = %self.path,
            block_id = %located.id,
            chain = %located.chain,
            "starting block"
        );
        self.current = Some(BlockTransmitter::origin(located.id, located.chain, &self.config)?);
        self.bytes_in_block = 0;
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        let Some(tx) = self.current.as_mut() else {
            return Ok(());
        };
        tx.await_completion()?;
        let block_id = tx.block_id();
        self.meta.commit_block(&self.path, block_id, self.bytes_in_block)?;
        self.current = None;

        debug!(
            path = %self.path,
            %block_id,
            length = self.bytes_in_block,
            "block committed"
        );
        self.blocks_written += 1;
        self.bytes_in_block = 0;
        Ok(())
    }
}

impl std::io::Write for BlockWriteStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Self::write(self, buf).map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    /// Packets are sent when full; partial packets wait for `close`
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for BlockWriteStream {
    fn drop(&mut self) {
        if !self.closed && self.failed.is_none() {
            warn!(path = %self.path, "write stream dropped without close; abandoning block");
        }
    }
}

impl std::fmt::Debug for BlockWriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWriteStream")
            .field("path", &self.path)
            .field("bytes_written", &self.bytes_written)
            .field("blocks_written", &self.blocks_written)
            .field("closed", &self.closed)
            .field("failed", &self.failed.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::LocalMetadata;
    use crate::packet::Packet;
    use crate::protocol::{RequestHeader, Status};
    use chainfs_common::BlockId;
    use parking_lot::Mutex;
    use std::net::{SocketAddr, TcpListener};
    use std::thread;

    /// (block, packet lengths, last flags) per accepted write
    type Recorded = Arc<Mutex<Vec<(BlockId, Vec<(usize, bool)>)>>>;

    /// Chain head that records packet boundaries, acks every packet and
    /// ends each block with `final_status`
    fn spawn_recording_head(
        max_packet_size: usize,
        final_status: Status,
    ) -> (SocketAddr, Recorded) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded: Recorded = Arc::default();
        let log = Arc::clone(&recorded);

        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else { break };
                let RequestHeader::WriteBlock { block_id, .. } =
                    RequestHeader::read_from(&mut conn).unwrap()
                else {
                    panic!("expected write header");
                };
                Status::Ok.write_to(&mut conn).unwrap();

                let mut packets = Vec::new();
                let mut packet = Packet::new(max_packet_size);
                loop {
                    packet.decode(&mut conn).unwrap();
                    packets.push((packet.len(), packet.is_last()));
                    Status::Ok.write_to(&mut conn).unwrap();
                    if packet.is_last() {
                        break;
                    }
                }
                log.lock().push((block_id, packets));
                final_status.write_to(&mut conn).unwrap();
            }
        });
        (addr, recorded)
    }

    fn setup(block_size: u64) -> (Arc<LocalMetadata>, TransferConfig, Recorded) {
        setup_with_head(block_size, Status::Ok)
    }

    fn setup_with_head(
        block_size: u64,
        final_status: Status,
    ) -> (Arc<LocalMetadata>, TransferConfig, Recorded) {
        let config = TransferConfig {
            max_packet_size: 64,
            queue_capacity: 3,
            block_size,
            replication_factor: 1,
            io_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            ..TransferConfig::default()
        };
        let (addr, recorded) = spawn_recording_head(64, final_status);
        let meta = Arc::new(LocalMetadata::new(&config));
        meta.register_node(addr);
        (meta, config, recorded)
    }

    #[test]
    fn test_two_and_a_half_blocks() {
        let (meta, config, recorded) = setup(256);
        let mut stream = BlockWriteStream::create("/f", meta.clone(), &config).unwrap();

        let data: Vec<u8> = (0..640u32).map(|i| i as u8).collect();
        for chunk in data.chunks(37) {
            stream.write(chunk).unwrap();
        }
        stream.close().unwrap();
        assert_eq!(stream.blocks_written(), 3);

        let info = meta.get_file_info("/f").unwrap();
        assert_eq!(info.size, 640);
        assert_eq!(info.block_ids.len(), 3);

        let recorded = recorded.lock();
        assert_eq!(recorded.len(), 3);
        for (i, expected_id) in info.block_ids.iter().enumerate() {
            let (block_id, packets) = &recorded[i];
            assert_eq!(block_id, expected_id);

            let total: usize = packets.iter().map(|(len, _)| len).sum();
            let (last_len, last_flag) = packets[packets.len() - 1];
            assert!(last_flag);
            assert!(last_len > 0);
            assert!(packets[..packets.len() - 1].iter().all(|(_, last)| !last));
            if i < 2 {
                assert_eq!(total, 256);
            } else {
                assert_eq!(total, 128);
            }
        }
    }

    #[test]
    fn test_exact_multiple_has_no_empty_trailing_block() {
        let (meta, config, recorded) = setup(128);
        let mut stream = BlockWriteStream::create("/exact", meta.clone(), &config).unwrap();
        stream.write(&[9u8; 256]).unwrap();
        stream.close().unwrap();

        assert_eq!(stream.blocks_written(), 2);
        assert_eq!(meta.get_file_info("/exact").unwrap().size, 256);
        assert_eq!(recorded.lock().len(), 2);
    }

    #[test]
    fn test_block_size_not_multiple_of_packet_size() {
        let (meta, config, recorded) = setup(100);
        let mut stream = BlockWriteStream::create("/odd", meta.clone(), &config).unwrap();
        stream.write(&[1u8; 250]).unwrap();
        stream.close().unwrap();

        let recorded = recorded.lock();
        let sizes: Vec<Vec<(usize, bool)>> = recorded.iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(
            sizes,
            vec![
                vec![(64, false), (36, true)],
                vec![(64, false), (36, true)],
                vec![(50, true)],
            ]
        );
    }

    #[test]
    fn test_empty_file_allocates_no_blocks() {
        let (meta, config, recorded) = setup(128);
        let mut stream = BlockWriteStream::create("/empty", meta.clone(), &config).unwrap();
        stream.close().unwrap();

        let info = meta.get_file_info("/empty").unwrap();
        assert_eq!(info.size, 0);
        assert!(info.block_ids.is_empty());
        assert!(!info.open_for_write);
        assert!(recorded.lock().is_empty());
    }

    #[test]
    fn test_write_after_close_is_rejected() {
        let (meta, config, _recorded) = setup(128);
        let mut stream = BlockWriteStream::create("/c", meta, &config).unwrap();
        stream.write(b"abc").unwrap();
        stream.close().unwrap();
        stream.close().unwrap();

        assert!(matches!(stream.write(b"more"), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_failed_block_aborts_the_stream() {
        let (meta, config, recorded) = setup_with_head(128, Status::Error);
        let mut stream = BlockWriteStream::create("/failed", meta.clone(), &config).unwrap();

        match stream.write(&[1u8; 128]).unwrap_err() {
            Error::Aborted { source, .. } => {
                assert!(matches!(*source, Error::Transfer { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(stream.write(&[2u8; 100]), Err(Error::Aborted { .. })));
        assert!(matches!(stream.close(), Err(Error::Aborted { .. })));
        assert!(stream.close().is_err());
        assert_eq!(stream.blocks_written(), 0);

        // Only the failed block was allocated and nothing was committed
        let info = meta.get_file_info("/failed").unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(info.block_ids.len(), 1);
        assert_eq!(recorded.lock().len(), 1);
    }

    #[test]
    fn test_unreachable_chain_surfaces_error() {
        let config = TransferConfig {
            max_packet_size: 64,
            queue_capacity: 2,
            block_size: 1024,
            replication_factor: 1,
            io_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
            ..TransferConfig::default()
        };
        let dead = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let meta = Arc::new(LocalMetadata::new(&config));
        meta.register_node(dead);

        let mut stream = BlockWriteStream::create("/dead", meta, &config).unwrap();
        let outcome = stream.write(&[0u8; 200]).and_then(|()| stream.close());
        assert!(outcome.is_err());
    }
}
