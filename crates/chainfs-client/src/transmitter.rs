//! Block transmitter
//!
//! A transmitter owns one block transfer attempt: a [`PacketQueue`] fed by
//! the caller and a background thread that drains it onto a connection.
//!
//! Two modes:
//! - **Origin**: connect to the head of a replica chain, send a
//!   `WriteBlock` header naming the rest of the chain, wait for `Ok`, then
//!   stream. The head acknowledges every packet and sends a final status
//!   once the whole chain has stored the block.
//! - **Forwarding**: stream over a connection someone else accepted. The
//!   worker writes `Ok` and the starting offset, then precedes every packet
//!   with an `Ok` status. The peer sends no acknowledgments and no final
//!   status is awaited; end of stream is the last-packet flag.
//!
//! State progression: `Connecting -> HeaderExchange -> Streaming ->
//! AwaitingFinalAck -> Closed | Failed`. The first error is kept and the
//! queue is cancelled so the caller never blocks on a dead worker.

use crate::protocol::{self, RequestHeader, Status};
use crate::queue::PacketQueue;
use chainfs_common::{BlockId, Error, ReplicaChain, Result, TransferConfig};
use parking_lot::Mutex;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Lifecycle of one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferState {
    Connecting = 0,
    HeaderExchange = 1,
    Streaming = 2,
    AwaitingFinalAck = 3,
    Closed = 4,
    Failed = 5,
}

impl TransferState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::HeaderExchange,
            2 => Self::Streaming,
            3 => Self::AwaitingFinalAck,
            4 => Self::Closed,
            _ => Self::Failed,
        }
    }
}

/// How the worker obtains its connection
#[derive(Debug)]
pub enum TransmitMode {
    /// Open a connection to the chain head and send a write header
    Origin { chain: ReplicaChain },
    /// Stream over an accepted connection starting at `offset`
    Forwarding { stream: TcpStream, offset: u64 },
}

/// State shared between the caller and the worker
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    error: Mutex<Option<Arc<Error>>>,
    acked: AtomicU64,
    /// Clone of the worker's socket so the owner can abort blocking I/O
    socket: Mutex<Option<TcpStream>>,
}

impl Shared {
    fn set_state(&self, state: TransferState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record `err` unless an earlier error is already stored
    fn fail(&self, err: Error) -> Arc<Error> {
        let mut slot = self.error.lock();
        let stored = slot.get_or_insert_with(|| Arc::new(err));
        self.set_state(TransferState::Failed);
        Arc::clone(stored)
    }

    fn error(&self) -> Option<Arc<Error>> {
        self.error.lock().clone()
    }
}

/// Streams the packets of one block to a peer on a background thread
pub struct BlockTransmitter {
    block_id: BlockId,
    queue: Arc<PacketQueue>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    last_enqueued: bool,
    enqueued: u64,
}

impl BlockTransmitter {
    /// Start writing `block_id` to `chain`, head first
    pub fn origin(block_id: BlockId, chain: ReplicaChain, config: &TransferConfig) -> Result<Self> {
        if chain.is_empty() {
            return Err(Error::invalid_operation(format!(
                "empty replica chain for block {block_id}"
            )));
        }
        Self::start(block_id, TransmitMode::Origin { chain }, config)
    }

    /// Start streaming `block_id` over an accepted connection
    pub fn forwarding(
        block_id: BlockId,
        stream: TcpStream,
        offset: u64,
        config: &TransferConfig,
    ) -> Result<Self> {
        Self::start(block_id, TransmitMode::Forwarding { stream, offset }, config)
    }

    fn start(block_id: BlockId, mode: TransmitMode, config: &TransferConfig) -> Result<Self> {
        let queue = Arc::new(PacketQueue::new(config.queue_capacity, config.max_packet_size)?);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(TransferState::Connecting as u8),
            error: Mutex::new(None),
            acked: AtomicU64::new(0),
            socket: Mutex::new(None),
        });

        let worker = Worker {
            block_id,
            queue: Arc::clone(&queue),
            shared: Arc::clone(&shared),
            config: config.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("transmit-{block_id}"))
            .spawn(move || worker.run(mode))
            .map_err(Error::Transport)?;

        Ok(Self {
            block_id,
            queue,
            shared,
            worker: Some(handle),
            last_enqueued: false,
            enqueued: 0,
        })
    }

    /// Block being transferred
    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> TransferState {
        TransferState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Packets acknowledged by the peer so far (origin mode)
    #[must_use]
    pub fn acked_packets(&self) -> u64 {
        self.shared.acked.load(Ordering::Acquire)
    }

    /// Packets handed to the queue so far
    #[must_use]
    pub const fn enqueued_packets(&self) -> u64 {
        self.enqueued
    }

    /// Copy `payload` into the next free queue slot
    ///
    /// Blocks while the queue is full.
    pub fn enqueue(&mut self, payload: &[u8], is_last: bool) -> Result<()> {
        if self.last_enqueued {
            return Err(Error::invalid_operation(format!(
                "last packet of block {} already enqueued",
                self.block_id
            )));
        }
        if let Some(cause) = self.shared.error() {
            return Err(Error::transfer(self.block_id, cause));
        }

        let Some(mut slot) = self.queue.acquire_write_slot() else {
            return Err(self.failure());
        };
        slot.fill(payload, is_last)?;
        drop(slot);
        self.queue.commit_write();

        self.enqueued += 1;
        self.last_enqueued = is_last;
        Ok(())
    }

    /// Wait for the worker to finish and report its outcome
    pub fn await_completion(&mut self) -> Result<()> {
        if !self.last_enqueued {
            return Err(Error::invalid_operation(format!(
                "await_completion on block {} before the last packet was enqueued",
                self.block_id
            )));
        }

        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            self.shared
                .fail(Error::invalid_operation("transmit worker panicked"));
        }
        self.check_error()
    }

    /// Fail with the stored worker error, if any
    pub fn check_error(&self) -> Result<()> {
        match self.shared.error() {
            Some(cause) => Err(Error::transfer(self.block_id, cause)),
            None => Ok(()),
        }
    }

    /// Error for an enqueue that found the queue cancelled
    fn failure(&self) -> Error {
        match self.shared.error() {
            Some(cause) => Error::transfer(self.block_id, cause),
            None => Error::invalid_operation(format!(
                "transfer of block {} was cancelled",
                self.block_id
            )),
        }
    }
}

impl Drop for BlockTransmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.queue.cancel();
            if let Some(socket) = self.shared.socket.lock().as_ref() {
                let _ = socket.shutdown(Shutdown::Both);
            }
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for BlockTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTransmitter")
            .field("block_id", &self.block_id)
            .field("state", &self.state())
            .field("enqueued", &self.enqueued)
            .field("last_enqueued", &self.last_enqueued)
            .finish_non_exhaustive()
    }
}

/// Background half of a transmitter
struct Worker {
    block_id: BlockId,
    queue: Arc<PacketQueue>,
    shared: Arc<Shared>,
    config: TransferConfig,
}

impl Worker {
    fn run(self, mode: TransmitMode) {
        match self.transfer(mode) {
            Ok(packets) => {
                self.shared.set_state(TransferState::Closed);
                info!(block_id = %self.block_id, packets, "block transfer complete");
            }
            Err(e) => {
                let stored = self.shared.fail(e);
                self.queue.cancel();
                error!(block_id = %self.block_id, error = %stored, "block transfer failed");
            }
        }
        self.shared.socket.lock().take();
    }

    fn transfer(&self, mode: TransmitMode) -> Result<u64> {
        let (origin, stream) = match mode {
            TransmitMode::Origin { chain } => (true, self.open_chain(&chain)?),
            TransmitMode::Forwarding { stream, offset } => {
                protocol::configure_stream(&stream, &self.config)?;
                self.remember_socket(&stream)?;
                let mut writer = &stream;
                Status::Ok.write_to(&mut writer)?;
                protocol::write_offset(&mut writer, offset)?;
                debug!(block_id = %self.block_id, offset, "forwarding stream opened");
                (false, stream)
            }
        };

        self.shared.set_state(TransferState::Streaming);
        let mut reader = stream.try_clone().map_err(Error::from_io)?;
        let mut writer = BufWriter::with_capacity(self.config.max_packet_size + 64, stream);
        let mut sent = 0u64;

        loop {
            let Some(packet) = self.queue.acquire_read_slot() else {
                return Err(Error::invalid_operation("transfer cancelled"));
            };

            if origin {
                self.drain_acks(&mut reader, sent)?;
            } else {
                Status::Ok.write_to(&mut writer)?;
            }
            packet.encode(&mut writer, true)?;
            let last = packet.is_last();
            drop(packet);
            self.queue.commit_read();
            sent += 1;

            if last {
                break;
            }
        }
        writer.flush().map_err(Error::from_io)?;

        if origin {
            self.shared.set_state(TransferState::AwaitingFinalAck);
            while self.shared.acked.load(Ordering::Acquire) < sent {
                Status::read_from(&mut reader)?.expect_ok("packet ack")?;
                self.shared.acked.fetch_add(1, Ordering::AcqRel);
            }
            Status::read_from(&mut reader)?.expect_ok("final ack")?;
        }
        Ok(sent)
    }

    fn open_chain(&self, chain: &ReplicaChain) -> Result<TcpStream> {
        let head = chain
            .head()
            .ok_or_else(|| Error::invalid_operation("empty replica chain"))?;
        debug!(block_id = %self.block_id, %chain, "connecting to replica chain");

        let stream = protocol::connect(head, &self.config)?;
        self.remember_socket(&stream)?;

        self.shared.set_state(TransferState::HeaderExchange);
        let header = RequestHeader::WriteBlock {
            block_id: self.block_id,
            targets: chain.downstream().to_vec(),
        };
        let mut conn = &stream;
        header.write_to(&mut conn)?;
        Status::read_from(&mut conn)?.expect_ok("write header")?;
        Ok(stream)
    }

    fn remember_socket(&self, stream: &TcpStream) -> Result<()> {
        let clone = stream.try_clone().map_err(Error::from_io)?;
        *self.shared.socket.lock() = Some(clone);
        // The owner may have given up while we were connecting
        if self.queue.is_cancelled() {
            return Err(Error::invalid_operation("transfer cancelled"));
        }
        Ok(())
    }

    /// Consume acknowledgments already buffered on the connection
    ///
    /// Replicas ack asynchronously while packets keep flowing; reading them
    /// before each send keeps a multi-hop chain from stalling on full
    /// socket buffers in both directions.
    fn drain_acks(&self, reader: &mut TcpStream, sent: u64) -> Result<()> {
        reader.set_nonblocking(true).map_err(Error::from_io)?;
        let drained = self.read_available_acks(reader, sent);
        reader.set_nonblocking(false).map_err(Error::from_io)?;
        drained
    }

    fn read_available_acks(&self, reader: &mut TcpStream, sent: u64) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    return Err(Error::Transport(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "replica closed the connection",
                    )));
                }
                Ok(n) => {
                    for byte in &buf[..n] {
                        Status::from_byte(*byte)?.expect_ok("packet ack")?;
                    }
                    let acked = self.shared.acked.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
                    if acked > sent {
                        return Err(Error::protocol(format!(
                            "{acked} acks for {sent} packets sent"
                        )));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use std::net::{SocketAddr, TcpListener};

    fn test_config() -> TransferConfig {
        TransferConfig {
            max_packet_size: 64,
            queue_capacity: 4,
            io_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            ..TransferConfig::default()
        }
    }

    /// Minimal chain head: accepts one write, acks every packet, then
    /// sends `final_status`
    fn spawn_head(final_status: Status) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let header = RequestHeader::read_from(&mut conn).unwrap();
            assert!(matches!(header, RequestHeader::WriteBlock { .. }));
            Status::Ok.write_to(&mut conn).unwrap();

            let mut received = Vec::new();
            let mut packet = Packet::new(64);
            loop {
                packet.decode(&mut conn).unwrap();
                received.extend_from_slice(packet.payload());
                Status::Ok.write_to(&mut conn).unwrap();
                if packet.is_last() {
                    break;
                }
            }
            final_status.write_to(&mut conn).unwrap();
            received
        });
        (addr, handle)
    }

    #[test]
    fn test_origin_transfer_completes() {
        let (addr, head) = spawn_head(Status::Ok);
        let config = test_config();
        let chain = ReplicaChain::new(vec![addr]);
        let mut tx = BlockTransmitter::origin(BlockId::new(), chain, &config).unwrap();

        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<&[u8]> = data.chunks(64).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            tx.enqueue(chunk, i + 1 == chunks.len()).unwrap();
        }
        tx.await_completion().unwrap();

        assert_eq!(tx.state(), TransferState::Closed);
        assert_eq!(tx.acked_packets(), chunks.len() as u64);
        assert_eq!(head.join().unwrap(), data);
    }

    #[test]
    fn test_enqueue_after_last_is_rejected() {
        let (addr, head) = spawn_head(Status::Ok);
        let mut tx =
            BlockTransmitter::origin(BlockId::new(), ReplicaChain::new(vec![addr]), &test_config())
                .unwrap();

        tx.enqueue(b"only", true).unwrap();
        let err = tx.enqueue(b"more", false).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        tx.await_completion().unwrap();
        head.join().unwrap();
    }

    #[test]
    fn test_await_without_last_packet_is_rejected() {
        let (addr, _head) = spawn_head(Status::Ok);
        let mut tx =
            BlockTransmitter::origin(BlockId::new(), ReplicaChain::new(vec![addr]), &test_config())
                .unwrap();
        tx.enqueue(b"partial", false).unwrap();

        let err = tx.await_completion().unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_error_final_status_surfaces_as_transfer_error() {
        let (addr, head) = spawn_head(Status::Error);
        let block_id = BlockId::new();
        let mut tx =
            BlockTransmitter::origin(block_id, ReplicaChain::new(vec![addr]), &test_config())
                .unwrap();

        tx.enqueue(b"data", true).unwrap();
        let err = tx.await_completion().unwrap_err();
        match err {
            Error::Transfer { block_id: id, source } => {
                assert_eq!(id, block_id);
                assert!(matches!(*source, Error::Protocol(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tx.state(), TransferState::Failed);
        assert!(tx.check_error().is_err());
        head.join().unwrap();
    }

    #[test]
    fn test_connect_failure_unblocks_producer() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let mut tx =
            BlockTransmitter::origin(BlockId::new(), ReplicaChain::new(vec![addr]), &test_config())
                .unwrap();

        let mut result = Ok(());
        for _ in 0..100 {
            result = tx.enqueue(&[0u8; 64], false);
            if result.is_err() {
                break;
            }
        }
        match result.unwrap_err() {
            Error::Transfer { source, .. } => {
                assert!(matches!(*source, Error::Transport(_) | Error::Timeout));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(tx.check_error().is_err());
        assert_eq!(tx.state(), TransferState::Failed);
    }

    #[test]
    fn test_forwarding_mode_streams_status_and_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = test_config();

        let client = thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            Status::read_from(&mut conn).unwrap().expect_ok("preamble").unwrap();
            assert_eq!(protocol::read_offset(&mut conn).unwrap(), 128);

            let mut received = Vec::new();
            let mut packet = Packet::new(64);
            loop {
                Status::read_from(&mut conn).unwrap().expect_ok("packet").unwrap();
                packet.decode(&mut conn).unwrap();
                received.extend_from_slice(packet.payload());
                if packet.is_last() {
                    break;
                }
            }
            received
        });

        let (accepted, _) = listener.accept().unwrap();
        let mut tx = BlockTransmitter::forwarding(BlockId::new(), accepted, 128, &config).unwrap();
        tx.enqueue(&[1u8; 64], false).unwrap();
        tx.enqueue(&[2u8; 10], true).unwrap();
        tx.await_completion().unwrap();

        let received = client.join().unwrap();
        assert_eq!(received.len(), 74);
        assert!(received[..64].iter().all(|b| *b == 1));
        assert!(received[64..].iter().all(|b| *b == 2));
        assert_eq!(tx.acked_packets(), 0);
    }
}
