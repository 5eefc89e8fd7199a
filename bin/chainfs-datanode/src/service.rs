//! Data node service
//!
//! Accepts block transfer connections and serves one request per
//! connection on its own thread:
//!
//! - `ReadBlock`: stream stored bytes from the requested offset through a
//!   forwarding-mode transmitter.
//! - `WriteBlock`: receive packets, verify them, relay them to the next
//!   node of the chain through an origin-mode transmitter and ack each one
//!   upstream. The final status is sent once the block is stored locally
//!   and every downstream node confirmed it.

use crate::store::BlockStore;
use chainfs_client::BlockTransmitter;
use chainfs_client::packet::Packet;
use chainfs_client::protocol::{self, READ_TO_END, RequestHeader, Status};
use chainfs_common::{BlockId, Error, ReplicaChain, Result, TransferConfig};
use parking_lot::Mutex;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Node-wide counters
#[derive(Debug, Default)]
pub struct NodeStats {
    pub blocks_received: AtomicU64,
    pub blocks_served: AtomicU64,
    pub failed_requests: AtomicU64,
}

struct NodeShared {
    addr: SocketAddr,
    config: TransferConfig,
    store: Arc<dyn BlockStore>,
    shutdown: AtomicBool,
    /// Packets served per read before the connection is dropped
    fail_reads_after: Mutex<Option<usize>>,
    stats: NodeStats,
}

/// A running storage node
pub struct DataNode {
    shared: Arc<NodeShared>,
    acceptor: Option<JoinHandle<()>>,
}

impl DataNode {
    /// Bind `addr` and start accepting connections
    pub fn bind(
        addr: SocketAddr,
        config: &TransferConfig,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).map_err(Error::from_io)?;
        let addr = listener.local_addr().map_err(Error::from_io)?;

        let shared = Arc::new(NodeShared {
            addr,
            config: config.clone(),
            store,
            shutdown: AtomicBool::new(false),
            fail_reads_after: Mutex::new(None),
            stats: NodeStats::default(),
        });

        let accept_shared = Arc::clone(&shared);
        let acceptor = thread::Builder::new()
            .name(format!("datanode-{addr}"))
            .spawn(move || accept_loop(&listener, &accept_shared))
            .map_err(Error::Transport)?;

        info!(%addr, "data node listening");
        Ok(Self {
            shared,
            acceptor: Some(acceptor),
        })
    }

    /// Address the node is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Block storage behind this node
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.shared.store
    }

    #[must_use]
    pub fn stats(&self) -> &NodeStats {
        &self.shared.stats
    }

    /// Drop every read connection after `packets` packets (`None` disables)
    pub fn fail_reads_after(&self, packets: Option<usize>) {
        *self.shared.fail_reads_after.lock() = packets;
    }

    /// Stop accepting connections
    ///
    /// Connections already being served run to completion.
    pub fn shutdown(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);

        // Wake the blocking accept
        let mut wake = self.shared.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
        let _ = TcpStream::connect_timeout(&wake, self.shared.config.connect_timeout());
        if acceptor.join().is_err() {
            error!(addr = %self.shared.addr, "accept thread panicked");
        }
        info!(addr = %self.shared.addr, "data node stopped");
    }
}

impl Drop for DataNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DataNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataNode")
            .field("addr", &self.shared.addr)
            .field("stats", &self.shared.stats)
            .finish_non_exhaustive()
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<NodeShared>) {
    for conn in listener.incoming() {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let peer = stream.peer_addr().ok();
        let conn_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("datanode-conn".into())
            .spawn(move || {
                if let Err(e) = handle_connection(stream, &conn_shared) {
                    conn_shared
                        .stats
                        .failed_requests
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(?peer, error = %e, "request failed");
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn connection thread");
        }
    }
}

fn handle_connection(stream: TcpStream, shared: &NodeShared) -> Result<()> {
    protocol::configure_stream(&stream, &shared.config)?;
    let header = RequestHeader::read_from(&mut &stream)?;
    match header {
        RequestHeader::ReadBlock {
            block_id,
            offset,
            length,
        } => serve_read(stream, shared, block_id, offset, length),
        RequestHeader::WriteBlock { block_id, targets } => {
            receive_write(&stream, shared, block_id, targets)
        }
    }
}

fn serve_read(
    stream: TcpStream,
    shared: &NodeShared,
    block_id: BlockId,
    offset: u64,
    length: i64,
) -> Result<()> {
    let data = match shared.store.get(block_id) {
        Ok(data) => data,
        Err(e) => {
            Status::Error.write_to(&mut &stream)?;
            return Err(e);
        }
    };

    let size = data.len() as u64;
    if offset > size {
        Status::Error.write_to(&mut &stream)?;
        return Err(Error::protocol(format!(
            "read offset {offset} beyond block {block_id} of {size} bytes"
        )));
    }
    let end = if length == READ_TO_END {
        size
    } else {
        offset.saturating_add(length.unsigned_abs()).min(size)
    };
    // Both bounds are within the in-memory block
    let range = &data[offset as usize..end as usize];
    debug!(%block_id, offset, len = range.len(), "serving block");

    let fail_after = *shared.fail_reads_after.lock();
    let mut tx = BlockTransmitter::forwarding(block_id, stream, offset, &shared.config)?;
    if range.is_empty() {
        tx.enqueue(&[], true)?;
    }
    let packets = range.chunks(shared.config.max_packet_size).count();
    for (i, chunk) in range.chunks(shared.config.max_packet_size).enumerate() {
        if fail_after == Some(i) {
            warn!(%block_id, packets = i, "dropping read connection");
            return Ok(());
        }
        tx.enqueue(chunk, i + 1 == packets)?;
    }
    tx.await_completion()?;

    shared.stats.blocks_served.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn receive_write(
    stream: &TcpStream,
    shared: &NodeShared,
    block_id: BlockId,
    targets: Vec<SocketAddr>,
) -> Result<()> {
    let chain = ReplicaChain::new(targets);
    let mut downstream = if chain.is_empty() {
        None
    } else {
        match BlockTransmitter::origin(block_id, chain.clone(), &shared.config) {
            Ok(tx) => Some(tx),
            Err(e) => {
                Status::Error.write_to(&mut &*stream)?;
                return Err(e);
            }
        }
    };
    Status::Ok.write_to(&mut &*stream)?;
    debug!(%block_id, downstream = %chain, "receiving block");

    let mut reader = BufReader::with_capacity(shared.config.max_packet_size + 64, stream);
    let mut packet = Packet::new(shared.config.max_packet_size);
    let mut data = Vec::new();
    loop {
        let received = receive_packet(&mut reader, &mut packet, &mut data, &mut downstream, shared);
        if let Err(e) = received {
            let _ = Status::Error.write_to(&mut &*stream);
            return Err(e);
        }
        Status::Ok.write_to(&mut &*stream)?;
        if packet.is_last() {
            break;
        }
    }

    let len = data.len();
    let stored = downstream
        .as_mut()
        .map_or(Ok(()), BlockTransmitter::await_completion)
        .and_then(|()| shared.store.put(block_id, data));
    match stored {
        Ok(()) => {
            shared.stats.blocks_received.fetch_add(1, Ordering::Relaxed);
            Status::Ok.write_to(&mut &*stream)?;
            info!(%block_id, len, "block stored");
            Ok(())
        }
        Err(e) => {
            Status::Error.write_to(&mut &*stream)?;
            Err(e)
        }
    }
}

/// Decode one packet, append it to the block and relay it downstream
fn receive_packet(
    reader: &mut BufReader<&TcpStream>,
    packet: &mut Packet,
    data: &mut Vec<u8>,
    downstream: &mut Option<BlockTransmitter>,
    shared: &NodeShared,
) -> Result<()> {
    packet.decode(reader)?;
    if (data.len() + packet.len()) as u64 > shared.config.block_size {
        return Err(Error::protocol(format!(
            "block exceeds {} bytes",
            shared.config.block_size
        )));
    }
    data.extend_from_slice(packet.payload());

    if let Some(tx) = downstream.as_mut() {
        tx.check_error()?;
        tx.enqueue(packet.payload(), packet.is_last())?;
    }
    Ok(())
}
