//! Random-access block read stream
//!
//! A background worker walks the file's blocks from the current position,
//! pulling packets from one replica at a time into a [`PacketQueue`]. The
//! caller drains the queue through [`BlockReadStream::read`]. A replica that
//! fails in any way (connect, handshake, mid-block transport error or a bad
//! checksum) is dropped from the block's candidate list and the fetch
//! resumes at the first undelivered byte on another replica.
//!
//! The worker starts on the first read, so an open followed by a seek
//! costs no network traffic.

use crate::meta::MetadataService;
use crate::protocol::{self, READ_TO_END, RequestHeader, Status};
use crate::queue::PacketQueue;
use crate::replica::choose_replica;
use chainfs_common::{BlockId, Error, FileInfo, Result, TransferConfig};
use parking_lot::Mutex;
use std::io::{BufReader, SeekFrom};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// State shared between the reader and its worker
#[derive(Debug, Default)]
struct ReadShared {
    error: Mutex<Option<Arc<Error>>>,
    retries: AtomicU64,
    socket: Mutex<Option<TcpStream>>,
}

/// Application-facing reader for one file
pub struct BlockReadStream {
    meta: Arc<dyn MetadataService>,
    config: TransferConfig,
    info: Arc<FileInfo>,
    position: u64,
    queue: Arc<PacketQueue>,
    shared: Arc<ReadShared>,
    worker: Option<JoinHandle<()>>,
    /// Bytes of the head packet already returned to the caller
    head_offset: usize,
}

impl BlockReadStream {
    /// Open `path` for reading
    ///
    /// The file layout is fetched once; blocks committed later are not seen.
    pub fn open(
        path: &str,
        meta: Arc<dyn MetadataService>,
        config: &TransferConfig,
    ) -> Result<Self> {
        config.validate()?;
        let info = meta.get_file_info(path)?;
        let queue = PacketQueue::new(config.queue_capacity, config.max_packet_size)?;
        info!(
            path,
            size = info.size,
            blocks = info.block_ids.len(),
            "opened file for read"
        );

        Ok(Self {
            meta,
            config: config.clone(),
            info: Arc::new(info),
            position: 0,
            queue: Arc::new(queue),
            shared: Arc::default(),
            worker: None,
            head_offset: 0,
        })
    }

    /// File size at open time
    #[must_use]
    pub fn len(&self) -> u64 {
        self.info.size
    }

    /// Check if the file is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.info.size == 0
    }

    /// Current logical position
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Replica fetches abandoned for another candidate so far
    #[must_use]
    pub fn retry_count(&self) -> u64 {
        self.shared.retries.load(Ordering::Relaxed)
    }

    /// Read up to `buf.len()` bytes at the current position
    ///
    /// Returns 0 at end of file. Bytes already copied are returned before
    /// a worker failure is reported; the failure surfaces on the next call.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.position >= self.info.size {
            return Ok(0);
        }
        self.ensure_worker()?;

        let mut copied = 0;
        while copied < buf.len() && self.position < self.info.size {
            let Some(packet) = self.queue.acquire_read_slot() else {
                if copied > 0 {
                    break;
                }
                return Err(self.failure());
            };

            let available = &packet.payload()[self.head_offset..];
            let n = available.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;
            self.head_offset += n;
            self.position += n as u64;

            let exhausted = self.head_offset == packet.len();
            drop(packet);
            if exhausted {
                self.queue.commit_read();
                self.head_offset = 0;
            }
        }
        Ok(copied)
    }

    /// Move to an absolute position
    ///
    /// Positions past the end are allowed; reads there return 0.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        if position == self.position && self.shared.error.lock().is_none() {
            return Ok(());
        }

        self.stop_worker();
        self.queue.reset();
        self.shared.error.lock().take();
        self.head_offset = 0;
        self.position = position;
        debug!(path = %self.info.path, position, "seek");
        Ok(())
    }

    fn ensure_worker(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let worker = ReadWorker {
            meta: Arc::clone(&self.meta),
            config: self.config.clone(),
            info: Arc::clone(&self.info),
            start: self.position,
            queue: Arc::clone(&self.queue),
            shared: Arc::clone(&self.shared),
        };
        let handle = thread::Builder::new()
            .name(format!("read-{}", self.info.path))
            .spawn(move || worker.run())
            .map_err(Error::Transport)?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Cancel the queue, abort socket I/O and join the worker
    fn stop_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.queue.cancel();
            if let Some(socket) = self.shared.socket.lock().as_ref() {
                let _ = socket.shutdown(Shutdown::Both);
            }
            if handle.join().is_err() {
                error!(path = %self.info.path, "read worker panicked");
            }
        }
    }

    /// Rebuild the stored worker error for the caller
    fn failure(&self) -> Error {
        match self.shared.error.lock().as_ref() {
            Some(cause) => match cause.as_ref() {
                Error::ReplicasExhausted {
                    block_id,
                    attempts,
                    last,
                } => Error::ReplicasExhausted {
                    block_id: *block_id,
                    attempts: *attempts,
                    last: Arc::clone(last),
                },
                Error::Transfer { block_id, source } => {
                    Error::transfer(*block_id, Arc::clone(source))
                }
                other => Error::invalid_operation(format!("read failed: {other}")),
            },
            None => Error::invalid_operation("read cancelled"),
        }
    }
}

impl std::io::Read for BlockReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Self::read(self, buf).map_err(std::io::Error::other)
    }
}

impl std::io::Seek for BlockReadStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.info.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            ));
        };
        self.seek_to(target).map_err(std::io::Error::other)?;
        Ok(target)
    }
}

impl Drop for BlockReadStream {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl std::fmt::Debug for BlockReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReadStream")
            .field("path", &self.info.path)
            .field("size", &self.info.size)
            .field("position", &self.position)
            .field("retries", &self.retry_count())
            .finish_non_exhaustive()
    }
}

/// Outcome of a fetch that did not fail
enum Progress {
    Complete,
    Cancelled,
}

/// Background half of a read stream
struct ReadWorker {
    meta: Arc<dyn MetadataService>,
    config: TransferConfig,
    info: Arc<FileInfo>,
    start: u64,
    queue: Arc<PacketQueue>,
    shared: Arc<ReadShared>,
}

impl ReadWorker {
    fn run(self) {
        match self.fetch_blocks() {
            Ok(Progress::Complete) => {
                debug!(path = %self.info.path, start = self.start, "read worker finished");
            }
            Ok(Progress::Cancelled) => {
                debug!(path = %self.info.path, "read worker cancelled");
            }
            Err(e) => {
                error!(path = %self.info.path, error = %e, "read failed");
                *self.shared.error.lock() = Some(Arc::new(e));
                self.queue.cancel();
            }
        }
        self.shared.socket.lock().take();
    }

    fn fetch_blocks(&self) -> Result<Progress> {
        let first = self.info.block_index(self.start);
        for index in first..self.info.block_ids.len() {
            let block_len = self.info.block_len(index);
            let offset = if index == first {
                self.start - self.info.block_start(index)
            } else {
                0
            };
            if offset >= block_len {
                continue;
            }

            let block_id = self.info.block_ids[index];
            let progress = self
                .fetch_block(index, offset, block_len)
                .map_err(|e| match e {
                    exhausted @ Error::ReplicasExhausted { .. } => exhausted,
                    other => Error::transfer(block_id, Arc::new(other)),
                })?;
            if let Progress::Cancelled = progress {
                return Ok(Progress::Cancelled);
            }
        }
        Ok(Progress::Complete)
    }

    /// Fetch bytes `offset..block_len` of block `index`, failing over
    /// between replicas
    fn fetch_block(&self, index: usize, offset: u64, block_len: u64) -> Result<Progress> {
        let block_id = self.info.block_ids[index];
        let mut candidates = self.meta.get_replica_chain(block_id)?.nodes().to_vec();
        let mut rng = rand::thread_rng();
        let mut delivered = 0u64;
        let mut attempts = 0usize;
        let mut last_error = None;

        loop {
            let Some(choice) = choose_replica(&candidates, &self.config.local_addrs, &mut rng)
            else {
                return Err(match last_error {
                    Some(last) => Error::ReplicasExhausted {
                        block_id,
                        attempts,
                        last,
                    },
                    None => Error::metadata(format!("block {block_id} has no replicas")),
                });
            };
            let replica = candidates[choice];
            attempts += 1;
            debug!(%block_id, %replica, offset = offset + delivered, "fetching block");

            match self.stream_block(block_id, replica, offset, block_len, &mut delivered) {
                Ok(progress) => return Ok(progress),
                Err(_) if self.queue.is_cancelled() => return Ok(Progress::Cancelled),
                Err(e) if e.is_retryable() => {
                    warn!(
                        %block_id,
                        %replica,
                        delivered,
                        error = %e,
                        "replica failed, trying another"
                    );
                    candidates.remove(choice);
                    self.shared.retries.fetch_add(1, Ordering::Relaxed);
                    last_error = Some(Arc::new(e));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream one block from `replica`, resuming at `offset + delivered`
    fn stream_block(
        &self,
        block_id: BlockId,
        replica: SocketAddr,
        offset: u64,
        block_len: u64,
        delivered: &mut u64,
    ) -> Result<Progress> {
        let from = offset + *delivered;
        let stream = protocol::connect(replica, &self.config)?;
        self.remember_socket(&stream)?;

        let header = RequestHeader::ReadBlock {
            block_id,
            offset: from,
            length: READ_TO_END,
        };
        header.write_to(&mut &stream)?;

        let mut reader = BufReader::with_capacity(self.config.max_packet_size + 64, &stream);
        Status::read_from(&mut reader)?.expect_ok("read header")?;
        let echoed = protocol::read_offset(&mut reader)?;
        if echoed != from {
            return Err(Error::protocol(format!(
                "replica started at offset {echoed}, requested {from}"
            )));
        }

        loop {
            Status::read_from(&mut reader)?.expect_ok("read packet")?;
            let Some(mut slot) = self.queue.acquire_write_slot() else {
                return Ok(Progress::Cancelled);
            };
            slot.decode(&mut reader)?;

            let len = slot.len() as u64;
            let last = slot.is_last();
            if offset + *delivered + len > block_len {
                return Err(Error::protocol(format!(
                    "replica sent more than the {block_len} bytes of block {block_id}"
                )));
            }
            drop(slot);
            self.queue.commit_write();
            *delivered += len;

            if last {
                if offset + *delivered != block_len {
                    return Err(Error::protocol(format!(
                        "block {block_id} ended at {} of {block_len} bytes",
                        offset + *delivered
                    )));
                }
                return Ok(Progress::Complete);
            }
        }
    }

    fn remember_socket(&self, stream: &TcpStream) -> Result<()> {
        let clone = stream.try_clone().map_err(Error::from_io)?;
        *self.shared.socket.lock() = Some(clone);
        if self.queue.is_cancelled() {
            return Err(Error::invalid_operation("read cancelled"));
        }
        Ok(())
    }
}
