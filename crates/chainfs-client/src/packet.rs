//! Checksummed packets
//!
//! A packet is the unit of streamed block data. Its buffer is allocated
//! once at the configured maximum size and refilled in place for every
//! packet that passes through a queue slot.
//!
//! Framed wire format:
//! ```text
//! +----------+--------+------+---------+
//! | CRC32C   | Length | Last | Payload |
//! | 4B       | 4B     | 1B   | var     |
//! +----------+--------+------+---------+
//! ```
//!
//! The raw form drops `Length` and `Last`; the receiver infers the length
//! from the number of block bytes it still expects.

use chainfs_common::{Error, PacketChecksum, Result};
use std::io::{Read, Write};

/// Framed packet header size (checksum + length + last flag)
pub const FRAMED_HEADER_SIZE: usize = 9;

/// Raw packet header size (checksum only)
pub const RAW_HEADER_SIZE: usize = 4;

/// A bounded, checksummed unit of block data
#[derive(Clone)]
pub struct Packet {
    /// Fixed buffer of `max_packet_size` bytes
    data: Box<[u8]>,
    /// Number of valid payload bytes
    len: usize,
    /// Marks the final packet of a block transfer
    last: bool,
    /// Checksum over `data[..len]`
    checksum: PacketChecksum,
}

impl Packet {
    /// Allocate an empty packet able to hold `max_size` payload bytes
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            data: vec![0u8; max_size].into_boxed_slice(),
            len: 0,
            last: false,
            checksum: PacketChecksum::compute(&[]),
        }
    }

    /// Maximum payload size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Payload length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if the payload is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if this is the last packet of its block transfer
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.last
    }

    /// Checksum of the current payload
    #[must_use]
    pub const fn checksum(&self) -> PacketChecksum {
        self.checksum
    }

    /// Copy `payload` into the packet and recompute the checksum
    pub fn fill(&mut self, payload: &[u8], is_last: bool) -> Result<()> {
        if payload.len() > self.capacity() {
            return Err(Error::invalid_operation(format!(
                "payload of {} bytes exceeds packet size {}",
                payload.len(),
                self.capacity()
            )));
        }

        self.data[..payload.len()].copy_from_slice(payload);
        self.len = payload.len();
        self.last = is_last;
        self.checksum = PacketChecksum::compute(self.payload());
        Ok(())
    }

    /// Write the packet to `sink`
    ///
    /// The raw form (`framed == false`) writes only the checksum and payload.
    pub fn encode<W: Write>(&self, sink: &mut W, framed: bool) -> Result<()> {
        let mut header = [0u8; FRAMED_HEADER_SIZE];
        header[0..4].copy_from_slice(&self.checksum.value().to_le_bytes());
        let header_len = if framed {
            header[4..8].copy_from_slice(&(self.len as u32).to_le_bytes());
            header[8] = u8::from(self.last);
            FRAMED_HEADER_SIZE
        } else {
            RAW_HEADER_SIZE
        };

        sink.write_all(&header[..header_len]).map_err(Error::from_io)?;
        sink.write_all(self.payload()).map_err(Error::from_io)?;
        Ok(())
    }

    /// Read a framed packet from `source` and verify its checksum
    pub fn decode<R: Read>(&mut self, source: &mut R) -> Result<()> {
        let mut header = [0u8; FRAMED_HEADER_SIZE];
        source.read_exact(&mut header).map_err(Error::from_io)?;

        let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let last = match header[8] {
            0 => false,
            1 => true,
            other => {
                self.invalidate();
                return Err(Error::protocol(format!("invalid last-packet flag {other}")));
            }
        };

        if len > self.capacity() {
            self.invalidate();
            return Err(Error::protocol(format!(
                "packet length {} exceeds maximum {}",
                len,
                self.capacity()
            )));
        }

        self.read_payload(source, expected, len, last)
    }

    /// Read a raw packet (checksum + payload) from `source`
    ///
    /// `remaining` is the number of block bytes the receiver still expects.
    /// The payload length is `remaining` capped at the packet capacity, and
    /// the packet is last when it exhausts `remaining`.
    pub fn decode_raw<R: Read>(&mut self, source: &mut R, remaining: u64) -> Result<()> {
        let mut header = [0u8; RAW_HEADER_SIZE];
        source.read_exact(&mut header).map_err(Error::from_io)?;
        let expected = u32::from_le_bytes(header);

        let len = usize::try_from(remaining).map_or(self.capacity(), |r| r.min(self.capacity()));
        let last = len as u64 == remaining;
        self.read_payload(source, expected, len, last)
    }

    fn read_payload<R: Read>(
        &mut self,
        source: &mut R,
        expected: u32,
        len: usize,
        last: bool,
    ) -> Result<()> {
        if let Err(e) = source.read_exact(&mut self.data[..len]) {
            self.invalidate();
            return Err(Error::from_io(e));
        }

        let actual = PacketChecksum::compute(&self.data[..len]);
        if actual.value() != expected {
            self.invalidate();
            return Err(Error::ChecksumMismatch {
                expected,
                actual: actual.value(),
            });
        }

        self.len = len;
        self.last = last;
        self.checksum = actual;
        Ok(())
    }

    fn invalidate(&mut self) {
        self.len = 0;
        self.last = false;
        self.checksum = PacketChecksum::compute(&[]);
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("last", &self.last)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}
