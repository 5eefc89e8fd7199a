//! Block transfer wire protocol
//!
//! Every connection starts with a request header written by the client.
//! All integers are little-endian and fixed width.
//!
//! Request header:
//! ```text
//! +--------+---------+---------+----------+---------------------+
//! | Magic  | Version | Command | Block ID | Command body        |
//! | 4B     | 2B      | 1B      | 16B      | var                 |
//! +--------+---------+---------+----------+---------------------+
//!
//! ReadBlock body:  offset:u64, length:i64 (-1 = until last packet)
//! WriteBlock body: count:u8, count x address
//! Address:         family:u8 (4|6), ip:4B|16B, port:u16
//! ```
//!
//! Responses are one-byte status codes, optionally followed by a `u64`
//! offset (read preamble) or a packet.

use chainfs_common::{BlockId, Error, Result, TransferConfig};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};

/// Request header magic ("CFBP")
pub const MAGIC: u32 = 0x4346_4250;

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Read length meaning "until the last packet"
pub const READ_TO_END: i64 = -1;

/// Upper bound on forwarded replica addresses per header
pub const MAX_TARGETS: usize = 32;

/// Fixed prefix size (magic + version + command + block id)
const HEADER_PREFIX_SIZE: usize = 23;

/// Request command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Stream a block from a node
    ReadBlock = 1,
    /// Stream a block into a replica chain
    WriteBlock = 2,
}

impl Command {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ReadBlock),
            2 => Some(Self::WriteBlock),
            _ => None,
        }
    }
}

/// Coarse result code sent by the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Request accepted or packet stored
    Ok = 0,
    /// Request or packet failed
    Error = 1,
}

impl Status {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            _ => None,
        }
    }

    /// Write this status to `sink`
    pub fn write_to<W: Write>(self, sink: &mut W) -> Result<()> {
        sink.write_all(&[self as u8]).map_err(Error::from_io)
    }

    /// Read one status from `source`
    pub fn read_from<R: Read>(source: &mut R) -> Result<Self> {
        let mut byte = [0u8; 1];
        source.read_exact(&mut byte).map_err(Error::from_io)?;
        Self::from_u8(byte[0]).ok_or_else(|| Error::protocol(format!("unknown status {}", byte[0])))
    }

    /// Decode a status byte obtained without blocking
    pub fn from_byte(byte: u8) -> Result<Self> {
        Self::from_u8(byte).ok_or_else(|| Error::protocol(format!("unknown status {byte}")))
    }

    /// Fail with a protocol error unless this is `Ok`
    pub fn expect_ok(self, context: &str) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Error => Err(Error::protocol(format!("{context}: peer returned error status"))),
        }
    }
}

/// Connection request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestHeader {
    /// Read `length` bytes of `block_id` starting at `offset`
    ReadBlock {
        block_id: BlockId,
        offset: u64,
        length: i64,
    },
    /// Write `block_id`; the receiver forwards to `targets` in order
    WriteBlock {
        block_id: BlockId,
        targets: Vec<SocketAddr>,
    },
}

impl RequestHeader {
    /// Block addressed by the request
    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        match self {
            Self::ReadBlock { block_id, .. } | Self::WriteBlock { block_id, .. } => *block_id,
        }
    }

    /// Command of the request
    #[must_use]
    pub const fn command(&self) -> Command {
        match self {
            Self::ReadBlock { .. } => Command::ReadBlock,
            Self::WriteBlock { .. } => Command::WriteBlock,
        }
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_PREFIX_SIZE + 32);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.push(self.command() as u8);
        buf.extend_from_slice(self.block_id().as_bytes());

        match self {
            Self::ReadBlock { offset, length, .. } => {
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&length.to_le_bytes());
            }
            Self::WriteBlock { targets, .. } => {
                if targets.len() > MAX_TARGETS {
                    return Err(Error::invalid_operation(format!(
                        "{} forwarding targets exceeds maximum {}",
                        targets.len(),
                        MAX_TARGETS
                    )));
                }
                buf.push(targets.len() as u8);
                for target in targets {
                    encode_addr(&mut buf, target);
                }
            }
        }
        Ok(buf)
    }

    /// Write the header to `sink`
    pub fn write_to<W: Write>(&self, sink: &mut W) -> Result<()> {
        let bytes = self.to_bytes()?;
        sink.write_all(&bytes).map_err(Error::from_io)
    }

    /// Read and validate a header from `source`
    pub fn read_from<R: Read>(source: &mut R) -> Result<Self> {
        let mut prefix = [0u8; HEADER_PREFIX_SIZE];
        source.read_exact(&mut prefix).map_err(Error::from_io)?;

        let magic = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        if magic != MAGIC {
            return Err(Error::protocol(format!("invalid magic 0x{magic:08x}")));
        }
        let version = u16::from_le_bytes([prefix[4], prefix[5]]);
        if version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!("unsupported protocol version {version}")));
        }
        let command = Command::from_u8(prefix[6])
            .ok_or_else(|| Error::protocol(format!("unknown command {}", prefix[6])))?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&prefix[7..23]);
        let block_id = BlockId::from_bytes(id);

        match command {
            Command::ReadBlock => {
                let offset = u64::from_le_bytes(read_array(source)?);
                let length = i64::from_le_bytes(read_array(source)?);
                if length < READ_TO_END {
                    return Err(Error::protocol(format!("invalid read length {length}")));
                }
                Ok(Self::ReadBlock {
                    block_id,
                    offset,
                    length,
                })
            }
            Command::WriteBlock => {
                let [count] = read_array::<_, 1>(source)?;
                let count = usize::from(count);
                if count > MAX_TARGETS {
                    return Err(Error::protocol(format!("too many forwarding targets: {count}")));
                }
                let targets = (0..count)
                    .map(|_| decode_addr(source))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::WriteBlock { block_id, targets })
            }
        }
    }
}

/// Write a byte offset
pub fn write_offset<W: Write>(sink: &mut W, offset: u64) -> Result<()> {
    sink.write_all(&offset.to_le_bytes()).map_err(Error::from_io)
}

/// Read a byte offset
pub fn read_offset<R: Read>(source: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(source)?))
}

/// Open a connection to a storage node with the configured timeouts
pub fn connect(addr: SocketAddr, config: &TransferConfig) -> Result<TcpStream> {
    let stream =
        TcpStream::connect_timeout(&addr, config.connect_timeout()).map_err(Error::from_io)?;
    configure_stream(&stream, config)?;
    Ok(stream)
}

/// Apply read/write timeouts and disable Nagle on an open connection
pub fn configure_stream(stream: &TcpStream, config: &TransferConfig) -> Result<()> {
    stream
        .set_read_timeout(Some(config.io_timeout()))
        .map_err(Error::from_io)?;
    stream
        .set_write_timeout(Some(config.io_timeout()))
        .map_err(Error::from_io)?;
    stream.set_nodelay(true).map_err(Error::from_io)?;
    Ok(())
}

fn read_array<R: Read, const N: usize>(source: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    source.read_exact(&mut buf).map_err(Error::from_io)?;
    Ok(buf)
}

fn encode_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_le_bytes());
}

fn decode_addr<R: Read>(source: &mut R) -> Result<SocketAddr> {
    let [family] = read_array::<_, 1>(source)?;
    let ip = match family {
        4 => IpAddr::V4(Ipv4Addr::from(read_array::<_, 4>(source)?)),
        6 => IpAddr::V6(Ipv6Addr::from(read_array::<_, 16>(source)?)),
        other => return Err(Error::protocol(format!("unknown address family {other}"))),
    };
    let port = u16::from_le_bytes(read_array(source)?);
    Ok(SocketAddr::new(ip, port))
}
