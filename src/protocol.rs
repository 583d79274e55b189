//! Wire format shared by the keeper and the relay.
//!
//! Every carrier leg starts with a 24-byte session header: a 16-byte UUID
//! followed by a signed 64-bit big-endian offset. Non-negative offsets
//! announce how many payload bytes the sender has delivered to its local
//! endpoint; negative values are handshake sentinels. After the headers the
//! keeper→relay direction carries length-prefixed data frames while the
//! relay→keeper direction streams raw bytes.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Size of the session header on the wire.
pub const HEADER_LEN: usize = 24;
/// Longest line [`read_line`] will accept, in content bytes.
pub const MAX_LINE: usize = 1024;
/// Largest payload a single data frame can carry.
pub const MAX_FRAME: usize = u16::MAX as usize;

const WIRE_NEW_REQUEST: i64 = -1;
const WIRE_NEW_ACCEPTED: i64 = -2;
const WIRE_CLIENT_EOF: i64 = -3;
const WIRE_TARGET_EOF: i64 = -4;

/// The header's offset field, decoded from its overloaded wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// Keeper asks for a brand-new session (`-1`); a `host:port` line follows.
    NewRequest,
    /// Relay accepted a brand-new session (`-2`).
    NewAccepted,
    /// Keeper reports the client connection is gone (`-3`).
    ClientEof,
    /// Relay reports the target connection is gone (`-4`).
    TargetEof,
    /// Cumulative payload bytes the sender has delivered to its local endpoint.
    Delivered(u64),
}

impl Offset {
    pub fn to_wire(self) -> i64 {
        match self {
            Offset::NewRequest => WIRE_NEW_REQUEST,
            Offset::NewAccepted => WIRE_NEW_ACCEPTED,
            Offset::ClientEof => WIRE_CLIENT_EOF,
            Offset::TargetEof => WIRE_TARGET_EOF,
            Offset::Delivered(n) => n as i64,
        }
    }

    pub fn from_wire(raw: i64) -> io::Result<Self> {
        match raw {
            WIRE_NEW_REQUEST => Ok(Offset::NewRequest),
            WIRE_NEW_ACCEPTED => Ok(Offset::NewAccepted),
            WIRE_CLIENT_EOF => Ok(Offset::ClientEof),
            WIRE_TARGET_EOF => Ok(Offset::TargetEof),
            n if n >= 0 => Ok(Offset::Delivered(n as u64)),
            n => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown offset sentinel {n}"),
            )),
        }
    }
}

/// The fixed-size header exchanged at the start of every carrier leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub uuid: Uuid,
    pub offset: Offset,
}

impl SessionHeader {
    pub async fn read_from<R>(r: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut id = [0u8; 16];
        r.read_exact(&mut id).await?;
        let offset = Offset::from_wire(r.read_i64().await?)?;
        Ok(Self {
            uuid: Uuid::from_bytes(id),
            offset,
        })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut raw = [0u8; HEADER_LEN];
        raw[..16].copy_from_slice(self.uuid.as_bytes());
        raw[16..].copy_from_slice(&self.offset.to_wire().to_be_bytes());
        w.write_all(&raw).await
    }
}

/// Pops one complete data frame out of `buf`, returning its payload.
///
/// Returns `None` while the length prefix or the payload is still partial;
/// the caller keeps accumulating carrier reads into `buf` and retries. A
/// zero-length payload is a valid keepalive frame.
pub fn take_frame(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    buf.advance(2);
    Some(buf.split_to(len).freeze())
}

/// Reads a single line, one byte at a time, up to the `end` terminator.
///
/// Accepts at most [`MAX_LINE`] content bytes and strips one trailing `\r`.
/// Used only for the short preamble exchanges, so the byte-at-a-time reads
/// never over-consume stream data that belongs to the tunnel.
pub async fn read_line<R>(r: &mut R, end: u8) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line: Vec<u8> = Vec::with_capacity(64);
    loop {
        let b = r.read_u8().await?;
        if b == end {
            break;
        }
        if line.len() == MAX_LINE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        line.push(b);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
