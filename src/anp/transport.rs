//! ANPT transport framing.
//!
//! Every exchange is one frame: a fixed 24-byte big-endian header followed by
//! `payload_size` bytes of ANP-encoded payload.
//!
//! ```text
//! major:u32 | minor:u32 | kind:u32 | id:u64 | payload_size:u32 | payload
//! ```

use crate::anp::kanp::{KANP_MAJOR, KANP_MINOR};
use crate::error::{KanpError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const HEADER_SIZE: usize = 24;

/// Largest payload either side will put in, or accept from, a frame (100 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub major: u32,
    pub minor: u32,
    pub kind: u32,
    pub id: u64,
    pub size: u32,
}

impl TransportHeader {
    /// Header for the current protocol version.
    pub fn new(kind: u32, id: u64, size: u32) -> Self {
        Self::with_version(KANP_MAJOR, KANP_MINOR, kind, id, size)
    }

    pub fn with_version(major: u32, minor: u32, kind: u32, id: u64, size: u32) -> Self {
        Self {
            major,
            minor,
            kind,
            id,
            size,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(self.major);
        buf.put_u32(self.minor);
        buf.put_u32(self.kind);
        buf.put_u64(self.id);
        buf.put_u32(self.size);
        out
    }

    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let mut buf = &raw[..];
        Self {
            major: buf.get_u32(),
            minor: buf.get_u32(),
            kind: buf.get_u32(),
            id: buf.get_u64(),
            size: buf.get_u32(),
        }
    }
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(KanpError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// Write a frame with the current protocol version.
///
/// Oversize payloads are rejected before anything touches the channel.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: u32,
    id: u64,
    payload: &[u8],
) -> Result<()> {
    check_size(payload.len())?;
    let header = TransportHeader::new(kind, id, payload.len() as u32);
    write_frame_with(w, header, payload).await
}

/// Write a frame with a caller-built header. `header.size` is overwritten
/// with the real payload length.
pub async fn write_frame_with<W: AsyncWrite + Unpin>(
    w: &mut W,
    mut header: TransportHeader,
    payload: &[u8],
) -> Result<()> {
    check_size(payload.len())?;
    header.size = payload.len() as u32;

    // One buffer so small frames go out in a single write.
    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_slice(&header.encode());
    frame.put_slice(payload);
    w.write_all(&frame).await?;
    w.flush().await?;

    trace!(
        kind = header.kind,
        id = header.id,
        size = header.size,
        "frame sent"
    );
    Ok(())
}

/// Read one full frame, looping over short reads.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(TransportHeader, Bytes)> {
    let mut raw = [0u8; HEADER_SIZE];
    read_exact_or_closed(r, &mut raw).await?;
    let header = TransportHeader::decode(&raw);

    // Validate before allocation
    check_size(header.size as usize)?;

    let mut payload = vec![0u8; header.size as usize];
    read_exact_or_closed(r, &mut payload).await?;

    trace!(
        kind = header.kind,
        id = header.id,
        size = header.size,
        "frame received"
    );
    Ok((header, Bytes::from(payload)))
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    match r.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(KanpError::ConnectionClosed),
        Err(e) => Err(KanpError::Io(e)),
    }
}
