//! Channel frame encoding.
//!
//! Every frame is `[tag u8][len u32 BE][payload]`. All multi-byte fields are
//! big-endian (network byte order).

use crate::error::ChannelError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest accepted payload (1 MiB)
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    /// Dialer greeting carrying the negotiation session id
    Hello = 0x01,
    /// Listener accepted the greeting
    HelloAck = 0x02,
    /// UTF-8 text message
    Text = 0x03,
    /// Binary message
    Binary = 0x04,
    /// Orderly close
    Close = 0x05,
}

impl TryFrom<u8> for FrameTag {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x03 => Ok(Self::Text),
            0x04 => Ok(Self::Binary),
            0x05 => Ok(Self::Close),
            _ => Err(ChannelError::InvalidFrame(value)),
        }
    }
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub tag: FrameTag,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    #[must_use]
    pub fn new(tag: FrameTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Frame without payload
    #[must_use]
    pub fn empty(tag: FrameTag) -> Self {
        Self::new(tag, Bytes::new())
    }

    /// Encode header and payload into one buffer
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.tag as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Write a frame
///
/// # Errors
///
/// Returns error if the payload is too large or the write fails.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ChannelError> {
    if frame.payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ChannelError::FrameTooLarge(frame.payload.len()));
    }
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// Returns error on unknown tags, oversized payloads, or truncated frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, ChannelError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];

    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..]).await?;

    let tag = FrameTag::try_from(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(ChannelError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame::new(tag, payload)))
}
