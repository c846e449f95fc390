//! Length-prefixed framing for stream transports.
//!
//! Every frame is `[len: u32 BE][payload]`. The relay carries bincode-encoded
//! messages in the payload; the peer channel adds its own tag byte inside.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame length prefix size in bytes
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Maximum accepted frame payload (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Write one frame and flush it.
///
/// # Errors
///
/// Returns `InvalidInput` if the payload exceeds [`MAX_FRAME_SIZE`], or any
/// I/O error from the underlying writer.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_SIZE}", payload.len()),
        ));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// Returns `InvalidData` for oversized frames and `UnexpectedEof` when the
/// stream ends inside a frame.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("incoming frame of {len} bytes exceeds {MAX_FRAME_SIZE}"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Serialize `msg` with bincode and write it as one frame.
///
/// # Errors
///
/// Returns `InvalidData` if serialization fails, otherwise as [`write_frame`].
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes =
        bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(writer, &bytes).await
}

/// Read one frame and deserialize it with bincode.
///
/// # Errors
///
/// Returns `InvalidData` if the frame does not decode, otherwise as
/// [`read_frame`].
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            write_frame(&mut a, b"hello").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut a, _b) = tokio::io::duplex(64);
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = write_frame(&mut a, &payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        });
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(&10u32.to_be_bytes()).await.unwrap();
            a.write_all(b"abc").await.unwrap();
        });
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let sent = (42u32, "device".to_string());
        write_message(&mut a, &sent).await.unwrap();
        let got: (u32, String) = read_message(&mut b).await.unwrap().unwrap();
        assert_eq!(got, sent);
    }
}
