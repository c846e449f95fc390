//! Sender side of the chunk protocol.

use super::protocol::{ControlMessage, FileMeta};
use super::session::TransferSession;
use crate::connection::Channel;
use crate::error::TransferError;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Outcome of a completed send
#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    /// File name
    pub file_name: String,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Binary chunks sent
    pub chunks_sent: u64,
    /// Seconds from `meta` to `end`
    pub elapsed: f64,
    /// Average throughput (bytes/sec)
    pub speed: f64,
}

/// Stream `reader` over `channel` as one file
///
/// Sends `meta`, then full chunks of `chunk_size` bytes (the last possibly
/// short), then `end`. `on_chunk` sees the session after every chunk.
///
/// If `reader` yields fewer or more bytes than `meta.size`, the receiver is
/// told to discard the file and the send fails with `TransferAborted`.
///
/// # Errors
///
/// Returns error if the channel is not open, closes mid-transfer, or the
/// source does not match the declared size.
pub async fn send_stream<R, F>(
    channel: &Channel,
    meta: FileMeta,
    mut reader: R,
    chunk_size: usize,
    mut on_chunk: F,
) -> Result<SendReport, TransferError>
where
    R: AsyncRead + Unpin,
    F: FnMut(&TransferSession),
{
    let chunk_size = chunk_size.max(1);
    channel
        .send_text(&ControlMessage::Meta(meta.clone()).to_json())
        .await?;

    let mut session = TransferSession::new_send(meta, chunk_size);

    while !session.all_bytes_transferred() {
        let remaining = session.total_size() - session.bytes_transferred();
        let want = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));

        let chunk = match fill_chunk(&mut reader, want).await {
            Ok(chunk) => chunk,
            Err(e) => return Err(cancel(channel, e).await),
        };
        if chunk.len() < want {
            let err = TransferError::aborted("source shorter than declared size");
            return Err(cancel(channel, err).await);
        }

        let last = session.bytes_transferred() + chunk.len() as u64 == session.total_size();
        if last && has_more(&mut reader).await? {
            let err = TransferError::aborted("source larger than declared size");
            return Err(cancel(channel, err).await);
        }

        let len = chunk.len();
        channel.send_binary(chunk.freeze()).await?;
        session.record_sent(len)?;
        on_chunk(&session);
    }

    // Zero-byte source: still make sure nothing follows
    if session.total_size() == 0 && has_more(&mut reader).await? {
        let err = TransferError::aborted("source larger than declared size");
        return Err(cancel(channel, err).await);
    }

    channel.send_text(&ControlMessage::End.to_json()).await?;
    session.complete();

    Ok(SendReport {
        file_name: session.meta.name.clone(),
        bytes_sent: session.bytes_transferred(),
        chunks_sent: session.chunks_transferred(),
        elapsed: session.elapsed(),
        speed: session.speed(),
    })
}

/// Read until `want` bytes or end of input
async fn fill_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    want: usize,
) -> Result<BytesMut, TransferError> {
    let mut buf = BytesMut::zeroed(want);
    let mut filled = 0;

    while filled < want {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    buf.truncate(filled);
    Ok(buf)
}

async fn has_more<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, TransferError> {
    let mut next = [0u8; 1];
    Ok(reader.read(&mut next).await? > 0)
}

async fn cancel(channel: &Channel, err: TransferError) -> TransferError {
    tracing::warn!("Cancelling send: {}", err);
    let _ = channel.send_text(&ControlMessage::Cancel.to_json()).await;
    err
}
