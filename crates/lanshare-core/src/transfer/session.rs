//! Transfer session bookkeeping for one file in flight.

use super::protocol::FileMeta;
use crate::error::TransferError;
use crate::event::TransferDirection;
use bytes::{Bytes, BytesMut};
use std::time::Instant;

/// Transfer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Actively transferring
    Transferring,
    /// Every byte moved and `end` seen
    Complete,
    /// Transfer aborted
    Failed,
}

/// Transfer session
///
/// Tracks progress, speed and ETA of a single file. Receive sessions also
/// buffer the chunks in arrival order until `end`.
#[derive(Debug)]
pub struct TransferSession {
    /// Transfer direction
    pub direction: TransferDirection,
    /// Announced metadata
    pub meta: FileMeta,
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Total number of chunks
    pub total_chunks: u64,

    /// Current state
    state: TransferState,

    /// Bytes transferred
    bytes_transferred: u64,
    /// Chunks transferred
    chunks_transferred: u64,
    /// Received chunks, in order
    buffer: Vec<Bytes>,

    /// Start timestamp
    started_at: Instant,
    /// Completion timestamp
    completed_at: Option<Instant>,
}

impl TransferSession {
    /// Create a new send transfer session
    #[must_use]
    pub fn new_send(meta: FileMeta, chunk_size: usize) -> Self {
        Self::new(TransferDirection::Send, meta, chunk_size)
    }

    /// Create a new receive transfer session
    #[must_use]
    pub fn new_receive(meta: FileMeta, chunk_size: usize) -> Self {
        Self::new(TransferDirection::Receive, meta, chunk_size)
    }

    fn new(direction: TransferDirection, meta: FileMeta, chunk_size: usize) -> Self {
        let total_chunks = meta.chunk_count(chunk_size);

        Self {
            direction,
            meta,
            chunk_size,
            total_chunks,
            state: TransferState::Transferring,
            bytes_transferred: 0,
            chunks_transferred: 0,
            buffer: Vec::new(),
            started_at: Instant::now(),
            completed_at: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// File name
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.meta.name
    }

    /// Declared size
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.meta.size
    }

    /// Bytes transferred so far
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Chunks transferred so far
    #[must_use]
    pub fn chunks_transferred(&self) -> u64 {
        self.chunks_transferred
    }

    /// Account for a sent chunk
    ///
    /// # Errors
    ///
    /// Returns `TransferAborted` if the chunk would exceed the declared size.
    pub fn record_sent(&mut self, len: usize) -> Result<u64, TransferError> {
        self.advance(len)
            .map_err(|_| TransferError::aborted("source larger than declared size"))?;
        Ok(self.bytes_transferred)
    }

    /// Append a received chunk
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the chunk would exceed the declared
    /// size; nothing is appended.
    pub fn push_chunk(&mut self, chunk: Bytes) -> Result<u64, TransferError> {
        self.advance(chunk.len())
            .map_err(|_| TransferError::violation("received more bytes than declared"))?;
        self.buffer.push(chunk);
        Ok(self.bytes_transferred)
    }

    fn advance(&mut self, len: usize) -> Result<(), ()> {
        let next = self.bytes_transferred.checked_add(len as u64).ok_or(())?;
        if next > self.meta.size {
            return Err(());
        }
        self.bytes_transferred = next;
        self.chunks_transferred += 1;
        Ok(())
    }

    /// Check if every declared byte moved
    #[must_use]
    pub fn all_bytes_transferred(&self) -> bool {
        self.bytes_transferred == self.meta.size
    }

    /// Mark complete
    pub fn complete(&mut self) {
        self.state = TransferState::Complete;
        self.completed_at = Some(Instant::now());
    }

    /// Mark failed and drop buffered chunks
    pub fn fail(&mut self) {
        self.state = TransferState::Failed;
        self.buffer = Vec::new();
    }

    /// Concatenate the buffered chunks in arrival order
    #[must_use]
    pub fn take_data(&mut self) -> Bytes {
        match self.buffer.len() {
            0 => Bytes::new(),
            1 => self.buffer.pop().unwrap_or_default(),
            _ => {
                let mut data = BytesMut::with_capacity(self.bytes_transferred as usize);
                for chunk in self.buffer.drain(..) {
                    data.extend_from_slice(&chunk);
                }
                data.freeze()
            }
        }
    }

    /// Get transfer progress (0.0 to 1.0)
    ///
    /// Exactly 1.0 only when every declared byte has moved.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        fraction(self.bytes_transferred, self.meta.size)
    }

    /// Get transfer speed in bytes/sec
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn speed(&self) -> f64 {
        let elapsed = self.elapsed();
        if elapsed > 0.0 {
            self.bytes_transferred as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get ETA in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn eta(&self) -> Option<f64> {
        let speed = self.speed();
        if speed > 0.0 {
            let remaining = self.meta.size - self.bytes_transferred;
            return Some(remaining as f64 / speed);
        }
        None
    }

    /// Get elapsed time in seconds
    #[must_use]
    pub fn elapsed(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started_at).as_secs_f64()
    }
}

/// `bytes / total`, never 1.0 before `bytes == total`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn fraction(bytes: u64, total: u64) -> f64 {
    if total == 0 || bytes >= total {
        return 1.0;
    }
    let ratio = bytes as f64 / total as f64;
    ratio.min(1.0 - f64::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> FileMeta {
        FileMeta::new("file.bin", size, "application/octet-stream")
    }

    #[test]
    fn test_transfer_session_creation() {
        let session = TransferSession::new_send(meta(1024 * 1024), 256 * 1024);
        assert_eq!(session.direction, TransferDirection::Send);
        assert_eq!(session.total_chunks, 4);
        assert_eq!(session.state(), TransferState::Transferring);
        assert_eq!(session.progress(), 0.0);
    }

    #[test]
    fn test_push_chunks_and_take_data() {
        let mut session = TransferSession::new_receive(meta(6), 4);
        assert_eq!(session.push_chunk(Bytes::from_static(b"abcd")).unwrap(), 4);
        assert_eq!(session.push_chunk(Bytes::from_static(b"ef")).unwrap(), 6);
        assert!(session.all_bytes_transferred());
        assert_eq!(session.chunks_transferred(), 2);
        assert_eq!(&session.take_data()[..], b"abcdef");
    }

    #[test]
    fn test_excess_bytes_rejected() {
        let mut session = TransferSession::new_receive(meta(3), 4);
        let err = session.push_chunk(Bytes::from_static(b"abcd")).unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert_eq!(session.bytes_transferred(), 0);

        let mut session = TransferSession::new_send(meta(3), 4);
        assert!(matches!(
            session.record_sent(4),
            Err(TransferError::TransferAborted(_))
        ));
    }

    #[test]
    fn test_progress_exact_only_at_total() {
        assert_eq!(fraction(0, 0), 1.0);
        assert_eq!(fraction(16384, 40000), 0.4096);
        assert_eq!(fraction(40000, 40000), 1.0);
        assert!(fraction(u64::MAX - 1, u64::MAX) < 1.0);
    }

    #[test]
    fn test_fail_drops_buffer() {
        let mut session = TransferSession::new_receive(meta(8), 4);
        session.push_chunk(Bytes::from_static(b"abcd")).unwrap();
        session.fail();
        assert_eq!(session.state(), TransferState::Failed);
        assert!(session.take_data().is_empty());
    }

    #[test]
    fn test_speed_and_eta() {
        let mut session = TransferSession::new_send(meta(1000), 100);
        session.record_sent(100).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(session.speed() > 0.0);
        assert!(session.eta().is_some());
        session.complete();
        assert_eq!(session.state(), TransferState::Complete);
    }
}
