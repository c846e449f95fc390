//! Receiver-side reassembly of the chunk protocol.
//!
//! [`TransferReceiver`] is a plain state machine fed one channel message at a
//! time. At most one session is active. A protocol violation aborts the
//! active session and discards everything up to the next `end`, so two
//! files are never merged.

use super::file::ReceivedFile;
use super::protocol::{ControlMessage, FileMeta};
use super::session::TransferSession;
use crate::connection::ChannelMessage;
use crate::error::TransferError;
use bytes::Bytes;
use lanshare_discovery::DeviceId;
use std::borrow::Cow;
use std::time::SystemTime;

/// Receiver progress after one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveProgress {
    /// File name
    pub file_name: String,
    /// Declared size
    pub total_size: u64,
    /// Bytes received so far
    pub bytes_received: u64,
    /// `bytes_received / total_size`
    pub progress: f64,
}

/// Result of handling one message
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// `meta` opened a session
    Started(FileMeta),
    /// A chunk was appended
    Progress(ReceiveProgress),
    /// `end` completed the session
    Completed(ReceivedFile),
    /// Sender cancelled the active session
    Cancelled(String),
    /// Message dropped (discarding after a violation)
    Discarded,
}

/// Receiver state for one channel
#[derive(Debug)]
pub struct TransferReceiver {
    remote: DeviceId,
    chunk_size: usize,
    max_file_size: u64,
    session: Option<TransferSession>,
    discarding: bool,
}

impl TransferReceiver {
    /// Create a receiver for messages from `remote`
    #[must_use]
    pub fn new(remote: DeviceId, chunk_size: usize, max_file_size: u64) -> Self {
        Self {
            remote,
            chunk_size,
            max_file_size,
            session: None,
            discarding: false,
        }
    }

    /// Active session, if any
    #[must_use]
    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    /// Discarding frames after a violation
    #[must_use]
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Handle one channel message
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for unknown control messages, a second
    /// `meta`, chunks without a session, excess bytes, or a short `end`.
    pub fn handle(&mut self, message: ChannelMessage) -> Result<ReceiveOutcome, TransferError> {
        match message {
            ChannelMessage::Text(text) => match ControlMessage::from_json(&text) {
                Ok(control) => self.handle_control(control),
                Err(e) => {
                    self.violate();
                    Err(e)
                }
            },
            ChannelMessage::Binary(chunk) => self.handle_chunk(chunk),
        }
    }

    fn handle_control(&mut self, control: ControlMessage) -> Result<ReceiveOutcome, TransferError> {
        if self.discarding {
            if matches!(control, ControlMessage::End | ControlMessage::Cancel) {
                tracing::debug!("Discard ended at {}", control.kind());
                self.discarding = false;
            }
            return Ok(ReceiveOutcome::Discarded);
        }

        match control {
            ControlMessage::Meta(meta) => self.start(meta),
            ControlMessage::End => self.finish(),
            ControlMessage::Cancel => match self.session.take() {
                Some(session) => Ok(ReceiveOutcome::Cancelled(session.meta.name)),
                None => Ok(ReceiveOutcome::Discarded),
            },
        }
    }

    fn start(&mut self, meta: FileMeta) -> Result<ReceiveOutcome, TransferError> {
        if let Some(active) = &self.session {
            tracing::warn!(
                "Second meta ({}) while receiving {}",
                meta.name,
                active.file_name()
            );
            self.violate();
            return Err(TransferError::violation(
                "meta received while a transfer is active",
            ));
        }

        if meta.size > self.max_file_size {
            self.discarding = true;
            return Err(TransferError::ProtocolViolation(Cow::Owned(format!(
                "declared size {} exceeds limit {}",
                meta.size, self.max_file_size
            ))));
        }

        tracing::debug!(
            "Receiving {} ({} bytes, {}) from {}",
            meta.name,
            meta.size,
            meta.mime_type,
            self.remote.short()
        );
        self.session = Some(TransferSession::new_receive(meta.clone(), self.chunk_size));
        Ok(ReceiveOutcome::Started(meta))
    }

    fn handle_chunk(&mut self, chunk: Bytes) -> Result<ReceiveOutcome, TransferError> {
        if self.discarding {
            return Ok(ReceiveOutcome::Discarded);
        }

        let Some(session) = self.session.as_mut() else {
            self.discarding = true;
            return Err(TransferError::violation("chunk received without meta"));
        };

        if chunk.is_empty() {
            return Ok(ReceiveOutcome::Discarded);
        }

        if let Err(e) = session.push_chunk(chunk) {
            self.violate();
            return Err(e);
        }

        Ok(ReceiveOutcome::Progress(ReceiveProgress {
            file_name: session.meta.name.clone(),
            total_size: session.total_size(),
            bytes_received: session.bytes_transferred(),
            progress: session.progress(),
        }))
    }

    fn finish(&mut self) -> Result<ReceiveOutcome, TransferError> {
        let Some(mut session) = self.session.take() else {
            return Err(TransferError::violation("end received without meta"));
        };

        if !session.all_bytes_transferred() {
            let received = session.bytes_transferred();
            session.fail();
            return Err(TransferError::ProtocolViolation(Cow::Owned(format!(
                "end after {} of {} bytes",
                received,
                session.total_size()
            ))));
        }

        session.complete();
        let data = session.take_data();
        tracing::info!(
            "Received {} ({} bytes) from {} in {:.2}s",
            session.meta.name,
            data.len(),
            self.remote.short(),
            session.elapsed()
        );

        let FileMeta {
            name,
            size,
            mime_type,
        } = session.meta;

        Ok(ReceiveOutcome::Completed(ReceivedFile {
            name,
            size,
            mime_type,
            data,
            received_at: SystemTime::now(),
            from: self.remote.clone(),
        }))
    }

    fn violate(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.fail();
        }
        self.discarding = true;
    }

    /// Drop the active session, releasing its buffer
    ///
    /// Returns the name of the discarded file, if any.
    pub fn abort(&mut self) -> Option<String> {
        self.discarding = false;
        self.session.take().map(|mut session| {
            session.fail();
            session.meta.name.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::protocol::CHUNK_SIZE;

    fn receiver() -> TransferReceiver {
        TransferReceiver::new(DeviceId::from("sender"), CHUNK_SIZE, u64::MAX)
    }

    fn meta(name: &str, size: u64) -> ChannelMessage {
        ChannelMessage::Text(
            ControlMessage::Meta(FileMeta::new(name, size, "application/octet-stream")).to_json(),
        )
    }

    fn end() -> ChannelMessage {
        ChannelMessage::Text(ControlMessage::End.to_json())
    }

    fn chunk(byte: u8, len: usize) -> ChannelMessage {
        ChannelMessage::Binary(Bytes::from(vec![byte; len]))
    }

    #[test]
    fn test_receive_40000_bytes() {
        let mut rx = receiver();
        assert!(matches!(
            rx.handle(meta("a.bin", 40000)).unwrap(),
            ReceiveOutcome::Started(_)
        ));

        let mut seen = Vec::new();
        for len in [16384, 16384, 7232] {
            match rx.handle(chunk(1, len)).unwrap() {
                ReceiveOutcome::Progress(p) => seen.push((p.bytes_received, p.progress)),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen[0].0, 16384);
        assert_eq!(seen[1].0, 32768);
        assert_eq!(seen[2], (40000, 1.0));
        assert!(seen[1].1 < 1.0);

        match rx.handle(end()).unwrap() {
            ReceiveOutcome::Completed(file) => {
                assert_eq!(file.size, 40000);
                assert_eq!(file.data.len(), 40000);
                assert_eq!(file.from, DeviceId::from("sender"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.session().is_none());
    }

    #[test]
    fn test_zero_byte_file() {
        let mut rx = receiver();
        rx.handle(meta("empty.txt", 0)).unwrap();
        match rx.handle(end()).unwrap() {
            ReceiveOutcome::Completed(file) => {
                assert_eq!(file.size, 0);
                assert!(file.data.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_second_meta_is_violation_and_not_merged() {
        let mut rx = receiver();
        rx.handle(meta("first", 100)).unwrap();
        rx.handle(chunk(1, 50)).unwrap();

        let err = rx.handle(meta("second", 100)).unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert!(rx.session().is_none());
        assert!(rx.is_discarding());

        // Rest of the stream up to `end` is dropped
        assert_eq!(rx.handle(chunk(2, 100)).unwrap(), ReceiveOutcome::Discarded);
        assert_eq!(rx.handle(end()).unwrap(), ReceiveOutcome::Discarded);
        assert!(!rx.is_discarding());

        // A fresh file afterwards is clean
        rx.handle(meta("third", 3)).unwrap();
        rx.handle(chunk(3, 3)).unwrap();
        match rx.handle(end()).unwrap() {
            ReceiveOutcome::Completed(file) => assert_eq!(&file.data[..], &[3, 3, 3]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_excess_bytes_is_violation() {
        let mut rx = receiver();
        rx.handle(meta("small", 10)).unwrap();
        rx.handle(chunk(1, 8)).unwrap();

        let err = rx.handle(chunk(1, 8)).unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert!(rx.session().is_none());
        assert_eq!(rx.handle(end()).unwrap(), ReceiveOutcome::Discarded);
    }

    #[test]
    fn test_short_end_is_violation() {
        let mut rx = receiver();
        rx.handle(meta("short", 10)).unwrap();
        rx.handle(chunk(1, 4)).unwrap();

        let err = rx.handle(end()).unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert!(rx.session().is_none());
        assert!(!rx.is_discarding());
    }

    #[test]
    fn test_chunk_without_meta() {
        let mut rx = receiver();
        assert!(rx.handle(chunk(1, 4)).is_err());
        assert_eq!(rx.handle(end()).unwrap(), ReceiveOutcome::Discarded);
    }

    #[test]
    fn test_unknown_kind() {
        let mut rx = receiver();
        rx.handle(meta("f", 4)).unwrap();
        let err = rx
            .handle(ChannelMessage::Text(r#"{"kind":"resume"}"#.into()))
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert!(rx.session().is_none());
    }

    #[test]
    fn test_cancel_discards_session() {
        let mut rx = receiver();
        rx.handle(meta("f", 4)).unwrap();
        rx.handle(chunk(1, 2)).unwrap();
        assert_eq!(
            rx.handle(ChannelMessage::Text(ControlMessage::Cancel.to_json()))
                .unwrap(),
            ReceiveOutcome::Cancelled("f".into())
        );
        assert!(rx.session().is_none());
    }

    #[test]
    fn test_size_limit() {
        let mut rx = TransferReceiver::new(DeviceId::from("s"), CHUNK_SIZE, 1024);
        assert!(rx.handle(meta("big", 4096)).is_err());
        assert_eq!(rx.handle(chunk(0, 1024)).unwrap(), ReceiveOutcome::Discarded);
        assert_eq!(rx.handle(end()).unwrap(), ReceiveOutcome::Discarded);
    }

    #[test]
    fn test_abort_releases_session() {
        let mut rx = receiver();
        rx.handle(meta("half", 100)).unwrap();
        rx.handle(chunk(1, 50)).unwrap();
        assert_eq!(rx.abort(), Some("half".to_string()));
        assert!(rx.session().is_none());
        assert_eq!(rx.abort(), None);
    }
}
