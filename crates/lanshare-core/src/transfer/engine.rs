//! Per-channel transfer engine.
//!
//! One engine runs on every open channel: a background task feeds incoming
//! messages through a [`TransferReceiver`] and publishes the outcomes, while
//! `send_*` calls stream one file at a time in the other direction.

use super::file::{DEFAULT_MIME_TYPE, mime_from_name};
use super::protocol::{CHUNK_SIZE, FileMeta};
use super::receiver::{ReceiveOutcome, TransferReceiver};
use super::sender::{SendReport, send_stream};
use crate::connection::{Channel, ChannelReceiver};
use crate::error::{ErrorCategory, TransferError};
use crate::event::{EventBus, NodeEvent, TransferDirection, TransferProgressEvent};
use bytes::Bytes;
use lanshare_discovery::DeviceId;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Binary chunk size in bytes
    pub chunk_size: usize,
    /// Largest accepted incoming file (held in memory until `end`)
    pub max_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_file_size: 4 * 1024 * 1024 * 1024, // 4 GiB
        }
    }
}

/// Transfer engine bound to one open channel
pub struct TransferEngine {
    remote: DeviceId,
    channel: Channel,
    config: TransferConfig,
    events: EventBus,
    send_lock: Mutex<()>,
    receiver: Arc<Mutex<TransferReceiver>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TransferEngine {
    /// Start receiving on `channel`
    #[must_use]
    pub fn spawn(
        remote: DeviceId,
        channel: Channel,
        incoming: ChannelReceiver,
        config: TransferConfig,
        events: EventBus,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(TransferReceiver::new(
            remote.clone(),
            config.chunk_size,
            config.max_file_size,
        )));

        let task = tokio::spawn(receive_loop(
            remote.clone(),
            incoming,
            receiver.clone(),
            events.clone(),
        ));

        Self {
            remote,
            channel,
            config,
            events,
            send_lock: Mutex::new(()),
            receiver,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Remote device
    #[must_use]
    pub fn remote(&self) -> &DeviceId {
        &self.remote
    }

    /// Underlying channel
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Check if a send is active
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.send_lock.try_lock().is_err()
    }

    /// Send a file from disk
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, another send is active, or
    /// the transfer is aborted.
    pub async fn send_file(&self, path: &Path) -> Result<SendReport, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime_type = mime_from_name(&name);

        self.send_reader(FileMeta::new(name, size, mime_type), file)
            .await
    }

    /// Send an in-memory buffer as a file
    ///
    /// # Errors
    ///
    /// Returns error if another send is active or the transfer is aborted.
    pub async fn send_bytes(
        &self,
        name: &str,
        data: Bytes,
        mime_type: Option<&str>,
    ) -> Result<SendReport, TransferError> {
        let mime_type = mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| mime_from_name(name));
        let meta = FileMeta::new(name, data.len() as u64, mime_type);
        self.send_reader(meta, &data[..]).await
    }

    /// Send `meta.size` bytes from `reader`
    ///
    /// # Errors
    ///
    /// Returns `TransferInProgress` if another send is active on this
    /// channel, `ChannelNotReady` before open, `TransferAborted` if the
    /// channel closes or the source does not match `meta.size`.
    pub async fn send_reader<R>(
        &self,
        mut meta: FileMeta,
        reader: R,
    ) -> Result<SendReport, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self
            .send_lock
            .try_lock()
            .map_err(|_| TransferError::TransferInProgress)?;

        if meta.mime_type.is_empty() {
            meta.mime_type = DEFAULT_MIME_TYPE.to_string();
        }

        tracing::info!(
            "Sending {} ({} bytes) to {}",
            meta.name,
            meta.size,
            self.remote.short()
        );

        let result = send_stream(&self.channel, meta, reader, self.config.chunk_size, |session| {
            self.events
                .emit(NodeEvent::TransferProgress(TransferProgressEvent {
                    remote: self.remote.clone(),
                    direction: TransferDirection::Send,
                    file_name: session.meta.name.clone(),
                    total_size: session.total_size(),
                    bytes: session.bytes_transferred(),
                    progress: session.progress(),
                }));
        })
        .await;

        match &result {
            Ok(report) => {
                tracing::info!(
                    "Sent {} ({} bytes, {} chunks) in {:.2}s",
                    report.file_name,
                    report.bytes_sent,
                    report.chunks_sent,
                    report.elapsed
                );
                self.events.emit(NodeEvent::TransferCompleted {
                    remote: self.remote.clone(),
                    file_name: report.file_name.clone(),
                    size: report.bytes_sent,
                });
            }
            Err(e) => {
                self.events
                    .error(Some(&self.remote), e.category(), e.to_string());
            }
        }

        result
    }

    /// Stop receiving and discard any partial incoming file
    pub async fn shutdown(&self) {
        if let Some(task) = self.take_task() {
            task.abort();
        }
        let discarded = self.receiver.lock().await.abort();
        report_aborted(&self.events, &self.remote, discarded);
    }

    /// Wait for the receive loop to consume everything the channel delivered
    ///
    /// Used after the remote closed: messages already read off the socket
    /// (including a final `end`) are still processed.
    pub async fn drain(&self) {
        if let Some(task) = self.take_task() {
            let _ = task.await;
        }
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().ok().and_then(|mut task| task.take())
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

async fn receive_loop(
    remote: DeviceId,
    mut incoming: ChannelReceiver,
    receiver: Arc<Mutex<TransferReceiver>>,
    events: EventBus,
) {
    while let Some(message) = incoming.recv().await {
        let outcome = receiver.lock().await.handle(message);

        match outcome {
            Ok(ReceiveOutcome::Progress(p)) => {
                events.emit(NodeEvent::TransferProgress(TransferProgressEvent {
                    remote: remote.clone(),
                    direction: TransferDirection::Receive,
                    file_name: p.file_name,
                    total_size: p.total_size,
                    bytes: p.bytes_received,
                    progress: p.progress,
                }));
            }
            Ok(ReceiveOutcome::Completed(file)) => {
                events.emit(NodeEvent::FileReceived(file));
            }
            Ok(ReceiveOutcome::Cancelled(name)) => {
                events.error(
                    Some(&remote),
                    ErrorCategory::TransferAborted,
                    format!("sender cancelled {name}"),
                );
            }
            Ok(ReceiveOutcome::Started(_) | ReceiveOutcome::Discarded) => {}
            Err(e) => {
                tracing::warn!("Transfer from {} failed: {}", remote.short(), e);
                events.error(Some(&remote), e.category(), e.to_string());
            }
        }
    }

    // Channel ended
    let discarded = receiver.lock().await.abort();
    report_aborted(&events, &remote, discarded);
}

fn report_aborted(events: &EventBus, remote: &DeviceId, discarded: Option<String>) {
    if let Some(name) = discarded {
        tracing::info!("Discarded partial {} from {}", name, remote.short());
        events.error(
            Some(remote),
            ErrorCategory::TransferAborted,
            format!("channel closed while receiving {name}"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::channel;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    struct Pair {
        a: TransferEngine,
        b: TransferEngine,
        b_events: broadcast::Receiver<NodeEvent>,
    }

    async fn engines(config: TransferConfig) -> Pair {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let timeout = Duration::from_secs(5);

        let accept =
            tokio::spawn(async move { channel::accept_verified(&listener, "s", timeout).await });
        let dialed = channel::dial(addr, "s", timeout).await.unwrap();
        let accepted = accept.await.unwrap().unwrap();

        let (a_channel, a_rx) = Channel::new(64);
        let (b_channel, b_rx) = Channel::new(64);
        a_channel.attach(dialed).await;
        b_channel.attach(accepted).await;

        let a_bus = EventBus::default();
        let b_bus = EventBus::default();
        let b_events = b_bus.subscribe();

        Pair {
            a: TransferEngine::spawn(DeviceId::from("b"), a_channel, a_rx, config.clone(), a_bus),
            b: TransferEngine::spawn(DeviceId::from("a"), b_channel, b_rx, config, b_bus),
            b_events,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<NodeEvent>) -> NodeEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event bus closed")
    }

    #[tokio::test]
    async fn test_send_bytes_roundtrip() {
        let mut pair = engines(TransferConfig::default()).await;
        let data: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();

        let report = pair
            .a
            .send_bytes("notes.txt", Bytes::from(data.clone()), None)
            .await
            .unwrap();
        assert_eq!(report.chunks_sent, 3);

        let mut progress = Vec::new();
        loop {
            match next_event(&mut pair.b_events).await {
                NodeEvent::TransferProgress(p) => progress.push(p.bytes),
                NodeEvent::FileReceived(file) => {
                    assert_eq!(file.name, "notes.txt");
                    assert_eq!(file.mime_type, "text/plain");
                    assert_eq!(&file.data[..], &data[..]);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(progress, vec![16384, 32768, 40000]);
    }

    #[tokio::test]
    async fn test_concurrent_send_rejected() {
        let pair = engines(TransferConfig::default()).await;
        let (mut writer, reader) = tokio::io::duplex(16);

        let a = &pair.a;
        let first = a.send_reader(FileMeta::new("slow", 4, "x"), reader);
        let second = async {
            // Let the first send take the lock and block on the empty source
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(a.is_sending());
            let err = a
                .send_bytes("other", Bytes::from_static(b"x"), None)
                .await
                .unwrap_err();
            tokio::io::AsyncWriteExt::write_all(&mut writer, b"data").await.unwrap();
            drop(writer);
            err
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(second, TransferError::TransferInProgress);
        assert_eq!(first.unwrap().bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_shutdown_mid_transfer_discards_partial() {
        let mut pair = engines(TransferConfig {
            chunk_size: 4,
            ..TransferConfig::default()
        })
        .await;
        let (mut writer, reader) = tokio::io::duplex(64);

        let a = &pair.a;
        let sending = a.send_reader(FileMeta::new("half.bin", 8, "x"), reader);
        let half = async {
            tokio::io::AsyncWriteExt::write_all(&mut writer, b"abcd").await.unwrap();
            writer
        };
        let (_, _writer) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(300), sending),
            half
        );

        match next_event(&mut pair.b_events).await {
            NodeEvent::TransferProgress(p) => assert_eq!(p.bytes, 4),
            other => panic!("unexpected {other:?}"),
        }

        pair.b.shutdown().await;
        match next_event(&mut pair.b_events).await {
            NodeEvent::Error { category, .. } => {
                assert_eq!(category, ErrorCategory::TransferAborted);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(pair.b.receiver.lock().await.session().is_none());
    }
}
