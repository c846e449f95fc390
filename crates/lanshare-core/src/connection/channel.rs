//! Ordered, reliable message channel between two devices.
//!
//! A [`Channel`] is created before any transport exists (`Connecting`) so the
//! connection manager can hand it out while negotiation runs. The first
//! verified TCP stream attached to it opens it; every later stream is
//! refused. Messages are delivered in order, exactly once, while open.

use super::frame::{Frame, FrameTag, read_frame, write_frame};
use crate::error::ChannelError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for a transport
    Connecting,
    /// Messages flow both ways
    Open,
    /// Local close in progress
    Closing,
    /// Transport gone
    Closed,
}

/// Message received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Text message
    Text(String),
    /// Binary message
    Binary(Bytes),
}

/// Receiving half of a channel
pub type ChannelReceiver = mpsc::Receiver<ChannelMessage>;

struct Inner {
    state: watch::Sender<ChannelState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    incoming: Mutex<Option<mpsc::Sender<ChannelMessage>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// A send was cut short; the stream is mid-frame
    interrupted: AtomicBool,
}

impl Inner {
    async fn finish(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.state.send_replace(ChannelState::Closed);
    }
}

/// Bidirectional message channel
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("state", &self.state()).finish()
    }
}

impl Channel {
    /// Create a channel in `Connecting` state
    ///
    /// Incoming messages are queued up to `buffer` deep; a full queue stops
    /// reading from the transport.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, ChannelReceiver) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (state, _) = watch::channel(ChannelState::Connecting);

        let channel = Self {
            inner: Arc::new(Inner {
                state,
                writer: Mutex::new(None),
                incoming: Mutex::new(Some(tx)),
                reader: Mutex::new(None),
                interrupted: AtomicBool::new(false),
            }),
        };

        (channel, rx)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Check if open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Watch state changes
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Attach a verified stream and open the channel
    ///
    /// Returns false if the channel is not `Connecting` (already open or
    /// closed); the stream is dropped.
    pub async fn attach(&self, stream: TcpStream) -> bool {
        let mut writer = self.inner.writer.lock().await;
        if self.state() != ChannelState::Connecting {
            return false;
        }
        let Some(incoming) = self.inner.incoming.lock().await.take() else {
            return false;
        };

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *writer = Some(write_half);

        let handle = tokio::spawn(read_loop(
            read_half,
            incoming,
            Arc::downgrade(&self.inner),
        ));
        *self.inner.reader.lock().await = Some(handle);

        self.inner.state.send_replace(ChannelState::Open);
        tracing::debug!("Channel open");
        true
    }

    /// Wait until the channel leaves `Connecting`
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the channel closed without opening.
    pub async fn wait_open(&self) -> Result<(), ChannelError> {
        let mut rx = self.watch();
        let state = *rx
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map_err(|_| ChannelError::Closed)?;

        if state == ChannelState::Open {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    /// Wait until the channel is closed
    pub async fn wait_closed(&self) {
        let mut rx = self.watch();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Send a text message
    ///
    /// # Errors
    ///
    /// `NotReady` before open, `Closed` after close, `Io` on transport failure.
    pub async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.send_frame(Frame::new(
            FrameTag::Text,
            Bytes::copy_from_slice(text.as_bytes()),
        ))
        .await
    }

    /// Send a binary message
    ///
    /// # Errors
    ///
    /// `NotReady` before open, `Closed` after close, `Io` on transport failure.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.send_frame(Frame::new(FrameTag::Binary, data)).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        let mut state_rx = self.watch();
        check_sendable(*state_rx.borrow_and_update())?;

        let mut guard = self.inner.writer.lock().await;
        check_sendable(self.state())?;
        let Some(writer) = guard.as_mut() else {
            return Err(ChannelError::Closed);
        };

        tokio::select! {
            result = write_frame(writer, &frame) => result,
            _ = state_rx.wait_for(|s| *s != ChannelState::Open) => {
                self.inner.interrupted.store(true, Ordering::Release);
                Err(ChannelError::Closed)
            }
        }
    }

    /// Close the channel
    ///
    /// Interrupts any send in flight, tells the remote, and stops reading.
    /// Receivers observe the end of the message stream.
    pub async fn close(&self) {
        let mut previous = ChannelState::Closed;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            if *state == ChannelState::Closed {
                return false;
            }
            *state = ChannelState::Closing;
            true
        });
        if previous == ChannelState::Closed {
            return;
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if !self.inner.interrupted.load(Ordering::Acquire) {
                let _ = write_frame(&mut writer, &Frame::empty(FrameTag::Close)).await;
            }
            let _ = writer.shutdown().await;
        }

        // Never attached: drop the sender so receivers see the end
        self.inner.incoming.lock().await.take();

        if let Some(reader) = self.inner.reader.lock().await.take() {
            reader.abort();
        }

        self.inner.state.send_replace(ChannelState::Closed);
        tracing::debug!("Channel closed");
    }
}

fn check_sendable(state: ChannelState) -> Result<(), ChannelError> {
    match state {
        ChannelState::Open => Ok(()),
        ChannelState::Connecting => Err(ChannelError::NotReady),
        ChannelState::Closing | ChannelState::Closed => Err(ChannelError::Closed),
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    incoming: mpsc::Sender<ChannelMessage>,
    inner: Weak<Inner>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Channel read failed: {}", e);
                break;
            }
        };

        let message = match frame.tag {
            FrameTag::Text => match String::from_utf8(frame.payload.to_vec()) {
                Ok(text) => ChannelMessage::Text(text),
                Err(_) => {
                    tracing::warn!("Channel read failed: {}", ChannelError::InvalidText);
                    break;
                }
            },
            FrameTag::Binary => ChannelMessage::Binary(frame.payload),
            FrameTag::Close => {
                tracing::debug!("Remote closed channel");
                break;
            }
            FrameTag::Hello | FrameTag::HelloAck => {
                tracing::warn!("Unexpected {:?} frame on open channel", frame.tag);
                continue;
            }
        };

        if incoming.send(message).await.is_err() {
            break;
        }
    }

    drop(incoming);
    if let Some(inner) = inner.upgrade() {
        inner.finish().await;
    }
}

/// Dial a candidate and perform the session greeting
///
/// # Errors
///
/// Returns error if the connect or greeting fails or exceeds `timeout`.
pub async fn dial(
    addr: SocketAddr,
    session_id: &str,
    timeout: Duration,
) -> Result<TcpStream, ChannelError> {
    time::timeout(timeout, greet(addr, session_id))
        .await
        .map_err(|_| ChannelError::Io(format!("dial {addr} timed out")))?
}

async fn greet(addr: SocketAddr, session_id: &str) -> Result<TcpStream, ChannelError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(
        &mut stream,
        &Frame::new(FrameTag::Hello, Bytes::copy_from_slice(session_id.as_bytes())),
    )
    .await?;

    match read_frame(&mut stream).await? {
        Some(frame) if frame.tag == FrameTag::HelloAck => Ok(stream),
        Some(frame) => Err(ChannelError::InvalidFrame(frame.tag as u8)),
        None => Err(ChannelError::Closed),
    }
}

/// Accept streams until one greets with `session_id`
///
/// Each stream is greeted in its own task, so a silent peer never holds up
/// the others. Streams with a wrong or missing greeting are dropped.
///
/// # Errors
///
/// Returns error if the listener fails.
pub async fn accept_verified(
    listener: &TcpListener,
    session_id: &str,
    greeting_timeout: Duration,
) -> Result<TcpStream, ChannelError> {
    let expected = Bytes::copy_from_slice(session_id.as_bytes());
    let mut greetings = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, from) = accepted?;
                greetings.spawn(check_greeting(
                    stream,
                    from,
                    expected.clone(),
                    greeting_timeout,
                ));
            }
            Some(joined) = greetings.join_next(), if !greetings.is_empty() => {
                if let Ok(Some(stream)) = joined {
                    return Ok(stream);
                }
            }
        }
    }
}

async fn check_greeting(
    mut stream: TcpStream,
    from: SocketAddr,
    expected: Bytes,
    timeout: Duration,
) -> Option<TcpStream> {
    match time::timeout(timeout, read_frame(&mut stream)).await {
        Ok(Ok(Some(frame))) if frame.tag == FrameTag::Hello && frame.payload == expected => {
            if let Err(e) = write_frame(&mut stream, &Frame::empty(FrameTag::HelloAck)).await {
                tracing::debug!("Greeting ack to {} failed: {}", from, e);
                return None;
            }
            Some(stream)
        }
        _ => {
            tracing::warn!("Rejected channel stream from {}", from);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn open_pair() -> ((Channel, ChannelReceiver), (Channel, ChannelReceiver)) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            accept_verified(&listener, "session", TIMEOUT).await.unwrap()
        });
        let dialed = dial(addr, "session", TIMEOUT).await.unwrap();
        let accepted = accept.await.unwrap();

        let a = Channel::new(16);
        let b = Channel::new(16);
        assert!(a.0.attach(dialed).await);
        assert!(b.0.attach(accepted).await);
        (a, b)
    }

    #[tokio::test]
    async fn test_send_before_open_not_ready() {
        let (channel, _rx) = Channel::new(4);
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(
            channel.send_text("hello").await.unwrap_err(),
            ChannelError::NotReady
        );
    }

    #[tokio::test]
    async fn test_messages_in_order() {
        let ((a, _a_rx), (_b, mut b_rx)) = open_pair().await;

        a.send_text("first").await.unwrap();
        for i in 0..20u8 {
            a.send_binary(vec![i; 100]).await.unwrap();
        }

        assert_eq!(
            b_rx.recv().await.unwrap(),
            ChannelMessage::Text("first".into())
        );
        for i in 0..20u8 {
            assert_eq!(
                b_rx.recv().await.unwrap(),
                ChannelMessage::Binary(Bytes::from(vec![i; 100]))
            );
        }
    }

    #[tokio::test]
    async fn test_second_attach_refused() {
        let ((a, _a_rx), _b) = open_pair().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) = tokio::join!(TcpStream::connect(addr), listener.accept());

        assert!(!a.attach(stream.unwrap()).await);
        assert!(a.is_open());
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let ((a, _a_rx), (b, mut b_rx)) = open_pair().await;

        a.close().await;
        assert_eq!(a.state(), ChannelState::Closed);
        assert_eq!(
            a.send_text("late").await.unwrap_err(),
            ChannelError::Closed
        );

        // Remote sees the end of the stream and closes
        assert!(b_rx.recv().await.is_none());
        time::timeout(TIMEOUT, b.wait_closed()).await.unwrap();
        assert_eq!(b.send_binary(vec![1]).await.unwrap_err(), ChannelError::Closed);
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let (channel, mut rx) = Channel::new(4);
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_open().await })
        };

        channel.close().await;
        assert_eq!(waiter.await.unwrap(), Err(ChannelError::Closed));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_session_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            accept_verified(&listener, "right", TIMEOUT).await.unwrap()
        });

        assert!(dial(addr, "wrong", TIMEOUT).await.is_err());
        assert!(dial(addr, "right", TIMEOUT).await.is_ok());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_stream_does_not_block_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            accept_verified(&listener, "session", Duration::from_secs(60)).await
        });

        // Connects first and never greets
        let _silent = TcpStream::connect(addr).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let dialed = time::timeout(Duration::from_secs(2), dial(addr, "session", TIMEOUT))
            .await
            .expect("greeting held up by silent stream");
        assert!(dialed.is_ok());
        assert!(accept.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_utf8_text_closes_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            accept_verified(&listener, "session", TIMEOUT).await.unwrap()
        });
        let mut raw = dial(addr, "session", TIMEOUT).await.unwrap();
        let (channel, mut rx) = Channel::new(4);
        assert!(channel.attach(accept.await.unwrap()).await);

        write_frame(&mut raw, &Frame::new(FrameTag::Text, Bytes::from_static(b"ok")))
            .await
            .unwrap();
        write_frame(
            &mut raw,
            &Frame::new(FrameTag::Text, Bytes::from_static(&[0x66, 0xFF, 0xFE])),
        )
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), ChannelMessage::Text("ok".into()));
        assert!(rx.recv().await.is_none());
        time::timeout(TIMEOUT, channel.wait_closed()).await.unwrap();
    }
}
