//! Mock transport for testing.
//!
//! An in-memory stand-in for a server: it records every URL connected to and
//! every frame sent, and lets a test inject inbound frames or drop the
//! connection at will. Clones share state, so a test keeps one clone while the
//! socket owns another.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use strand_protocol::{decode, encode, Message, WireFrame};
use tokio::sync::mpsc;

use crate::traits::{CloseEvent, Connection, FrameSink, FrameStream, Transport, TransportError};

enum Inbound {
    Frame(WireFrame),
    Close(CloseEvent),
}

struct Link {
    id: u64,
    inbound: mpsc::UnboundedSender<Inbound>,
}

#[derive(Default)]
struct MockInner {
    urls: Vec<String>,
    sent: Vec<WireFrame>,
    close_events: Vec<CloseEvent>,
    current: Option<Link>,
    next_id: u64,
    fail_next_connect: Option<String>,
    skip_heartbeat: bool,
}

/// Mock transport for testing.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    /// Create a new mock transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report heartbeats as redundant, like a long-poll transport would.
    #[must_use]
    pub fn with_skip_heartbeat(self, skip: bool) -> Self {
        self.inner.lock().skip_heartbeat = skip;
        self
    }

    /// Cause the next `connect()` to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.inner.lock().fail_next_connect = Some(error.to_string());
    }

    /// Every URL connected to, in order.
    pub fn urls(&self) -> Vec<String> {
        self.inner.lock().urls.clone()
    }

    /// The most recent URL connected to.
    pub fn last_url(&self) -> Option<String> {
        self.inner.lock().urls.last().cloned()
    }

    /// Number of connection attempts, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.inner.lock().urls.len()
    }

    /// Whether a connection is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    /// Raw frames sent so far.
    pub fn sent(&self) -> Vec<WireFrame> {
        self.inner.lock().sent.clone()
    }

    /// Sent text frames, decoded.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|frame| frame.as_text().is_some())
            .filter_map(|frame| decode(frame).ok())
            .collect()
    }

    /// Drain the sent frames, decoded.
    pub fn take_sent(&self) -> Vec<Message> {
        let sent = std::mem::take(&mut self.inner.lock().sent);
        sent.iter()
            .filter(|frame| frame.as_text().is_some())
            .filter_map(|frame| decode(frame).ok())
            .collect()
    }

    /// Close events of connections the client closed, in order.
    pub fn close_events(&self) -> Vec<CloseEvent> {
        self.inner.lock().close_events.clone()
    }

    /// Deliver a raw frame on the open connection.
    ///
    /// Returns `false` if no connection is open.
    pub fn receive(&self, frame: WireFrame) -> bool {
        match &self.inner.lock().current {
            Some(link) => link.inbound.send(Inbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Encode and deliver a frame on the open connection.
    pub fn receive_message(&self, message: &Message) -> bool {
        match encode(message) {
            Ok(frame) => self.receive(frame),
            Err(_) => false,
        }
    }

    /// Close the open connection from the server side.
    pub fn close_from_server(&self, code: u16, reason: &str) -> bool {
        match self.inner.lock().current.take() {
            Some(link) => link
                .inbound
                .send(Inbound::Close(CloseEvent::new(code, reason)))
                .is_ok(),
            None => false,
        }
    }

    /// Drop the open connection without a close handshake.
    pub fn drop_connection(&self) -> bool {
        self.inner.lock().current.take().is_some()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str, _timeout: Duration) -> Result<Connection, TransportError> {
        let mut inner = self.inner.lock();
        inner.urls.push(url.to_string());

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.current = Some(Link { id, inbound: tx });

        Ok(Connection::new(
            MockSink {
                id,
                inner: Arc::clone(&self.inner),
            },
            MockStream {
                inbound: rx,
                close_event: None,
            },
        ))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn skip_heartbeat(&self) -> bool {
        self.inner.lock().skip_heartbeat
    }
}

struct MockSink {
    id: u64,
    inner: Arc<Mutex<MockInner>>,
}

impl MockSink {
    fn is_current(inner: &MockInner, id: u64) -> bool {
        inner.current.as_ref().is_some_and(|link| link.id == id)
    }
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !Self::is_current(&inner, self.id) {
            return Err(TransportError::ConnectionClosed);
        }
        inner.sent.push(frame);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !Self::is_current(&inner, self.id) {
            return Ok(());
        }
        let event = CloseEvent::new(code, reason);
        inner.close_events.push(event.clone());
        if let Some(link) = inner.current.take() {
            let _ = link.inbound.send(Inbound::Close(event));
        }
        Ok(())
    }
}

struct MockStream {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    close_event: Option<CloseEvent>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        if self.close_event.is_some() {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(Inbound::Frame(frame)) => Ok(Some(frame)),
            Some(Inbound::Close(event)) => {
                self.close_event = Some(event);
                Ok(None)
            }
            None => {
                self.close_event = Some(CloseEvent::abnormal("connection dropped"));
                Ok(None)
            }
        }
    }

    fn close_event(&self) -> CloseEvent {
        self.close_event.clone().unwrap_or_else(CloseEvent::normal)
    }
}
