//! Transport abstraction traits for Strand.
//!
//! A [`Transport`] opens one connection to a channel server and hands back its
//! two halves: a [`FrameSink`] the socket writes encoded frames to, and a
//! [`FrameStream`] the socket reads encoded frames from. The halves are
//! driven from separate tasks, so a pending read never blocks a write.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use strand_protocol::WireFrame;
use thiserror::Error;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code used when the peer went away without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl CloseEvent {
    /// Create a close event.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure with no reason.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    /// The connection dropped without a close handshake.
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }
}

impl fmt::Display for CloseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// An HTTP request answered with an unexpected status.
    #[error("HTTP status {0}")]
    Http(u16),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] strand_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Both halves of an open connection.
pub struct Connection {
    /// Outbound half.
    pub sink: Box<dyn FrameSink>,
    /// Inbound half.
    pub stream: Box<dyn FrameStream>,
}

impl Connection {
    /// Bundle two halves.
    #[must_use]
    pub fn new(sink: impl FrameSink + 'static, stream: impl FrameStream + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// A way of reaching a channel server.
///
/// Transports are responsible for the underlying protocol (WebSocket,
/// long-poll, etc.) and provide a uniform frame interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `url`.
    ///
    /// `timeout` bounds the handshake and, for request-based transports,
    /// every individual request.
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Connection, TransportError>;

    /// Transport name, also the last path segment of the endpoint
    /// (e.g., "websocket", "longpoll").
    fn name(&self) -> &'static str;

    /// Whether the transport keeps itself alive, making heartbeats redundant.
    fn skip_heartbeat(&self) -> bool {
        false
    }

    /// Upper bound on a single poll, for request-based transports.
    fn poll_timeout(&self) -> Option<Duration> {
        None
    }
}

/// The outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one encoded frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Close the connection with a code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// The inbound half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the connection is closed.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;

    /// How the connection ended, once `recv` has returned `None`.
    fn close_event(&self) -> CloseEvent {
        CloseEvent::normal()
    }
}
