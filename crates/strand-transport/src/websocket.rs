//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use strand_protocol::WireFrame;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{CloseEvent, Connection, FrameSink, FrameStream, Transport, TransportError};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

/// WebSocket client transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Connection, TransportError> {
        debug!(url = %url, "Opening WebSocket");

        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                error!("WebSocket handshake failed: {}", e);
                TransportError::ConnectionFailed(format!("WebSocket handshake failed: {}", e))
            })?;

        debug!(url = %url, "WebSocket handshake completed");

        let (sink, stream) = ws_stream.split();
        Ok(Connection::new(
            WebSocketSink { sink },
            WebSocketReader {
                stream,
                max_message_size: self.config.max_message_size,
                close_event: None,
            },
        ))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Outbound half of a WebSocket connection.
pub struct WebSocketSink {
    sink: SplitSink<Stream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.sink.send(message).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
            other => TransportError::SendFailed(other.to_string()),
        })
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {}", e))),
        }
    }
}

/// Inbound half of a WebSocket connection.
pub struct WebSocketReader {
    stream: SplitStream<Stream>,
    max_message_size: usize,
    close_event: Option<CloseEvent>,
}

#[async_trait]
impl FrameStream for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_message_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            text.len(),
                            self.max_message_size
                        );
                        return Err(TransportError::Protocol(
                            strand_protocol::ProtocolError::FrameTooLarge(text.len()),
                        ));
                    }
                    return Ok(Some(WireFrame::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            self.max_message_size
                        );
                        return Err(TransportError::Protocol(
                            strand_protocol::ProtocolError::FrameTooLarge(data.len()),
                        ));
                    }
                    return Ok(Some(WireFrame::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                    // Pongs to server pings are queued by tungstenite itself
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Received close frame");
                    self.close_event = Some(match frame {
                        Some(frame) => CloseEvent::new(u16::from(frame.code), frame.reason.into_owned()),
                        None => CloseEvent::normal(),
                    });
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    debug!("Connection closed");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.close_event = Some(CloseEvent::abnormal(e.to_string()));
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    if self.close_event.is_none() {
                        self.close_event = Some(CloseEvent::abnormal("stream ended"));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn close_event(&self) -> CloseEvent {
        self.close_event.clone().unwrap_or_else(CloseEvent::normal)
    }
}
