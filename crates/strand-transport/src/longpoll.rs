//! HTTP long-poll transport.
//!
//! For networks that block WebSocket upgrades. The server hands out a session
//! token on the first poll (status 410); every later request carries it.
//! Inbound frames arrive in batches as the bodies of pending GET requests,
//! outbound frames are POSTed one per request.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_protocol::{append_params, ProtocolError, WireFrame};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::traits::{CloseEvent, Connection, FrameSink, FrameStream, Transport, TransportError};

/// Poll status: messages delivered.
const STATUS_OK: u16 = 200;
/// Poll status: nothing arrived before the server-side poll deadline.
const STATUS_NO_CONTENT: u16 = 204;
/// Poll status: the server rejected the session.
const STATUS_FORBIDDEN: u16 = 403;
/// Poll status: new (or renewed) session token.
const STATUS_GONE: u16 = 410;

/// Long-poll transport configuration.
#[derive(Debug, Clone)]
pub struct LongPollConfig {
    /// Upper bound on a single poll request.
    pub poll_timeout: Duration,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(20),
        }
    }
}

/// HTTP long-poll transport.
#[derive(Debug, Clone, Default)]
pub struct LongPollTransport {
    config: LongPollConfig,
    client: reqwest::Client,
}

impl LongPollTransport {
    /// Create a new long-poll transport.
    #[must_use]
    pub fn new(config: LongPollConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

/// Body of every poll response.
#[derive(Debug, Deserialize)]
struct PollResponse {
    status: u16,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    messages: Vec<String>,
}

/// Map a socket endpoint onto the HTTP scheme the poller speaks.
fn normalize_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}

/// State shared by both halves of one long-poll session.
#[derive(Debug)]
struct Session {
    client: reqwest::Client,
    base: String,
    token: parking_lot::Mutex<Option<String>>,
    closed: AtomicBool,
    notify: Notify,
    request_timeout: Duration,
    poll_timeout: Duration,
}

impl Session {
    fn url(&self) -> String {
        match self.token.lock().clone() {
            Some(token) => {
                let mut params = Map::new();
                params.insert("token".to_string(), Value::String(token));
                append_params(&self.base, &params)
            }
            None => self.base.clone(),
        }
    }

    async fn poll(&self) -> Result<PollResponse, TransportError> {
        let response = self
            .client
            .get(self.url())
            .header("Accept", "application/json")
            .timeout(self.poll_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(status.as_u16()));
        }
        response
            .json::<PollResponse>()
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))
    }

    fn set_token(&self, token: Option<String>) {
        if token.is_some() {
            *self.token.lock() = token;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::ConnectionFailed(err.to_string())
    } else {
        TransportError::ReceiveFailed(err.to_string())
    }
}

#[async_trait]
impl Transport for LongPollTransport {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Connection, TransportError> {
        let session = Arc::new(Session {
            client: self.client.clone(),
            base: normalize_url(url),
            token: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            request_timeout: timeout,
            poll_timeout: self.config.poll_timeout,
        });
        debug!(url = %session.base, "Opening long-poll session");

        let handshake = tokio::time::timeout(timeout, session.poll())
            .await
            .map_err(|_| TransportError::Timeout)??;

        match handshake.status {
            STATUS_GONE => session.set_token(handshake.token),
            STATUS_FORBIDDEN => {
                return Err(TransportError::ConnectionFailed(
                    "long-poll session forbidden".to_string(),
                ))
            }
            other => return Err(TransportError::Http(other)),
        }

        debug!(url = %session.base, "Long-poll session established");
        Ok(Connection::new(
            LongPollSink {
                session: Arc::clone(&session),
            },
            LongPollReader {
                session,
                queue: VecDeque::new(),
                close_event: None,
            },
        ))
    }

    fn name(&self) -> &'static str {
        "longpoll"
    }

    fn skip_heartbeat(&self) -> bool {
        true
    }

    fn poll_timeout(&self) -> Option<Duration> {
        Some(self.config.poll_timeout)
    }
}

/// Outbound half of a long-poll session.
pub struct LongPollSink {
    session: Arc<Session>,
}

#[async_trait]
impl FrameSink for LongPollSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.session.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let body = match frame {
            WireFrame::Text(text) => text,
            WireFrame::Binary(_) => {
                return Err(TransportError::Protocol(ProtocolError::Unsupported(
                    "binary frames over long-poll".to_string(),
                )))
            }
        };

        let response = self
            .session
            .client
            .post(self.session.url())
            .header("Content-Type", "application/json")
            .timeout(self.session.request_timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Long-poll send rejected");
            return Err(TransportError::Http(status.as_u16()));
        }
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        debug!(code, reason, "Closing long-poll session");
        self.session.close();
        Ok(())
    }
}

/// Inbound half of a long-poll session.
pub struct LongPollReader {
    session: Arc<Session>,
    queue: VecDeque<String>,
    close_event: Option<CloseEvent>,
}

#[async_trait]
impl FrameStream for LongPollReader {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        loop {
            if let Some(text) = self.queue.pop_front() {
                return Ok(Some(WireFrame::Text(text)));
            }
            if self.session.is_closed() {
                return Ok(None);
            }

            let response = tokio::select! {
                response = self.session.poll() => response?,
                _ = self.session.notify.notified() => continue,
            };

            match response.status {
                STATUS_OK => {
                    trace!(count = response.messages.len(), "Long-poll batch");
                    self.session.set_token(response.token);
                    self.queue.extend(response.messages);
                }
                STATUS_NO_CONTENT => {}
                STATUS_GONE => self.session.set_token(response.token),
                STATUS_FORBIDDEN => {
                    self.close_event = Some(CloseEvent::abnormal("long-poll session forbidden"));
                    self.session.close();
                    return Ok(None);
                }
                other => {
                    self.close_event = Some(CloseEvent::abnormal(format!("poll status {other}")));
                    return Err(TransportError::Http(other));
                }
            }
        }
    }

    fn close_event(&self) -> CloseEvent {
        self.close_event.clone().unwrap_or_else(CloseEvent::normal)
    }
}
