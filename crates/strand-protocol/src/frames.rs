//! Frame types for the Strand protocol.
//!
//! Every frame is a five-element tuple `(join_ref, ref, topic, event, payload)`.
//! Payloads are opaque to the client except for replies, which are validated
//! into a [`Reply`] when decoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic reserved for connection housekeeping (heartbeats).
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Event carried by heartbeat frames.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Prefix of the per-push reply event name.
const REPLY_EVENT_PREFIX: &str = "chan_reply_";

/// Reserved lifecycle event names.
pub mod events {
    /// Join a channel.
    pub const JOIN: &str = "phx_join";
    /// Server reply to a push.
    pub const REPLY: &str = "phx_reply";
    /// Channel crashed or the connection dropped.
    pub const ERROR: &str = "phx_error";
    /// Channel closed.
    pub const CLOSE: &str = "phx_close";
    /// Leave a channel.
    pub const LEAVE: &str = "phx_leave";

    /// All lifecycle events, in no particular order.
    pub const LIFECYCLE: [&str; 5] = [JOIN, REPLY, ERROR, CLOSE, LEAVE];
}

/// Reply statuses the client itself understands.
pub mod status {
    /// The server accepted the push.
    pub const OK: &str = "ok";
    /// The server rejected the push.
    pub const ERROR: &str = "error";
    /// No reply arrived in time. Synthesized locally, never sent by a peer.
    pub const TIMEOUT: &str = "timeout";
}

/// Whether `event` is one of the reserved lifecycle events.
#[must_use]
pub fn is_lifecycle_event(event: &str) -> bool {
    events::LIFECYCLE.contains(&event)
}

/// The channel-local event name a reply with `msg_ref` is re-dispatched under.
#[must_use]
pub fn reply_event_name(msg_ref: &str) -> String {
    format!("{REPLY_EVENT_PREFIX}{msg_ref}")
}

/// A server reply to a specific push.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Reply status (`ok`, `error`, `timeout` or an application status).
    pub status: String,
    /// Reply body.
    pub response: Box<Payload>,
}

impl Reply {
    /// Create a new reply.
    #[must_use]
    pub fn new(status: impl Into<String>, response: impl Into<Payload>) -> Self {
        Self {
            status: status.into(),
            response: Box::new(response.into()),
        }
    }

    /// The locally synthesized timeout reply.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new(status::TIMEOUT, Value::Object(Default::default()))
    }
}

/// A frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Arbitrary JSON value.
    Json(Value),
    /// Raw bytes carried in a binary frame.
    Binary(Bytes),
    /// A validated `phx_reply` payload.
    Reply(Reply),
}

impl Payload {
    /// An empty JSON object, the payload of most housekeeping frames.
    #[must_use]
    pub fn empty() -> Self {
        Payload::Json(Value::Object(Default::default()))
    }

    /// Borrow the JSON value, if this is a JSON payload.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Borrow the bytes, if this is a binary payload.
    #[must_use]
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// Borrow the reply, if this is a reply payload.
    #[must_use]
    pub fn as_reply(&self) -> Option<&Reply> {
        match self {
            Payload::Reply(reply) => Some(reply),
            _ => None,
        }
    }

    /// Whether the payload must travel in a binary frame.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        match self {
            Payload::Binary(_) => true,
            Payload::Reply(reply) => reply.response.is_binary(),
            Payload::Json(_) => false,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Binary(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(data))
    }
}

impl From<Reply> for Payload {
    fn from(reply: Reply) -> Self {
        Payload::Reply(reply)
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Reference of the join attempt this frame belongs to.
    pub join_ref: Option<String>,
    /// Correlation reference for request/reply.
    pub msg_ref: Option<String>,
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Frame payload.
    pub payload: Payload,
}

impl Message {
    /// Create a frame without references.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload: payload.into(),
        }
    }

    /// Set the join reference.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self
    }

    /// Set the correlation reference.
    #[must_use]
    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// Create a heartbeat frame.
    #[must_use]
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self::new(HEARTBEAT_TOPIC, HEARTBEAT_EVENT, Payload::empty()).with_ref(msg_ref)
    }

    /// Create a reply frame, as a server would send it.
    #[must_use]
    pub fn reply(
        join_ref: Option<String>,
        msg_ref: impl Into<String>,
        topic: impl Into<String>,
        reply: Reply,
    ) -> Self {
        Self::new(topic, events::REPLY, reply)
            .with_join_ref(join_ref)
            .with_ref(msg_ref)
    }

    /// Whether this frame carries a lifecycle event.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        is_lifecycle_event(&self.event)
    }
}

/// JSON shape of a reply payload on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReplyBody {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}
