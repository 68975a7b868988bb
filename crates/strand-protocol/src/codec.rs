//! Codecs for encoding and decoding Strand frames.
//!
//! The default [`Serializer`] speaks protocol 2.0.0: JSON payloads travel as a
//! text frame holding the array `[join_ref, ref, topic, event, payload]`, and
//! binary payloads travel in a compact binary frame with a length-prefixed
//! header. [`LegacySerializer`] speaks the 1.0.0 object layout.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::frames::{events, Message, Payload, Reply, ReplyBody};
use crate::version::{Version, LEGACY_VERSION, PROTOCOL_VERSION};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the kind byte that starts every binary frame.
const HEADER_LENGTH: usize = 1;

/// Size of the per-field length bytes in push and reply headers.
const META_LENGTH: usize = 4;

/// Binary frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinaryKind {
    /// Client push.
    Push = 0,
    /// Server reply.
    Reply = 1,
    /// Server broadcast.
    Broadcast = 2,
}

impl TryFrom<u8> for BinaryKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BinaryKind::Push),
            1 => Ok(BinaryKind::Reply),
            2 => Ok(BinaryKind::Broadcast),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a binary frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error, including wrong arity or field types.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A `phx_reply` payload without a string status.
    #[error("Invalid reply payload: {0}")]
    InvalidReply(String),

    /// A header field does not fit in its one-byte length.
    #[error("Field {field} is {len} bytes, binary frames allow at most 255")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length in bytes.
        len: usize,
    },

    /// Unknown binary frame kind.
    #[error("Unknown binary frame kind {0}")]
    UnknownKind(u8),

    /// A header string is not valid UTF-8.
    #[error("Invalid UTF-8 in field {0}")]
    InvalidUtf8(&'static str),

    /// The codec cannot represent this frame.
    #[error("Unsupported frame: {0}")]
    Unsupported(String),
}

/// An encoded frame as handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl WireFrame {
    /// Size of the encoded frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    /// Whether the encoded frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the text, if this is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WireFrame::Text(text) => Some(text),
            WireFrame::Binary(_) => None,
        }
    }
}

/// A pluggable frame codec.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Protocol version this codec speaks, sent as `vsn` on connect.
    fn version(&self) -> Version;

    /// Encode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be represented.
    fn encode(&self, message: &Message) -> Result<WireFrame, ProtocolError>;

    /// Decode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed.
    fn decode(&self, frame: &WireFrame) -> Result<Message, ProtocolError>;
}

/// Encode a frame with the default serializer.
///
/// # Errors
///
/// Returns an error if the frame is too large or cannot be represented.
pub fn encode(message: &Message) -> Result<WireFrame, ProtocolError> {
    Serializer.encode(message)
}

/// Decode a frame with the default serializer.
///
/// # Errors
///
/// Returns an error if the frame is too large or malformed.
pub fn decode(frame: &WireFrame) -> Result<Message, ProtocolError> {
    Serializer.decode(frame)
}

/// Positional JSON layout of a 2.0.0 frame.
type ArrayFrame = (Option<String>, Option<String>, String, String, Value);

/// Protocol 2.0.0 serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serializer;

impl Codec for Serializer {
    fn version(&self) -> Version {
        PROTOCOL_VERSION
    }

    fn encode(&self, message: &Message) -> Result<WireFrame, ProtocolError> {
        let frame = if message.payload.is_binary() {
            WireFrame::Binary(binary_encode(message)?)
        } else {
            let frame: ArrayFrame = (
                message.join_ref.clone(),
                message.msg_ref.clone(),
                message.topic.clone(),
                message.event.clone(),
                json_payload(&message.payload)?,
            );
            WireFrame::Text(serde_json::to_string(&frame)?)
        };

        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(frame.len()));
        }
        Ok(frame)
    }

    fn decode(&self, frame: &WireFrame) -> Result<Message, ProtocolError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(frame.len()));
        }

        match frame {
            WireFrame::Text(text) => {
                let (join_ref, msg_ref, topic, event, payload): ArrayFrame =
                    serde_json::from_str(text)?;
                let payload = decode_json_payload(&event, payload)?;
                Ok(Message {
                    join_ref,
                    msg_ref,
                    topic,
                    event,
                    payload,
                })
            }
            WireFrame::Binary(data) => binary_decode(data),
        }
    }
}

/// Object layout of a 1.0.0 frame.
#[derive(Debug, Serialize, Deserialize)]
struct ObjectFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

/// Protocol 1.0.0 serializer. JSON only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacySerializer;

impl Codec for LegacySerializer {
    fn version(&self) -> Version {
        LEGACY_VERSION
    }

    fn encode(&self, message: &Message) -> Result<WireFrame, ProtocolError> {
        if message.payload.is_binary() {
            return Err(ProtocolError::Unsupported(format!(
                "binary payload on {} with protocol {LEGACY_VERSION}",
                message.topic
            )));
        }
        let frame = ObjectFrame {
            topic: message.topic.clone(),
            event: message.event.clone(),
            payload: json_payload(&message.payload)?,
            msg_ref: message.msg_ref.clone(),
            join_ref: message.join_ref.clone(),
        };
        Ok(WireFrame::Text(serde_json::to_string(&frame)?))
    }

    fn decode(&self, frame: &WireFrame) -> Result<Message, ProtocolError> {
        let WireFrame::Text(text) = frame else {
            return Err(ProtocolError::Unsupported(format!(
                "binary frame with protocol {LEGACY_VERSION}"
            )));
        };
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(text.len()));
        }
        let frame: ObjectFrame = serde_json::from_str(text)?;
        let payload = decode_json_payload(&frame.event, frame.payload)?;
        Ok(Message {
            join_ref: frame.join_ref,
            msg_ref: frame.msg_ref,
            topic: frame.topic,
            event: frame.event,
            payload,
        })
    }
}

fn json_payload(payload: &Payload) -> Result<Value, ProtocolError> {
    match payload {
        Payload::Json(value) => Ok(value.clone()),
        Payload::Reply(reply) => {
            let response = match reply.response.as_ref() {
                Payload::Json(value) => value.clone(),
                other => {
                    return Err(ProtocolError::Unsupported(format!(
                        "nested reply payload {other:?}"
                    )))
                }
            };
            Ok(serde_json::to_value(ReplyBody {
                status: reply.status.clone(),
                response,
            })?)
        }
        Payload::Binary(_) => Err(ProtocolError::Unsupported(
            "binary payload in a text frame".into(),
        )),
    }
}

fn decode_json_payload(event: &str, payload: Value) -> Result<Payload, ProtocolError> {
    if event != events::REPLY {
        return Ok(Payload::Json(payload));
    }
    let body: ReplyBody = serde_json::from_value(payload)
        .map_err(|e| ProtocolError::InvalidReply(e.to_string()))?;
    Ok(Payload::Reply(Reply::new(body.status, body.response)))
}

fn header_len(field: &'static str, value: &str) -> Result<u8, ProtocolError> {
    u8::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: value.len(),
    })
}

/// Encode a binary push (or a binary reply, as a server would send it).
fn binary_encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let join_ref = message.join_ref.as_deref().unwrap_or("");
    let msg_ref = message.msg_ref.as_deref().unwrap_or("");

    let (kind, label, data) = match &message.payload {
        Payload::Binary(data) => (BinaryKind::Push, message.event.as_str(), data),
        Payload::Reply(reply) if reply.response.is_binary() => match reply.response.as_ref() {
            Payload::Binary(data) => (BinaryKind::Reply, reply.status.as_str(), data),
            other => {
                return Err(ProtocolError::Unsupported(format!(
                    "nested reply payload {other:?}"
                )))
            }
        },
        other => {
            return Err(ProtocolError::Unsupported(format!(
                "payload {other:?} in a binary frame"
            )))
        }
    };

    let sizes = [
        header_len("join_ref", join_ref)?,
        header_len("ref", msg_ref)?,
        header_len("topic", &message.topic)?,
        header_len("event", label)?,
    ];
    let meta: usize = sizes.iter().map(|&s| usize::from(s)).sum();

    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + META_LENGTH + meta + data.len());
    buf.put_u8(kind as u8);
    buf.put_slice(&sizes);
    buf.put_slice(join_ref.as_bytes());
    buf.put_slice(msg_ref.as_bytes());
    buf.put_slice(message.topic.as_bytes());
    buf.put_slice(label.as_bytes());
    buf.put_slice(data);

    Ok(buf.freeze())
}

/// Read cursor over a binary frame.
struct Cursor<'a> {
    data: &'a Bytes,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&self, index: usize) -> Result<usize, ProtocolError> {
        self.data
            .get(index)
            .map(|&b| usize::from(b))
            .ok_or(ProtocolError::Incomplete(index + 1 - self.data.len()))
    }

    fn string(&mut self, field: &'static str, len: usize) -> Result<String, ProtocolError> {
        let end = self.offset + len;
        if end > self.data.len() {
            return Err(ProtocolError::Incomplete(end - self.data.len()));
        }
        let value = std::str::from_utf8(&self.data[self.offset..end])
            .map_err(|_| ProtocolError::InvalidUtf8(field))?
            .to_string();
        self.offset = end;
        Ok(value)
    }

    fn rest(&self) -> Bytes {
        self.data.slice(self.offset..)
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn binary_decode(data: &Bytes) -> Result<Message, ProtocolError> {
    let kind = data
        .first()
        .copied()
        .ok_or(ProtocolError::Incomplete(HEADER_LENGTH))?;

    match BinaryKind::try_from(kind)? {
        BinaryKind::Push => {
            // Server pushes carry no ref: [kind, join_ref, topic, event]
            let mut cur = Cursor { data, offset: 0 };
            let (join_ref_size, topic_size, event_size) = (cur.byte(1)?, cur.byte(2)?, cur.byte(3)?);
            cur.offset = HEADER_LENGTH + META_LENGTH - 1;
            let join_ref = cur.string("join_ref", join_ref_size)?;
            let topic = cur.string("topic", topic_size)?;
            let event = cur.string("event", event_size)?;
            Ok(Message {
                join_ref: non_empty(join_ref),
                msg_ref: None,
                topic,
                event,
                payload: Payload::Binary(cur.rest()),
            })
        }
        BinaryKind::Reply => {
            let mut cur = Cursor { data, offset: 0 };
            let (join_ref_size, ref_size, topic_size, status_size) =
                (cur.byte(1)?, cur.byte(2)?, cur.byte(3)?, cur.byte(4)?);
            cur.offset = HEADER_LENGTH + META_LENGTH;
            let join_ref = cur.string("join_ref", join_ref_size)?;
            let msg_ref = cur.string("ref", ref_size)?;
            let topic = cur.string("topic", topic_size)?;
            let status = cur.string("status", status_size)?;
            Ok(Message {
                join_ref: non_empty(join_ref),
                msg_ref: non_empty(msg_ref),
                topic,
                event: events::REPLY.to_string(),
                payload: Payload::Reply(Reply::new(status, cur.rest())),
            })
        }
        BinaryKind::Broadcast => {
            let mut cur = Cursor { data, offset: 0 };
            let (topic_size, event_size) = (cur.byte(1)?, cur.byte(2)?);
            cur.offset = HEADER_LENGTH + 2;
            let topic = cur.string("topic", topic_size)?;
            let event = cur.string("event", event_size)?;
            Ok(Message {
                join_ref: None,
                msg_ref: None,
                topic,
                event,
                payload: Payload::Binary(cur.rest()),
            })
        }
    }
}
