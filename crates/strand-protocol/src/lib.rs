//! # strand-protocol
//!
//! Wire protocol definitions for the Strand channel client.
//!
//! This crate defines the frames exchanged between a Strand client and a
//! channel server, the codecs that put them on the wire, the protocol version
//! advertised on connect, and the query parameter encoding used to build
//! connection URLs.
//!
//! ## Frames
//!
//! Every frame is `[join_ref, ref, topic, event, payload]`:
//!
//! - `phx_join` / `phx_leave` - Channel membership
//! - `phx_reply` - Reply correlated to a push by `ref`
//! - `phx_error` / `phx_close` - Channel lifecycle notifications
//! - `heartbeat` on topic `phoenix` - Connection liveness
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use strand_protocol::{codec, Message};
//!
//! let frame = Message::new("room:lobby", "new_msg", json!({"body": "hello"})).with_ref("1");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod params;
pub mod version;

pub use codec::{decode, encode, Codec, LegacySerializer, ProtocolError, Serializer, WireFrame};
pub use frames::{
    events, is_lifecycle_event, reply_event_name, status, Message, Payload, Reply,
    HEARTBEAT_EVENT, HEARTBEAT_TOPIC,
};
pub use params::{append_params, Params};
pub use version::{Version, LEGACY_VERSION, PROTOCOL_VERSION};
