//! # strand-transport
//!
//! Transport abstraction layer for the Strand channel client.
//!
//! This crate provides a unified interface for reaching a channel server:
//!
//! - **WebSocket** - The standard, works everywhere
//! - **Long-poll** - Plain HTTP for networks that block upgrades
//! - **Mock** - In-memory transport for tests
//!
//! ## Transport Abstraction
//!
//! All transports implement [`Transport`], which opens a [`Connection`] made of
//! a [`FrameSink`] and a [`FrameStream`], allowing the client to be
//! protocol-agnostic.
//!
//! ```rust,ignore
//! use strand_transport::{Transport, WebSocketTransport};
//!
//! let conn = WebSocketTransport::default()
//!     .connect("ws://localhost:4000/socket/websocket?vsn=2.0.0", timeout)
//!     .await?;
//! while let Some(frame) = conn.stream.recv().await? {
//!     // Decode and route frame
//! }
//! ```

pub mod mock;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "longpoll")]
pub mod longpoll;

pub use mock::MockTransport;
pub use traits::{
    CloseEvent, Connection, FrameSink, FrameStream, Transport, TransportError, CLOSE_ABNORMAL,
    CLOSE_NORMAL,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};

#[cfg(feature = "longpoll")]
pub use longpoll::{LongPollConfig, LongPollTransport};
