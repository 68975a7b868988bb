//! # strand-client
//!
//! Multiplexed real-time channel client for the Strand stack.
//!
//! One [`Socket`] holds a single connection to a channel server. Any number of
//! [`Channel`]s are joined, pushed to and left over it:
//!
//! - **Socket** - Connection, reconnect backoff, heartbeats, frame routing
//! - **Channel** - Join/leave state machine, event bindings, push buffering
//! - **Push** - Outbound message resolved by a correlated reply or a timeout
//! - **Presence** - Roster merging for `presence_state` / `presence_diff`
//! - **Timer** - Attempt-counting backoff used for reconnects and rejoins
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Channel   │────▶│   Socket    │────▶│  Transport  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │   member frames   │
//!        └───────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use strand_client::{Socket, SocketOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = Socket::new("ws://localhost:4000/socket", SocketOptions::default())?;
//! socket.connect();
//!
//! let channel = socket.channel("room:lobby", json!({}));
//! channel.join(None)?.receive("ok", |_| println!("joined"));
//! channel.on("new_msg", |payload| println!("{payload:?}"));
//! channel
//!     .push("new_msg", json!({"body": "hello"}), None)?
//!     .receive("error", |reason| eprintln!("rejected: {reason:?}"));
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod options;
pub mod presence;
pub mod push;
pub mod socket;
pub mod timer;

#[cfg(test)]
mod testing;

pub use channel::{BindingRef, Channel, ChannelId, ChannelState};
pub use config::{ClientConfig, TransportKind};
pub use error::{ChannelError, SocketError};
pub use options::SocketOptions;
pub use presence::{Meta, Presence, PresenceDiff, PresenceEntry, PresenceState};
pub use push::Push;
pub use socket::{CallbackRef, ConnectionState, Socket};
pub use timer::{Backoff, Timer};

pub use strand_protocol::{Message, Payload, Reply};
pub use strand_transport::{CloseEvent, MockTransport, Transport};
