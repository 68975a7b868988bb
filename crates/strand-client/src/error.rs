//! Client error types.

use strand_protocol::ProtocolError;
use strand_transport::TransportError;
use thiserror::Error;

/// Socket-level errors, reported to `on_error` observers.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The transport failed to connect, send or receive.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The socket was created outside a Tokio runtime.
    #[error("No Tokio runtime available")]
    NoRuntime,
}

/// Channel usage errors. These are programmer errors and are never retried.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `join` was called a second time on the same channel.
    #[error("Tried to join multiple times on channel '{0}'. join can only be called once per channel instance")]
    AlreadyJoined(String),

    /// `push` was called before `join`.
    #[error("Tried to push to channel '{0}' before joining")]
    NotJoined(String),

    /// The channel is leaving or has been closed.
    #[error("Channel '{0}' is closed")]
    Closed(String),

    /// The socket that created the channel is gone.
    #[error("Channel is detached from its socket")]
    Detached,

    /// The message could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
