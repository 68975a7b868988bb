//! Socket options.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strand_protocol::{Codec, Params, Serializer};
use strand_transport::Transport;

use crate::timer::{default_backoff, Backoff};

/// Default timeout for pushes, joins and the transport handshake.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default upper bound on a single long-poll request.
pub const DEFAULT_LONGPOLLER_TIMEOUT: Duration = Duration::from_secs(20);

/// Diagnostic sink: `(kind, message, data)`.
pub type Logger = Arc<dyn Fn(&str, &str, Option<&Value>) + Send + Sync>;

/// Options for a [`Socket`](crate::Socket).
#[derive(Clone)]
pub struct SocketOptions {
    /// Default timeout for pushes and joins, also bounds the transport handshake.
    pub timeout: Duration,
    /// How the socket reaches the server.
    pub transport: Arc<dyn Transport>,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Backoff for socket reconnects and channel rejoins.
    pub reconnect_after: Backoff,
    /// Optional diagnostic sink, called in addition to `tracing`.
    pub logger: Option<Logger>,
    /// Upper bound on a single long-poll request.
    pub longpoller_timeout: Duration,
    /// Parameters appended to the connection URL.
    pub params: Params,
    /// Frame codec. Its version is advertised as `vsn`.
    pub codec: Arc<dyn Codec>,
    /// Value at which message references wrap back to zero.
    pub ref_limit: u64,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            transport: default_transport(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_after: default_backoff(),
            logger: None,
            longpoller_timeout: DEFAULT_LONGPOLLER_TIMEOUT,
            params: Params::new(),
            codec: Arc::new(Serializer),
            ref_limit: u64::MAX,
        }
    }
}

#[cfg(feature = "websocket")]
fn default_transport() -> Arc<dyn Transport> {
    Arc::new(strand_transport::WebSocketTransport::default())
}

#[cfg(not(feature = "websocket"))]
fn default_transport() -> Arc<dyn Transport> {
    Arc::new(strand_transport::MockTransport::new())
}

impl SocketOptions {
    /// Set the default push timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a specific transport.
    #[must_use]
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Use the long-poll transport, bounded by `longpoller_timeout`.
    #[cfg(feature = "longpoll")]
    #[must_use]
    pub fn with_longpoll(mut self) -> Self {
        self.transport = Arc::new(strand_transport::LongPollTransport::new(
            strand_transport::LongPollConfig {
                poll_timeout: self.longpoller_timeout,
            },
        ));
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reconnect/rejoin backoff.
    #[must_use]
    pub fn with_reconnect_after(mut self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.reconnect_after = Arc::new(backoff);
        self
    }

    /// Install a diagnostic sink.
    #[must_use]
    pub fn with_logger(mut self, logger: impl Fn(&str, &str, Option<&Value>) + Send + Sync + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Set the long-poll request timeout.
    ///
    /// Applies whether it is set before or after [`with_longpoll`](Self::with_longpoll).
    #[must_use]
    pub fn with_longpoller_timeout(mut self, timeout: Duration) -> Self {
        self.longpoller_timeout = timeout;
        #[cfg(feature = "longpoll")]
        {
            if self.transport.poll_timeout().is_some() && self.transport.name() == "longpoll" {
                return self.with_longpoll();
            }
        }
        self
    }

    /// Set connection parameters.
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Use a specific frame codec.
    #[must_use]
    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Set the reference wraparound limit.
    #[must_use]
    pub fn with_ref_limit(mut self, limit: u64) -> Self {
        self.ref_limit = limit;
        self
    }
}

impl fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOptions")
            .field("timeout", &self.timeout)
            .field("transport", &self.transport.name())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("logger", &self.logger.is_some())
            .field("longpoller_timeout", &self.longpoller_timeout)
            .field("params", &self.params)
            .field("codec", &self.codec)
            .field("ref_limit", &self.ref_limit)
            .finish_non_exhaustive()
    }
}
