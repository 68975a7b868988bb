//! Socket: the single connection every channel is multiplexed over.
//!
//! The socket owns the transport connection, the registry of live channels, a
//! reconnect timer and the heartbeat loop. Each connection runs as two tasks:
//! a reader that decodes inbound frames and routes them to member channels,
//! and a writer fed through an unbounded queue. Events from a superseded
//! connection are recognised by generation number and ignored.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strand_protocol::{append_params, Message, Params, Payload, ProtocolError, WireFrame};
use strand_transport::{CloseEvent, Connection, FrameSink, Transport, CLOSE_NORMAL};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelId};
use crate::error::SocketError;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::options::SocketOptions;
use crate::timer::Timer;

/// Handle returned by the `on_*` observer registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef(u64);

/// State of the transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Open and carrying frames.
    Open,
    /// Close requested, waiting for the transport to finish.
    Closing,
    /// No connection.
    Closed,
}

impl ConnectionState {
    /// State name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

type OpenCallback = Arc<dyn Fn() + Send + Sync>;
type CloseCallback = Arc<dyn Fn(&CloseEvent) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SocketError) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    open: Vec<(CallbackRef, OpenCallback)>,
    close: Vec<(CallbackRef, CloseCallback)>,
    error: Vec<(CallbackRef, ErrorCallback)>,
    message: Vec<(CallbackRef, MessageCallback)>,
}

fn snapshot<T: Clone>(list: &[(CallbackRef, T)]) -> Vec<T> {
    list.iter().map(|(_, cb)| cb.clone()).collect()
}

enum Outbound {
    Frame(WireFrame),
    Close {
        code: u16,
        reason: String,
        done: Option<oneshot::Sender<()>>,
    },
}

struct Conn {
    generation: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    state: ConnectionState,
    task: JoinHandle<()>,
    metrics: Option<ConnectionMetricsGuard>,
}

struct SocketState {
    params: Params,
    conn: Option<Conn>,
    generation: u64,
    send_buffer: Vec<WireFrame>,
    msg_ref: u64,
    pending_heartbeat_ref: Option<String>,
    heartbeat: Option<JoinHandle<()>>,
    callbacks: Callbacks,
    next_callback: u64,
}

impl SocketState {
    fn next_ref(&mut self, limit: u64) -> String {
        self.msg_ref = if self.msg_ref >= limit { 0 } else { self.msg_ref + 1 };
        self.msg_ref.to_string()
    }

    fn is_open(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.state == ConnectionState::Open)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.generation == generation)
    }

    /// Send on the open connection, or buffer until the next open.
    fn send_frame(&mut self, frame: WireFrame) {
        if self.is_open() {
            if let Some(conn) = &self.conn {
                metrics::record_frame(frame.len(), "outbound");
                if conn.tx.send(Outbound::Frame(frame)).is_err() {
                    debug!("Writer gone, frame dropped");
                }
            }
        } else {
            self.send_buffer.push(frame);
        }
    }

    fn next_callback_ref(&mut self) -> CallbackRef {
        self.next_callback += 1;
        CallbackRef(self.next_callback)
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        self.pending_heartbeat_ref = None;
    }
}

pub(crate) struct SocketShared {
    endpoint: String,
    pub(crate) options: SocketOptions,
    pub(crate) handle: Handle,
    state: Mutex<SocketState>,
    channels: DashMap<ChannelId, Channel>,
    next_channel_id: AtomicU64,
    reconnect_timer: Timer,
}

impl Drop for SocketShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.stop_heartbeat();
        if let Some(conn) = state.conn.take() {
            conn.task.abort();
        }
    }
}

/// A multiplexed connection to a channel server.
///
/// Cheap to clone; all clones refer to the same socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketShared>,
}

impl Socket {
    /// Create a socket for `endpoint` (e.g. `ws://localhost:4000/socket`).
    ///
    /// The transport name is appended to the endpoint when connecting.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NoRuntime`] when called outside a Tokio runtime.
    pub fn new(endpoint: impl Into<String>, options: SocketOptions) -> Result<Self, SocketError> {
        let handle = Handle::try_current().map_err(|_| SocketError::NoRuntime)?;
        let endpoint = endpoint.into();
        debug!(endpoint = %endpoint, options = ?options, "Creating socket");

        let inner = Arc::new_cyclic(|weak: &Weak<SocketShared>| {
            let reconnect = weak.clone();
            SocketShared {
                endpoint,
                handle: handle.clone(),
                state: Mutex::new(SocketState {
                    params: options.params.clone(),
                    conn: None,
                    generation: 0,
                    send_buffer: Vec::new(),
                    msg_ref: 0,
                    pending_heartbeat_ref: None,
                    heartbeat: None,
                    callbacks: Callbacks::default(),
                    next_callback: 0,
                }),
                channels: DashMap::new(),
                next_channel_id: AtomicU64::new(0),
                reconnect_timer: Timer::new(handle, Arc::clone(&options.reconnect_after), move || {
                    if let Some(shared) = reconnect.upgrade() {
                        Socket::from_shared(shared).reconnect();
                    }
                }),
                options,
            }
        });
        Ok(Self { inner })
    }

    pub(crate) fn from_shared(inner: Arc<SocketShared>) -> Self {
        Self { inner }
    }

    /// Socket options.
    #[must_use]
    pub fn options(&self) -> &SocketOptions {
        &self.inner.options
    }

    /// The URL the next connection will use.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        let params = self.inner.state.lock().params.clone();
        self.build_url(&params)
    }

    fn build_url(&self, params: &Params) -> String {
        let base = format!(
            "{}/{}",
            self.inner.endpoint.trim_end_matches('/'),
            self.inner.options.transport.name()
        );
        let mut vsn = Params::new();
        vsn.insert(
            "vsn".to_string(),
            Value::String(self.inner.options.codec.version().to_string()),
        );
        append_params(&append_params(&base, params), &vsn)
    }

    /// Open the connection. Does nothing if one is open or in progress.
    pub fn connect(&self) {
        let url = {
            let mut state = self.inner.state.lock();
            if state.conn.is_some() {
                return;
            }
            state.generation += 1;
            let generation = state.generation;
            let url = self.build_url(&state.params);
            let (tx, rx) = mpsc::unbounded_channel();
            let task = self.inner.handle.spawn(run_connection(
                Arc::downgrade(&self.inner),
                generation,
                Arc::clone(&self.inner.options.transport),
                url.clone(),
                self.inner.options.timeout,
                rx,
            ));
            state.conn = Some(Conn {
                generation,
                tx,
                state: ConnectionState::Connecting,
                task,
                metrics: None,
            });
            url
        };
        debug!(url = %url, "Connecting");
        if self.has_logger() {
            self.log("transport", &format!("connecting to {url}"), None);
        }
    }

    /// Merge `params` into the connection parameters, then connect.
    pub fn connect_with(&self, params: Params) {
        self.inner.state.lock().params.extend(params);
        self.connect();
    }

    /// Close the connection and wait for the transport to finish closing.
    ///
    /// Stops heartbeats and reconnects. Channels are left in their current
    /// state and are not errored.
    pub async fn disconnect(&self, code: Option<u16>, reason: Option<&str>) {
        self.inner.reconnect_timer.reset();
        let code = code.unwrap_or(CLOSE_NORMAL);
        let reason = reason.unwrap_or_default().to_string();

        let (conn, callbacks) = {
            let mut state = self.inner.state.lock();
            state.stop_heartbeat();
            (state.conn.take(), snapshot(&state.callbacks.close))
        };
        let Some(conn) = conn else {
            return;
        };

        if conn.state != ConnectionState::Connecting {
            let (done_tx, done_rx) = oneshot::channel();
            let close = Outbound::Close {
                code,
                reason: reason.clone(),
                done: Some(done_tx),
            };
            if conn.tx.send(close).is_ok() {
                let _ = tokio::time::timeout(self.inner.options.timeout, done_rx).await;
            }
        }
        conn.task.abort();
        drop(conn);

        info!(code, reason = %reason, "Disconnected");
        let event = CloseEvent::new(code, reason);
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Create a channel for `topic` and register it.
    ///
    /// Topics need not be unique; each call creates an independent channel.
    pub fn channel(&self, topic: impl Into<String>, params: impl Into<Payload>) -> Channel {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Channel::new(&self.inner, id, topic.into(), params.into());
        self.inner.channels.insert(id, channel.clone());
        debug!(topic = %channel.topic(), id, "Channel created");
        channel
    }

    /// Remove a channel from the registry.
    pub fn remove(&self, id: ChannelId) {
        if self.inner.channels.remove(&id).is_some() {
            trace!(id, "Channel removed");
        }
    }

    /// Registered channels, in creation order.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        channels.sort_by_key(Channel::id);
        channels
    }

    /// Next message reference. Wraps to zero past `ref_limit`.
    pub fn make_ref(&self) -> String {
        self.inner
            .state
            .lock()
            .next_ref(self.inner.options.ref_limit)
    }

    /// Encode and send a message, buffering it while disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec cannot encode the message.
    pub fn push(&self, message: Message) -> Result<(), ProtocolError> {
        let frame = self.inner.options.codec.encode(&message)?;
        trace!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            "Push"
        );
        if self.has_logger() {
            self.log(
                "push",
                &format!(
                    "{} {} ({}, {})",
                    message.topic,
                    message.event,
                    message.join_ref.as_deref().unwrap_or(""),
                    message.msg_ref.as_deref().unwrap_or("")
                ),
                message.payload.as_json(),
            );
        }
        self.inner.state.lock().send_frame(frame);
        Ok(())
    }

    /// Whether the connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().is_open()
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner
            .state
            .lock()
            .conn
            .as_ref()
            .map_or(ConnectionState::Closed, |conn| conn.state)
    }

    /// Run `callback` every time the connection opens.
    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) -> CallbackRef {
        let mut state = self.inner.state.lock();
        let r = state.next_callback_ref();
        state.callbacks.open.push((r, Arc::new(callback)));
        r
    }

    /// Run `callback` every time the connection closes.
    pub fn on_close(&self, callback: impl Fn(&CloseEvent) + Send + Sync + 'static) -> CallbackRef {
        let mut state = self.inner.state.lock();
        let r = state.next_callback_ref();
        state.callbacks.close.push((r, Arc::new(callback)));
        r
    }

    /// Run `callback` on transport and decode errors.
    pub fn on_error(&self, callback: impl Fn(&SocketError) + Send + Sync + 'static) -> CallbackRef {
        let mut state = self.inner.state.lock();
        let r = state.next_callback_ref();
        state.callbacks.error.push((r, Arc::new(callback)));
        r
    }

    /// Run `callback` for every decoded inbound message.
    pub fn on_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) -> CallbackRef {
        let mut state = self.inner.state.lock();
        let r = state.next_callback_ref();
        state.callbacks.message.push((r, Arc::new(callback)));
        r
    }

    /// Remove observers.
    pub fn off(&self, refs: &[CallbackRef]) {
        let mut state = self.inner.state.lock();
        let callbacks = &mut state.callbacks;
        callbacks.open.retain(|(r, _)| !refs.contains(r));
        callbacks.close.retain(|(r, _)| !refs.contains(r));
        callbacks.error.retain(|(r, _)| !refs.contains(r));
        callbacks.message.retain(|(r, _)| !refs.contains(r));
    }

    /// Whether a diagnostic logger is installed.
    #[must_use]
    pub fn has_logger(&self) -> bool {
        self.inner.options.logger.is_some()
    }

    /// Forward a diagnostic to the installed logger.
    pub fn log(&self, kind: &str, msg: &str, data: Option<&Value>) {
        if let Some(logger) = &self.inner.options.logger {
            logger(kind, msg, data);
        }
    }

    fn reconnect(&self) {
        metrics::record_reconnect();
        debug!("Reconnecting");
        self.connect();
    }

    fn start_heartbeat(&self, state: &mut SocketState) {
        state.stop_heartbeat();
        if self.inner.options.transport.skip_heartbeat() {
            return;
        }
        let interval = self.inner.options.heartbeat_interval;
        let weak = Arc::downgrade(&self.inner);
        state.heartbeat = Some(self.inner.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(shared) => Socket::from_shared(shared).send_heartbeat(),
                    None => break,
                }
            }
        }));
    }

    fn send_heartbeat(&self) {
        let mut state = self.inner.state.lock();
        if !state.is_open() {
            return;
        }

        if state.pending_heartbeat_ref.take().is_some() {
            if let Some(conn) = state.conn.as_mut() {
                conn.state = ConnectionState::Closing;
                let _ = conn.tx.send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "heartbeat timeout".to_string(),
                    done: None,
                });
            }
            drop(state);
            warn!("Heartbeat timeout, closing connection");
            metrics::record_heartbeat_timeout();
            self.log(
                "transport",
                "heartbeat timeout. Attempting to re-establish connection",
                None,
            );
            return;
        }

        let msg_ref = state.next_ref(self.inner.options.ref_limit);
        state.pending_heartbeat_ref = Some(msg_ref.clone());
        match self.inner.options.codec.encode(&Message::heartbeat(msg_ref)) {
            Ok(frame) => state.send_frame(frame),
            Err(e) => warn!("Failed to encode heartbeat: {}", e),
        }
    }

    fn on_conn_open(&self, generation: u64) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match state.conn.as_mut() {
                Some(conn) if conn.generation == generation => {
                    conn.state = ConnectionState::Open;
                    conn.metrics = Some(ConnectionMetricsGuard::new());
                }
                _ => return,
            }
            let buffered = std::mem::take(&mut state.send_buffer);
            for frame in buffered {
                state.send_frame(frame);
            }
            self.start_heartbeat(&mut state);
            snapshot(&state.callbacks.open)
        };

        info!(endpoint = %self.inner.endpoint, "Connected");
        self.log("transport", "connected", None);
        self.inner.reconnect_timer.reset();
        for callback in callbacks {
            callback();
        }
        for channel in self.channels() {
            channel.on_socket_open();
        }
    }

    fn on_conn_close(&self, generation: u64, event: CloseEvent) {
        let (conn, callbacks) = {
            let mut state = self.inner.state.lock();
            if !state.is_current(generation) {
                return;
            }
            state.stop_heartbeat();
            (state.conn.take(), snapshot(&state.callbacks.close))
        };
        if let Some(conn) = conn {
            conn.task.abort();
        }

        info!(code = event.code, reason = %event.reason, "Connection closed");
        if self.has_logger() {
            self.log(
                "transport",
                "close",
                Some(&json!({"code": event.code, "reason": event.reason})),
            );
        }
        for channel in self.channels() {
            channel.on_socket_error();
        }
        self.inner.reconnect_timer.schedule_timeout();
        for callback in callbacks {
            callback(&event);
        }
    }

    fn on_conn_error(&self, generation: u64, error: SocketError) {
        let callbacks = {
            let state = self.inner.state.lock();
            if !state.is_current(generation) {
                return;
            }
            snapshot(&state.callbacks.error)
        };

        warn!("Transport error: {}", error);
        self.log("transport", &error.to_string(), None);
        for channel in self.channels() {
            channel.on_socket_error();
        }
        for callback in callbacks {
            callback(&error);
        }
    }

    fn on_conn_message(&self, generation: u64, frame: WireFrame) {
        if !self.inner.state.lock().is_current(generation) {
            return;
        }
        metrics::record_frame(frame.len(), "inbound");

        let message = match self.inner.options.codec.decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                metrics::record_decode_error();
                warn!("Dropping malformed frame: {}", e);
                let callbacks = snapshot(&self.inner.state.lock().callbacks.error);
                let error = SocketError::Protocol(e);
                for callback in callbacks {
                    callback(&error);
                }
                return;
            }
        };

        let callbacks = {
            let mut state = self.inner.state.lock();
            if message.msg_ref.is_some() && state.pending_heartbeat_ref == message.msg_ref {
                state.pending_heartbeat_ref = None;
            }
            snapshot(&state.callbacks.message)
        };

        trace!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            "Receive"
        );
        if self.has_logger() {
            self.log(
                "receive",
                &format!(
                    "{} {} {}",
                    message.topic,
                    message.event,
                    message.msg_ref.as_deref().unwrap_or("")
                ),
                message.payload.as_json(),
            );
        }

        for channel in self.channels() {
            if channel.is_member(&message) {
                channel.dispatch(&message.event, &message.payload, message.msg_ref.as_deref());
            }
        }
        for callback in callbacks {
            callback(&message);
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.connection_state())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

/// Drive one connection: handshake, then read until the transport closes.
async fn run_connection(
    socket: Weak<SocketShared>,
    generation: u64,
    transport: Arc<dyn Transport>,
    url: String,
    timeout: Duration,
    rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let Connection { sink, mut stream } = match transport.connect(&url, timeout).await {
        Ok(connection) => connection,
        Err(e) => {
            if let Some(shared) = socket.upgrade() {
                let client = Socket::from_shared(shared);
                let reason = e.to_string();
                client.on_conn_error(generation, SocketError::Transport(e));
                client.on_conn_close(generation, CloseEvent::abnormal(reason));
            }
            return;
        }
    };

    tokio::spawn(write_loop(socket.clone(), generation, sink, rx, timeout));

    match socket.upgrade() {
        Some(shared) => Socket::from_shared(shared).on_conn_open(generation),
        None => return,
    }

    loop {
        let received = stream.recv().await;
        let Some(shared) = socket.upgrade() else {
            break;
        };
        let client = Socket::from_shared(shared);
        match received {
            Ok(Some(frame)) => client.on_conn_message(generation, frame),
            Ok(None) => {
                client.on_conn_close(generation, stream.close_event());
                break;
            }
            Err(e) => {
                client.on_conn_error(generation, SocketError::Transport(e));
                client.on_conn_close(generation, stream.close_event());
                break;
            }
        }
    }
}

/// Forward queued frames to the transport until the queue closes or a close
/// is requested.
async fn write_loop(
    socket: Weak<SocketShared>,
    generation: u64,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    close_grace: Duration,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if let Err(e) = sink.send(frame).await {
                    warn!("Send failed: {}", e);
                }
            }
            Outbound::Close { code, reason, done } => {
                if let Err(e) = sink.close(code, &reason).await {
                    debug!("Close failed: {}", e);
                }
                match done {
                    Some(done) => {
                        let _ = done.send(());
                    }
                    None => {
                        // A dead peer never completes the close handshake
                        tokio::time::sleep(close_grace).await;
                        if let Some(shared) = socket.upgrade() {
                            Socket::from_shared(shared)
                                .on_conn_close(generation, CloseEvent::new(code, reason));
                        }
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        connected_socket, connected_socket_with, join_ok, last_sent, options, reply_to, sent_messages,
        settle, take_sent, ENDPOINT,
    };
    use crate::ChannelState;
    use std::sync::atomic::AtomicUsize;
    use strand_protocol::{LegacySerializer, Reply, HEARTBEAT_TOPIC};
    use strand_transport::MockTransport;

    #[test]
    fn test_new_requires_runtime() {
        let result = Socket::new(ENDPOINT, SocketOptions::default());
        assert!(matches!(result, Err(SocketError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_endpoint_url() {
        let mock = MockTransport::new();
        let mut params = Params::new();
        params.insert("token".to_string(), json!("abc"));
        params.insert("user".to_string(), json!({"id": 7}));

        let socket = Socket::new("ws://host/socket/", options(&mock).with_params(params)).unwrap();
        assert_eq!(
            socket.endpoint_url(),
            "ws://host/socket/websocket?token=abc&user%5Bid%5D=7&vsn=2.0.0"
        );

        let legacy = Socket::new("ws://host/socket", options(&mock).with_codec(LegacySerializer)).unwrap();
        assert_eq!(legacy.endpoint_url(), "ws://host/socket/websocket?vsn=1.0.0");
    }

    #[tokio::test]
    async fn test_make_ref_wraparound() {
        let mock = MockTransport::new();
        let socket = Socket::new(ENDPOINT, options(&mock).with_ref_limit(3)).unwrap();
        let refs: Vec<String> = (0..6).map(|_| socket.make_ref()).collect();
        assert_eq!(refs, ["1", "2", "3", "0", "1", "2"]);

        let unbounded = Socket::new(ENDPOINT, options(&mock)).unwrap();
        assert_eq!(unbounded.make_ref(), "1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_uses_merged_params() {
        let mock = MockTransport::new();
        let socket = Socket::new(ENDPOINT, options(&mock)).unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let opened2 = Arc::clone(&opened);
        socket.on_open(move || {
            opened2.fetch_add(1, Ordering::SeqCst);
        });

        let mut params = Params::new();
        params.insert("token".to_string(), json!("xyz"));
        socket.connect_with(params);
        assert_eq!(socket.connection_state(), ConnectionState::Connecting);
        settle().await;

        assert!(socket.is_connected());
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(
            mock.last_url().as_deref(),
            Some("ws://test.local/socket/websocket?token=xyz&vsn=2.0.0")
        );

        // Connecting again while open is a no-op
        socket.connect();
        settle().await;
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_frames_flush_in_order() {
        let mock = MockTransport::new();
        let socket = Socket::new(ENDPOINT, options(&mock)).unwrap();

        let first = Message::new("room:1", "a", json!({"n": 1})).with_ref("10");
        let second = Message::new("room:1", "b", json!({"n": 2})).with_ref("11");
        socket.push(first.clone()).unwrap();
        socket.push(second.clone()).unwrap();
        assert!(mock.sent().is_empty());

        socket.connect();
        settle().await;
        assert_eq!(sent_messages(&mock).await, vec![first, second]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_acknowledged_keeps_connection() {
        let (socket, mock) = connected_socket().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        let heartbeat = last_sent(&mock, "heartbeat").await;
        assert_eq!(heartbeat.topic, HEARTBEAT_TOPIC);
        mock.receive_message(&reply_to(&heartbeat, "ok", json!({})));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(mock.close_events().is_empty());
        assert!(socket.is_connected());
        let heartbeats = sent_messages(&mock)
            .await
            .into_iter()
            .filter(|m| m.event == "heartbeat")
            .count();
        assert_eq!(heartbeats, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_closes_once() {
        let (socket, mock) = connected_socket().await;
        let closes = Arc::new(Mutex::new(Vec::new()));
        let closes2 = Arc::clone(&closes);
        socket.on_close(move |event| closes2.lock().push(event.clone()));

        // First heartbeat goes unanswered
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(mock.close_events().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            mock.close_events(),
            vec![CloseEvent::new(1000, "heartbeat timeout")]
        );

        // The socket reconnects and the close is not repeated
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(mock.close_events().len(), 1);
        assert_eq!(closes.lock().len(), 1);
        assert_eq!(closes.lock()[0].reason, "heartbeat timeout");
        assert_eq!(mock.connect_count(), 2);
        assert!(socket.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_heartbeat_transport() {
        let mock = MockTransport::new().with_skip_heartbeat(true);
        let socket = Socket::new(ENDPOINT, options(&mock)).unwrap();
        socket.connect();
        settle().await;
        assert!(socket.is_connected());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(mock.sent().is_empty());
        assert!(mock.close_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_walks_backoff() {
        let (socket, mock) = connected_socket().await;

        mock.fail_next_connect("server down");
        mock.drop_connection();
        settle().await;
        assert!(!socket.is_connected());

        // First retry after 10ms fails
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.connect_count(), 2);
        assert!(!socket.is_connected());

        // Second retry waits 50ms
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert_eq!(mock.connect_count(), 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.connect_count(), 3);
        assert!(socket.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_does_not_reconnect() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        join_ok(&channel, &mock).await;

        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = Arc::clone(&closes);
        socket.on_close(move |event| {
            assert_eq!(event.code, 4000);
            closes2.fetch_add(1, Ordering::SeqCst);
        });

        socket.disconnect(Some(4000), Some("bye")).await;
        assert_eq!(mock.close_events(), vec![CloseEvent::new(4000, "bye")]);
        assert_eq!(socket.connection_state(), ConnectionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Joined);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_reports_protocol_error() {
        let (socket, mock) = connected_socket().await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors2 = Arc::clone(&errors);
        socket.on_error(move |error| {
            errors2
                .lock()
                .push(matches!(error, SocketError::Protocol(_)))
        });

        mock.receive(WireFrame::Text("{not json".to_string()));
        mock.receive(WireFrame::Text(r#"["1", "1", "room"]"#.to_string()));
        settle().await;

        assert_eq!(*errors.lock(), vec![true, true]);
        assert!(socket.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_topics_routed_independently() {
        let (socket, mock) = connected_socket().await;
        let first = socket.channel("room:1", json!({}));
        let second = socket.channel("room:1", json!({}));
        assert_ne!(first.id(), second.id());
        join_ok(&first, &mock).await;
        join_ok(&second, &mock).await;

        let hits = Arc::new(AtomicUsize::new(0));
        for channel in [&first, &second] {
            let hits = Arc::clone(&hits);
            channel.on("new_msg", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        socket.on_message(move |message| {
            if message.event == "new_msg" {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        });

        mock.receive_message(&Message::new("room:1", "new_msg", json!({"body": "hi"})));
        mock.receive_message(&Message::new("room:2", "new_msg", json!({"body": "other"})));
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(socket.channels().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binary_frames_routed_to_channels() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        join_ok(&channel, &mock).await;
        let images = Arc::new(Mutex::new(Vec::new()));
        let images2 = Arc::clone(&images);
        channel.on("image", move |payload| {
            images2
                .lock()
                .push(payload.as_binary().map(|data| data.to_vec()))
        });

        // Broadcast: [2, topic_len, event_len, topic, event, data]
        let mut broadcast = vec![2, 6, 5];
        broadcast.extend_from_slice(b"room:1image");
        broadcast.extend_from_slice(&[0xde, 0xad]);
        assert!(mock.receive(WireFrame::Binary(broadcast.into())));

        // Server push: [0, join_ref_len, topic_len, event_len, join_ref, topic, event, data]
        let join_ref = channel.join_ref().unwrap();
        let mut server_push = vec![0, join_ref.len() as u8, 6, 5];
        server_push.extend_from_slice(join_ref.as_bytes());
        server_push.extend_from_slice(b"room:1image");
        server_push.push(0xff);
        assert!(mock.receive(WireFrame::Binary(server_push.into())));
        settle().await;
        assert_eq!(
            *images.lock(),
            vec![Some(vec![0xde, 0xad]), Some(vec![0xff])]
        );

        // A binary push goes out as a binary frame and resolves on a binary reply
        let push = channel.push("upload", vec![1u8, 2, 3], None).unwrap();
        let replies = Arc::new(Mutex::new(Vec::new()));
        let replies2 = Arc::clone(&replies);
        push.receive("ok", move |payload| replies2.lock().push(payload.clone()));
        crate::testing::flush().await;
        match mock.sent().last() {
            Some(WireFrame::Binary(data)) => assert_eq!(data[0], 0),
            other => panic!("expected a binary frame, got {other:?}"),
        }

        let msg_ref = push.msg_ref().unwrap();
        mock.receive_message(&Message::reply(
            channel.join_ref(),
            msg_ref,
            "room:1",
            Reply::new("ok", vec![9u8, 9]),
        ));
        settle().await;
        assert_eq!(*replies.lock(), vec![Payload::Binary(vec![9u8, 9].into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_errors_channels_and_rejoins_on_reconnect() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({"token": "t"}));
        join_ok(&channel, &mock).await;
        let first_join_ref = channel.join_ref();
        take_sent(&mock).await;

        mock.drop_connection();
        settle().await;
        assert_eq!(channel.state(), ChannelState::Errored);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(socket.is_connected());
        assert_eq!(channel.state(), ChannelState::Joining);

        let joins: Vec<Message> = sent_messages(&mock)
            .await
            .into_iter()
            .filter(|m| m.event == "phx_join")
            .collect();
        assert_eq!(joins.len(), 1);
        assert_ne!(joins[0].join_ref, first_join_ref);
        assert_eq!(joins[0].payload, Payload::Json(json!({"token": "t"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_can_be_removed() {
        let (socket, mock) = connected_socket().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let r = socket.on_message(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        mock.receive_message(&Message::new("room:1", "a", json!({})));
        settle().await;
        socket.off(&[r]);
        mock.receive_message(&Message::new("room:1", "b", json!({})));
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logger_receives_diagnostics() {
        let logged = Arc::new(Mutex::new(Vec::new()));
        let logged2 = Arc::clone(&logged);
        let (socket, _mock) = connected_socket_with(move |options| {
            options.with_logger(move |kind, msg, _data| logged2.lock().push(format!("{kind}: {msg}")))
        })
        .await;

        assert!(socket.has_logger());
        socket
            .push(Message::new("room:1", "ping", json!({})).with_ref("5"))
            .unwrap();
        let logged = logged.lock();
        assert!(logged.iter().any(|line| line.starts_with("transport: connecting to")));
        assert!(logged.contains(&"push: room:1 ping (, 5)".to_string()));
    }
}
