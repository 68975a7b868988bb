//! Channel abstraction for Strand.
//!
//! A channel is a named subscription multiplexed over the socket's single
//! connection. It owns its join push, a buffer of pushes issued before the
//! join completed, an event-binding table and a rejoin timer.
//!
//! ```text
//!            join()            join ok
//!  Closed ─────────▶ Joining ──────────▶ Joined
//!                      ▲  │ timeout/       │ phx_error
//!              rejoin  │  │ error          ▼
//!                      └─ Errored ◀────────┘
//!
//!  Joining/Joined/Errored ── leave() ──▶ Leaving ── ok/timeout ──▶ Closed
//! ```

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strand_protocol::{events, reply_event_name, status, Message, Payload};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::error::ChannelError;
use crate::metrics;
use crate::push::Push;
use crate::socket::{Socket, SocketShared};
use crate::timer::Timer;

/// Identity of a channel within its socket. Topics are not unique.
pub type ChannelId = u64;

/// Callback bound to a channel event.
pub type EventCallback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Handle returned by [`Channel::on`], used to remove that one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingRef(u64);

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not joined, or left.
    Closed,
    /// Join failed or the connection dropped; a rejoin is scheduled.
    Errored,
    /// Joined and able to push.
    Joined,
    /// Join sent, awaiting the reply.
    Joining,
    /// Leave sent, awaiting the reply.
    Leaving,
}

impl ChannelState {
    /// State name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joined => "joined",
            ChannelState::Joining => "joining",
            ChannelState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription to one topic.
///
/// Cheap to clone; all clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelShared>,
}

pub(crate) struct ChannelShared {
    id: ChannelId,
    topic: String,
    socket: Weak<SocketShared>,
    handle: Handle,
    join_push: Push,
    rejoin_timer: Timer,
    state: Mutex<ChannelInner>,
    dropped_frames: AtomicU64,
}

struct ChannelInner {
    state: ChannelState,
    bindings: HashMap<String, Vec<(BindingRef, EventCallback)>>,
    next_binding: u64,
    push_buffer: Vec<Push>,
    flushing: bool,
    joined_once: bool,
    timeout: Duration,
}

fn upgrade(weak: &Weak<ChannelShared>) -> Option<Channel> {
    weak.upgrade().map(Channel::from_shared)
}

impl Channel {
    pub(crate) fn new(socket: &Arc<SocketShared>, id: ChannelId, topic: String, params: Payload) -> Self {
        let handle = socket.handle.clone();
        let timeout = socket.options.timeout;
        let backoff = Arc::clone(&socket.options.reconnect_after);

        let inner = Arc::new_cyclic(|weak: &Weak<ChannelShared>| {
            let rejoin = weak.clone();
            ChannelShared {
                id,
                topic,
                socket: Arc::downgrade(socket),
                handle: handle.clone(),
                join_push: Push::new(weak.clone(), events::JOIN, params, timeout),
                rejoin_timer: Timer::new(handle, backoff, move || {
                    if let Some(channel) = upgrade(&rejoin) {
                        channel.on_rejoin_timer();
                    }
                }),
                state: Mutex::new(ChannelInner {
                    state: ChannelState::Closed,
                    bindings: HashMap::new(),
                    next_binding: 0,
                    push_buffer: Vec::new(),
                    flushing: false,
                    joined_once: false,
                    timeout,
                }),
                dropped_frames: AtomicU64::new(0),
            }
        });

        let channel = Channel { inner };
        channel.install_join_hooks();
        channel
    }

    pub(crate) fn from_shared(inner: Arc<ChannelShared>) -> Self {
        Self { inner }
    }

    fn install_join_hooks(&self) {
        let weak = Arc::downgrade(&self.inner);
        let (on_ok, on_error, on_timeout) = (weak.clone(), weak.clone(), weak);

        self.inner
            .join_push
            .receive(status::OK, move |_| {
                if let Some(channel) = upgrade(&on_ok) {
                    channel.on_join_ok();
                }
            })
            .receive(status::ERROR, move |response| {
                if let Some(channel) = upgrade(&on_error) {
                    channel.on_join_error(response);
                }
            })
            .receive(status::TIMEOUT, move |_| {
                if let Some(channel) = upgrade(&on_timeout) {
                    channel.on_join_timeout();
                }
            });
    }

    /// Channel identity within its socket.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.state.lock().state
    }

    /// Reference of the current join attempt.
    #[must_use]
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_push.msg_ref()
    }

    /// The join push.
    #[must_use]
    pub fn join_push(&self) -> &Push {
        &self.inner.join_push
    }

    /// Default timeout for pushes on this channel.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().timeout
    }

    /// Lifecycle frames dropped because they carried a superseded join reference.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }

    /// Whether the channel is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Whether the channel is errored.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    /// Whether the channel is joined.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Whether the channel is joining.
    #[must_use]
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    /// Whether the channel is leaving.
    #[must_use]
    pub fn is_leaving(&self) -> bool {
        self.state() == ChannelState::Leaving
    }

    /// The socket this channel belongs to.
    #[must_use]
    pub fn socket(&self) -> Option<Socket> {
        self.inner.socket.upgrade().map(Socket::from_shared)
    }

    /// Whether a push would be sent right away.
    #[must_use]
    pub fn can_push(&self) -> bool {
        self.socket_connected() && self.is_joined()
    }

    /// Join the channel.
    ///
    /// Returns the join push so callers can register `receive` hooks.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyJoined`] on a second call and
    /// [`ChannelError::Detached`] once the socket is gone.
    pub fn join(&self, timeout: Option<Duration>) -> Result<Push, ChannelError> {
        if self.inner.socket.upgrade().is_none() {
            return Err(ChannelError::Detached);
        }
        {
            let mut inner = self.inner.state.lock();
            if inner.joined_once {
                return Err(ChannelError::AlreadyJoined(self.inner.topic.clone()));
            }
            inner.joined_once = true;
        }
        self.rejoin(timeout);
        Ok(self.inner.join_push.clone())
    }

    /// Push an event to the channel.
    ///
    /// Sent immediately when joined and connected, otherwise buffered until
    /// the join succeeds. A buffered push still times out.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotJoined`] before `join` and
    /// [`ChannelError::Closed`] once the channel is leaving or closed.
    pub fn push(
        &self,
        event: &str,
        payload: impl Into<Payload>,
        timeout: Option<Duration>,
    ) -> Result<Push, ChannelError> {
        let connected = self.socket_connected();
        let push = {
            let inner = self.inner.state.lock();
            if !inner.joined_once {
                return Err(ChannelError::NotJoined(self.inner.topic.clone()));
            }
            if matches!(inner.state, ChannelState::Leaving | ChannelState::Closed) {
                return Err(ChannelError::Closed(self.inner.topic.clone()));
            }
            let push = Push::new(
                Arc::downgrade(&self.inner),
                event,
                payload.into(),
                timeout.unwrap_or(inner.timeout),
            );
            if connected && inner.sends_directly() {
                drop(inner);
                push.send();
                return Ok(push);
            }
            push
        };

        // Armed before the flush can see it, so a flushed push keeps its ref
        push.start_timeout();
        let mut inner = self.inner.state.lock();
        if connected && inner.sends_directly() {
            drop(inner);
            push.send();
        } else {
            inner.push_buffer.push(push.clone());
            trace!(topic = %self.inner.topic, event = %event, "Push buffered");
        }
        Ok(push)
    }

    /// Leave the channel.
    ///
    /// The channel closes once the server acknowledges the leave or the leave
    /// times out. When the socket is not connected, it closes immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] when the channel is already leaving
    /// or closed, including a channel that was never joined.
    pub fn leave(&self, timeout: Option<Duration>) -> Result<Push, ChannelError> {
        let connected = self.socket_connected();
        let timeout = {
            let mut inner = self.inner.state.lock();
            if matches!(inner.state, ChannelState::Leaving | ChannelState::Closed) {
                return Err(ChannelError::Closed(self.inner.topic.clone()));
            }
            inner.state = ChannelState::Leaving;
            timeout.unwrap_or(inner.timeout)
        };
        self.inner.rejoin_timer.reset();
        self.inner.join_push.cancel_timeout();

        let weak = Arc::downgrade(&self.inner);
        let on_close = move |_: &Payload| {
            if let Some(channel) = upgrade(&weak) {
                channel.trigger(events::CLOSE, Payload::Json(Value::String("leave".to_string())));
            }
        };

        let leave = Push::new(Arc::downgrade(&self.inner), events::LEAVE, Payload::empty(), timeout);
        leave
            .receive(status::OK, on_close.clone())
            .receive(status::TIMEOUT, on_close);

        if connected {
            leave.send();
        } else {
            leave.start_timeout();
            leave.trigger(status::OK, Payload::empty());
        }
        Ok(leave)
    }

    /// Bind a callback to an event.
    pub fn on(&self, event: &str, callback: impl Fn(&Payload) + Send + Sync + 'static) -> BindingRef {
        self.bind(event, Arc::new(callback))
    }

    /// Remove one binding, or every binding for `event` when `binding` is `None`.
    pub fn off(&self, event: &str, binding: Option<BindingRef>) {
        let mut inner = self.inner.state.lock();
        match binding {
            Some(binding) => {
                if let Some(list) = inner.bindings.get_mut(event) {
                    list.retain(|(r, _)| *r != binding);
                    if list.is_empty() {
                        inner.bindings.remove(event);
                    }
                }
            }
            None => {
                inner.bindings.remove(event);
            }
        }
    }

    /// Bind a callback to the channel closing.
    pub fn on_close(&self, callback: impl Fn(&Payload) + Send + Sync + 'static) -> BindingRef {
        self.on(events::CLOSE, callback)
    }

    /// Bind a callback to channel errors.
    pub fn on_error(&self, callback: impl Fn(&Payload) + Send + Sync + 'static) -> BindingRef {
        self.on(events::ERROR, callback)
    }

    /// Dispatch an event to this channel as if it had arrived from the server.
    pub fn trigger(&self, event: &str, payload: Payload) {
        self.dispatch(event, &payload, None);
    }

    /// Whether an inbound frame belongs to this channel.
    ///
    /// Lifecycle frames from a superseded join attempt are dropped and counted.
    #[must_use]
    pub fn is_member(&self, message: &Message) -> bool {
        if message.topic != self.inner.topic {
            return false;
        }
        if let Some(join_ref) = &message.join_ref {
            if message.is_lifecycle() && Some(join_ref) != self.join_ref().as_ref() {
                self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
                metrics::record_stale_frame();
                debug!(
                    topic = %message.topic,
                    event = %message.event,
                    join_ref = %join_ref,
                    "Dropping outdated message"
                );
                if let Some(socket) = self.socket() {
                    if socket.has_logger() {
                        socket.log(
                            "channel",
                            "dropping outdated message",
                            Some(&serde_json::json!({
                                "topic": message.topic,
                                "event": message.event,
                                "join_ref": join_ref,
                            })),
                        );
                    }
                }
                return false;
            }
        }
        true
    }

    pub(crate) fn dispatch(&self, event: &str, payload: &Payload, msg_ref: Option<&str>) {
        match event {
            events::CLOSE => self.handle_close(),
            events::ERROR => self.handle_error(payload),
            events::REPLY => {
                if let Some(msg_ref) = msg_ref {
                    self.dispatch(&reply_event_name(msg_ref), payload, None);
                }
            }
            _ => {}
        }

        let callbacks: Vec<EventCallback> = self
            .inner
            .state
            .lock()
            .bindings
            .get(event)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(payload);
        }
    }

    pub(crate) fn bind(&self, event: &str, callback: EventCallback) -> BindingRef {
        let mut inner = self.inner.state.lock();
        inner.next_binding += 1;
        let binding = BindingRef(inner.next_binding);
        inner
            .bindings
            .entry(event.to_string())
            .or_default()
            .push((binding, callback));
        binding
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub(crate) fn make_ref(&self) -> Option<String> {
        self.socket().map(|socket| socket.make_ref())
    }

    pub(crate) fn socket_push(&self, message: Message) -> Result<(), ChannelError> {
        let socket = self.socket().ok_or(ChannelError::Detached)?;
        socket.push(message)?;
        Ok(())
    }

    fn socket_connected(&self) -> bool {
        self.socket().is_some_and(|socket| socket.is_connected())
    }

    /// Rejoin after the socket reopened.
    pub(crate) fn on_socket_open(&self) {
        self.inner.rejoin_timer.reset();
        if self.is_errored() {
            self.rejoin(None);
        }
    }

    /// Surface a transport failure as a channel error.
    pub(crate) fn on_socket_error(&self) {
        if matches!(
            self.state(),
            ChannelState::Errored | ChannelState::Leaving | ChannelState::Closed
        ) {
            return;
        }
        self.trigger(events::ERROR, Payload::empty());
    }

    fn rejoin(&self, timeout: Option<Duration>) {
        let timeout = {
            let mut inner = self.inner.state.lock();
            if inner.state == ChannelState::Leaving {
                return;
            }
            if let Some(timeout) = timeout {
                inner.timeout = timeout;
            }
            inner.state = ChannelState::Joining;
            inner.timeout
        };
        debug!(topic = %self.inner.topic, "Joining");
        metrics::record_join();
        self.inner.join_push.resend(timeout);
    }

    fn on_rejoin_timer(&self) {
        if self.socket_connected() {
            self.rejoin(None);
        } else {
            self.inner.rejoin_timer.schedule_timeout();
        }
    }

    fn on_join_ok(&self) {
        {
            let mut inner = self.inner.state.lock();
            // A join acknowledged after leave() must not revive the channel
            if matches!(inner.state, ChannelState::Leaving | ChannelState::Closed) {
                return;
            }
            inner.state = ChannelState::Joined;
            if inner.flushing {
                return;
            }
            inner.flushing = true;
        }
        self.inner.rejoin_timer.reset();
        debug!(topic = %self.inner.topic, "Joined");
        self.flush_buffer();
    }

    /// Send buffered pushes in order. New pushes keep buffering until the
    /// buffer drains, so none overtakes an older one.
    fn flush_buffer(&self) {
        loop {
            let batch = {
                let mut inner = self.inner.state.lock();
                if inner.push_buffer.is_empty() || inner.state != ChannelState::Joined {
                    inner.flushing = false;
                    return;
                }
                std::mem::take(&mut inner.push_buffer)
            };
            trace!(topic = %self.inner.topic, count = batch.len(), "Flushing buffered pushes");
            for push in batch {
                push.send();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.inner.state.lock().push_buffer.len()
    }

    fn on_join_error(&self, response: &Payload) {
        self.inner.state.lock().state = ChannelState::Errored;
        warn!(topic = %self.inner.topic, response = ?response, "Join rejected");
        self.inner.rejoin_timer.schedule_timeout();
    }

    fn on_join_timeout(&self) {
        let timeout = self.timeout();
        warn!(
            topic = %self.inner.topic,
            join_ref = ?self.join_ref(),
            timeout_ms = timeout.as_millis() as u64,
            "Join timed out"
        );

        let leave = Push::new(Arc::downgrade(&self.inner), events::LEAVE, Payload::empty(), timeout);
        leave.send();

        self.inner.state.lock().state = ChannelState::Errored;
        self.inner.join_push.reset();
        self.inner.rejoin_timer.schedule_timeout();
    }

    fn handle_close(&self) {
        self.inner.rejoin_timer.reset();
        debug!(topic = %self.inner.topic, join_ref = ?self.join_ref(), "Channel closed");
        self.inner.state.lock().state = ChannelState::Closed;
        if let Some(socket) = self.socket() {
            socket.remove(self.inner.id);
        }
    }

    fn handle_error(&self, payload: &Payload) {
        let was_joining = {
            let mut inner = self.inner.state.lock();
            match inner.state {
                ChannelState::Leaving | ChannelState::Closed => return,
                state => {
                    inner.state = ChannelState::Errored;
                    state == ChannelState::Joining
                }
            }
        };
        debug!(topic = %self.inner.topic, payload = ?payload, "Channel errored");
        if was_joining {
            self.inner.join_push.reset();
        }
        self.inner.rejoin_timer.schedule_timeout();
    }
}

impl ChannelInner {
    fn sends_directly(&self) -> bool {
        self.state == ChannelState::Joined && !self.flushing
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .field("join_ref", &self.join_ref())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        connected_socket, count_sent, join_ok, last_sent, options, reply_to, sent_events, sent_messages,
        settle, ENDPOINT,
    };
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use strand_transport::MockTransport;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Payload) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        (count, move |_: &Payload| {
            count2.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_twice_fails() {
        let (socket, _mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        assert_eq!(channel.state(), ChannelState::Closed);

        channel.join(None).unwrap();
        assert!(channel.is_joining());
        assert!(matches!(
            channel.join(None),
            Err(ChannelError::AlreadyJoined(topic)) if topic == "room:1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_before_join_fails() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        assert!(matches!(
            channel.push("new_msg", json!({}), None),
            Err(ChannelError::NotJoined(_))
        ));
        assert!(mock.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_frame_carries_params_and_join_ref() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({"token": "abc"}));
        channel.join(None).unwrap();

        let join = last_sent(&mock, events::JOIN).await;
        assert_eq!(join.topic, "room:1");
        assert_eq!(join.payload, Payload::Json(json!({"token": "abc"})));
        assert!(join.msg_ref.is_some());
        assert_eq!(join.join_ref, join.msg_ref);
        assert_eq!(channel.join_ref(), join.msg_ref);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_pushes_flush_in_order_after_join() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        let join = last_sent(&mock, events::JOIN).await;

        for n in 1..=3 {
            channel.push("new_msg", json!({"n": n}), None).unwrap();
        }
        assert_eq!(sent_events(&mock).await, vec![events::JOIN]);

        mock.receive_message(&reply_to(&join, "ok", json!({})));
        settle().await;
        assert!(channel.is_joined());

        let pushed: Vec<Payload> = sent_messages(&mock)
            .await
            .into_iter()
            .filter(|m| m.event == "new_msg")
            .map(|m| {
                assert_eq!(m.join_ref, join.msg_ref);
                m.payload
            })
            .collect();
        assert_eq!(
            pushed,
            vec![
                Payload::Json(json!({"n": 1})),
                Payload::Json(json!({"n": 2})),
                Payload::Json(json!({"n": 3})),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_while_disconnected_waits_for_socket() {
        let mock = MockTransport::new();
        let socket = Socket::new(ENDPOINT, options(&mock)).unwrap();
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        assert!(channel.is_joining());
        assert!(!channel.can_push());

        socket.connect();
        settle().await;
        assert_eq!(count_sent(&mock, events::JOIN).await, 1);

        let join = last_sent(&mock, events::JOIN).await;
        mock.receive_message(&reply_to(&join, "ok", json!({})));
        settle().await;
        assert!(channel.is_joined());
        assert!(channel.can_push());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_leaves_then_rejoins() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        let (timeouts, on_timeout) = counter();
        channel
            .join(Some(Duration::from_secs(1)))
            .unwrap()
            .receive(status::TIMEOUT, on_timeout);
        let first_join = last_sent(&mock, events::JOIN).await;

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(channel.state(), ChannelState::Errored);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(count_sent(&mock, events::JOIN).await, 1);
        assert_eq!(count_sent(&mock, events::LEAVE).await, 1);
        assert_eq!(last_sent(&mock, events::LEAVE).await.join_ref, first_join.msg_ref);

        // The rejoin waits for the first backoff step
        tokio::time::sleep(Duration::from_millis(7)).await;
        assert_eq!(count_sent(&mock, events::JOIN).await, 1);

        tokio::time::sleep(Duration::from_millis(4)).await;
        assert_eq!(channel.state(), ChannelState::Joining);
        assert_eq!(count_sent(&mock, events::JOIN).await, 2);
        assert_ne!(last_sent(&mock, events::JOIN).await.msg_ref, first_join.msg_ref);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_error_schedules_rejoin() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        let join = last_sent(&mock, events::JOIN).await;

        mock.receive_message(&reply_to(&join, "error", json!({"reason": "unauthorized"})));
        settle().await;
        assert!(channel.is_errored());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.is_joining());
        assert_eq!(count_sent(&mock, events::JOIN).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lifecycle_frames_dropped() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        join_ok(&channel, &mock).await;
        let (errors, on_error) = counter();
        channel.on_error(on_error);
        let (messages, on_message) = counter();
        channel.on("new_msg", on_message);

        let stale = Some("stale".to_string());
        mock.receive_message(&Message::new("room:1", events::ERROR, json!({})).with_join_ref(stale.clone()));
        mock.receive_message(&Message::new("room:1", events::CLOSE, json!({})).with_join_ref(stale.clone()));
        mock.receive_message(&Message::new("room:1", "new_msg", json!({})).with_join_ref(stale));
        settle().await;

        assert!(channel.is_joined());
        assert_eq!(channel.dropped_frames(), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_marks_channel_errored() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        join_ok(&channel, &mock).await;
        let (errors, on_error) = counter();
        channel.on_error(on_error);

        mock.receive_message(&Message::new("room:1", events::ERROR, json!({})).with_join_ref(channel.join_ref()));
        settle().await;
        assert!(channel.is_errored());
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // Buffered while errored, flushed after the rejoin succeeds
        channel.push("new_msg", json!({}), None).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let join = last_sent(&mock, events::JOIN).await;
        assert_eq!(count_sent(&mock, "new_msg").await, 0);
        mock.receive_message(&reply_to(&join, "ok", json!({})));
        settle().await;
        assert_eq!(count_sent(&mock, "new_msg").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_closes_after_reply() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        join_ok(&channel, &mock).await;
        let (closes, on_close) = counter();
        channel.on_close(on_close);

        let leave = channel.leave(None).unwrap();
        assert!(channel.is_leaving());
        assert!(matches!(
            channel.push("new_msg", json!({}), None),
            Err(ChannelError::Closed(_))
        ));

        let frame = last_sent(&mock, events::LEAVE).await;
        assert_eq!(frame.msg_ref, leave.msg_ref());
        mock.receive_message(&reply_to(&frame, "ok", json!({})));
        settle().await;

        assert!(channel.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(socket.channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_times_out_to_closed() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        join_ok(&channel, &mock).await;

        channel.leave(Some(Duration::from_millis(500))).unwrap();
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(channel.is_leaving());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(channel.is_closed());
        assert!(socket.channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_while_disconnected_closes_immediately() {
        let mock = MockTransport::new();
        let socket = Socket::new(ENDPOINT, options(&mock)).unwrap();
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();

        let leave = channel.leave(None).unwrap();
        assert!(leave.has_received(status::OK));
        assert!(channel.is_closed());
        assert!(socket.channels().is_empty());

        // A late join acknowledgement does not revive the channel
        channel.join_push().trigger(status::OK, json!({}));
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_and_off() {
        let (socket, _mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        let first_ref = channel.on("ping", on_first);
        channel.on("ping", on_second);

        channel.trigger("ping", Payload::empty());
        channel.off("ping", Some(first_ref));
        channel.trigger("ping", Payload::empty());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);

        channel.off("ping", None);
        channel.trigger("ping", Payload::empty());
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_fails_once_socket_dropped() {
        let (socket, _mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        drop(socket);
        assert!(channel.socket().is_none());
        assert!(matches!(channel.join(None), Err(ChannelError::Detached)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_push_times_out_before_join() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        let join = last_sent(&mock, events::JOIN).await;

        let (timeouts, on_timeout) = counter();
        let push = channel
            .push("new_msg", json!({"body": "late"}), Some(Duration::from_millis(100)))
            .unwrap();
        push.receive(status::TIMEOUT, on_timeout);
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert!(push.has_received(status::TIMEOUT));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert!(channel.is_joining());

        // The join completes later; the expired push is dropped, not sent
        mock.receive_message(&reply_to(&join, "ok", json!({})));
        settle().await;
        assert!(channel.is_joined());
        assert_eq!(channel.buffered_len(), 0);
        assert_eq!(count_sent(&mock, "new_msg").await, 0);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_while_joining() {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:1", json!({}));
        channel.join(None).unwrap();
        let join = last_sent(&mock, events::JOIN).await;
        let (closes, on_close) = counter();
        channel.on_close(on_close);

        channel.leave(None).unwrap();
        assert!(channel.is_leaving());
        let leave = last_sent(&mock, events::LEAVE).await;
        assert_eq!(leave.join_ref, join.msg_ref);

        // The join reply arrives after the leave was sent
        mock.receive_message(&reply_to(&join, "ok", json!({})));
        settle().await;
        assert!(channel.is_leaving());

        mock.receive_message(&reply_to(&leave, "ok", json!({})));
        settle().await;
        assert!(channel.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // No rejoin and no join timeout follow
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(count_sent(&mock, events::JOIN).await, 1);
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_and_push_rejected_once_left() {
        let (socket, mock) = connected_socket().await;

        let unjoined = socket.channel("room:0", json!({}));
        assert!(matches!(unjoined.leave(None), Err(ChannelError::Closed(_))));

        let channel = socket.channel("room:1", json!({}));
        join_ok(&channel, &mock).await;
        channel.leave(None).unwrap();
        assert!(matches!(channel.leave(None), Err(ChannelError::Closed(_))));
        assert!(channel.is_leaving());

        let leave = last_sent(&mock, events::LEAVE).await;
        mock.receive_message(&reply_to(&leave, "ok", json!({})));
        settle().await;
        assert!(channel.is_closed());

        assert!(matches!(
            channel.leave(None),
            Err(ChannelError::Closed(topic)) if topic == "room:1"
        ));
        assert!(matches!(
            channel.push("new_msg", json!({}), None),
            Err(ChannelError::Closed(_))
        ));
        assert!(channel.is_closed());
        assert_eq!(count_sent(&mock, events::LEAVE).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pushes_racing_join_reply_stay_ordered() {
        const PUSHES: usize = 50;
        crate::testing::init_tracing();
        let mock = MockTransport::new();
        let socket = Socket::new(ENDPOINT, options(&mock)).unwrap();
        socket.connect();
        wait_until(|| socket.is_connected()).await;

        for round in 0..20 {
            let topic = format!("room:{round}");
            let channel = socket.channel(&topic, json!({}));
            channel.join(None).unwrap();
            wait_until(|| {
                mock.sent_messages()
                    .iter()
                    .any(|m| m.topic == topic && m.event == events::JOIN)
            })
            .await;
            let join = last_sent(&mock, events::JOIN).await;

            let pusher = {
                let channel = channel.clone();
                tokio::task::spawn_blocking(move || {
                    for n in 0..PUSHES {
                        channel.push("new_msg", json!({"n": n}), None).unwrap();
                        if n % 8 == 0 {
                            std::thread::yield_now();
                        }
                    }
                })
            };
            mock.receive_message(&reply_to(&join, "ok", json!({})));
            pusher.await.unwrap();

            let pushed = || -> Vec<Payload> {
                mock.sent_messages()
                    .into_iter()
                    .filter(|m| m.topic == topic && m.event == "new_msg")
                    .map(|m| m.payload)
                    .collect()
            };
            wait_until(|| pushed().len() == PUSHES).await;
            assert!(channel.is_joined());
            assert_eq!(channel.buffered_len(), 0);
            let expected: Vec<Payload> = (0..PUSHES).map(|n| Payload::Json(json!({"n": n}))).collect();
            assert_eq!(pushed(), expected, "round {round}");
        }
    }
}
