//! Outbound messages awaiting a reply.
//!
//! A [`Push`] is sent through its channel, gets a fresh reference on every
//! send and resolves exactly once: with the status of the server's reply, or
//! with `"timeout"` if none arrives in time. Callbacks are registered per
//! status with [`Push::receive`].

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use strand_protocol::{reply_event_name, status, Message, Payload, Reply};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::{BindingRef, Channel, ChannelShared};

/// Callback run with the response of a reply.
pub type ReplyCallback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// An outbound message awaiting a correlated reply.
#[derive(Clone)]
pub struct Push {
    inner: Arc<PushShared>,
}

struct PushShared {
    channel: Weak<ChannelShared>,
    event: String,
    state: Mutex<PushState>,
}

struct PushState {
    payload: Payload,
    timeout: Duration,
    msg_ref: Option<String>,
    ref_event: Option<String>,
    binding: Option<BindingRef>,
    received: Option<Reply>,
    sent: bool,
    hooks: Vec<(String, ReplyCallback)>,
    timeout_task: Option<JoinHandle<()>>,
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelShared>,
        event: impl Into<String>,
        payload: Payload,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PushShared {
                channel,
                event: event.into(),
                state: Mutex::new(PushState {
                    payload,
                    timeout,
                    msg_ref: None,
                    ref_event: None,
                    binding: None,
                    received: None,
                    sent: false,
                    hooks: Vec::new(),
                    timeout_task: None,
                }),
            }),
        }
    }

    fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(Channel::from_shared)
    }

    /// Event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Payload carried by the push.
    #[must_use]
    pub fn payload(&self) -> Payload {
        self.inner.state.lock().payload.clone()
    }

    /// Reference assigned by the latest send, if any.
    #[must_use]
    pub fn msg_ref(&self) -> Option<String> {
        self.inner.state.lock().msg_ref.clone()
    }

    /// Current reply timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().timeout
    }

    /// Whether the push has been handed to the socket.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.inner.state.lock().sent
    }

    /// The recorded reply, if the push has resolved.
    #[must_use]
    pub fn received(&self) -> Option<Reply> {
        self.inner.state.lock().received.clone()
    }

    /// Whether the push resolved with `status`.
    #[must_use]
    pub fn has_received(&self, status: &str) -> bool {
        self.inner
            .state
            .lock()
            .received
            .as_ref()
            .is_some_and(|reply| reply.status == status)
    }

    /// Send the push through its channel's socket.
    ///
    /// Does nothing once the push has timed out.
    pub fn send(&self) {
        if self.has_received(status::TIMEOUT) {
            return;
        }
        let Some(channel) = self.channel() else {
            debug!(event = %self.inner.event, "Dropping push for a dropped channel");
            return;
        };

        self.start_timeout_on(&channel);
        let (msg_ref, payload) = {
            let mut state = self.inner.state.lock();
            state.sent = true;
            (state.msg_ref.clone(), state.payload.clone())
        };

        let mut message = Message::new(channel.topic(), self.inner.event.clone(), payload)
            .with_join_ref(channel.join_ref());
        message.msg_ref = msg_ref;

        if let Err(e) = channel.socket_push(message) {
            warn!(topic = %channel.topic(), event = %self.inner.event, "Push not sent: {}", e);
        }
    }

    /// Register a callback for replies with `status`.
    ///
    /// If the push already resolved with `status`, the callback also runs
    /// immediately.
    pub fn receive(&self, status: &str, callback: impl Fn(&Payload) + Send + Sync + 'static) -> &Self {
        let callback: ReplyCallback = Arc::new(callback);
        let replay = {
            let mut state = self.inner.state.lock();
            state.hooks.push((status.to_string(), Arc::clone(&callback)));
            state
                .received
                .as_ref()
                .filter(|reply| reply.status == status)
                .map(|reply| reply.response.as_ref().clone())
        };
        if let Some(response) = replay {
            callback(&response);
        }
        self
    }

    /// Clear the reference and any recorded reply, then send again.
    pub fn resend(&self, timeout: Duration) {
        self.reset();
        self.inner.state.lock().timeout = timeout;
        self.send();
    }

    /// Cancel the pending timeout and forget the reference, reply and sent flag.
    pub fn reset(&self) {
        let (binding, task) = {
            let mut state = self.inner.state.lock();
            state.msg_ref = None;
            state.received = None;
            state.sent = false;
            (
                state.ref_event.take().zip(state.binding.take()),
                state.timeout_task.take(),
            )
        };
        if let Some(task) = task {
            task.abort();
        }
        self.unbind(binding);
    }

    /// Resolve the push locally, exactly as if the server had replied.
    pub fn trigger(&self, status: &str, response: impl Into<Payload>) {
        let ref_event = self.inner.state.lock().ref_event.clone();
        if let (Some(channel), Some(ref_event)) = (self.channel(), ref_event) {
            channel.trigger(&ref_event, Payload::Reply(Reply::new(status, response)));
        }
    }

    /// Assign a fresh reference, bind its reply event and arm the timeout.
    pub(crate) fn start_timeout(&self) {
        if let Some(channel) = self.channel() {
            self.start_timeout_on(&channel);
        }
    }

    /// Stop waiting for the reply without resolving.
    pub(crate) fn cancel_timeout(&self) {
        if let Some(task) = self.inner.state.lock().timeout_task.take() {
            task.abort();
        }
    }

    fn start_timeout_on(&self, channel: &Channel) {
        let (previous, task, timeout) = {
            let mut state = self.inner.state.lock();
            (
                state.ref_event.take().zip(state.binding.take()),
                state.timeout_task.take(),
                state.timeout,
            )
        };
        if let Some(task) = task {
            task.abort();
        }
        self.unbind(previous);

        let Some(msg_ref) = channel.make_ref() else {
            return;
        };
        let ref_event = reply_event_name(&msg_ref);

        let push = self.clone();
        let binding = channel.bind(&ref_event, Arc::new(move |payload: &Payload| push.handle_reply(payload)));

        let weak = Arc::downgrade(&self.inner);
        let task = channel.handle().spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Push { inner }.trigger(status::TIMEOUT, Payload::empty());
            }
        });

        let mut state = self.inner.state.lock();
        state.msg_ref = Some(msg_ref);
        state.ref_event = Some(ref_event);
        state.binding = Some(binding);
        state.timeout_task = Some(task);
    }

    fn handle_reply(&self, payload: &Payload) {
        let Some(reply) = payload.as_reply() else {
            debug!(event = %self.inner.event, "Ignoring reply event without a reply payload");
            return;
        };

        let (hooks, binding, task) = {
            let mut state = self.inner.state.lock();
            if state.received.is_some() {
                return;
            }
            state.received = Some(reply.clone());
            let hooks: Vec<ReplyCallback> = state
                .hooks
                .iter()
                .filter(|(status, _)| *status == reply.status)
                .map(|(_, callback)| Arc::clone(callback))
                .collect();
            (
                hooks,
                state.ref_event.clone().zip(state.binding.take()),
                state.timeout_task.take(),
            )
        };
        trace!(event = %self.inner.event, status = %reply.status, "Push resolved");

        if let Some(task) = task {
            task.abort();
        }
        self.unbind(binding);

        for hook in hooks {
            hook(reply.response.as_ref());
        }
    }

    fn unbind(&self, binding: Option<(String, BindingRef)>) {
        if let (Some((event, binding)), Some(channel)) = (binding, self.channel()) {
            channel.off(&event, Some(binding));
        }
    }
}

impl std::fmt::Debug for Push {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Push")
            .field("event", &self.inner.event)
            .field("msg_ref", &state.msg_ref)
            .field("sent", &state.sent)
            .field("received", &state.received.as_ref().map(|r| r.status.as_str()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_socket, take_sent};
    use crate::Socket;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strand_transport::MockTransport;

    async fn joined_channel() -> (Socket, Channel, MockTransport) {
        let (socket, mock) = connected_socket().await;
        let channel = socket.channel("room:lobby", json!({}));
        let join = channel.join(None).unwrap();
        join.trigger(status::OK, json!({}));
        assert!(channel.is_joined());
        take_sent(&mock).await;
        (socket, channel, mock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_resolves_matching_hooks() {
        let (_socket, channel, mock) = joined_channel().await;
        let ok = Arc::new(AtomicUsize::new(0));
        let err = Arc::new(AtomicUsize::new(0));

        let push = channel.push("new_msg", json!({"body": "hi"}), None).unwrap();
        let (ok2, err2) = (Arc::clone(&ok), Arc::clone(&err));
        push.receive("ok", move |_| {
            ok2.fetch_add(1, Ordering::SeqCst);
        })
        .receive("error", move |_| {
            err2.fetch_add(1, Ordering::SeqCst);
        });

        let sent = take_sent(&mock).await;
        assert_eq!(sent.len(), 1);
        let msg_ref = sent[0].msg_ref.clone().unwrap();
        assert_eq!(push.msg_ref().as_deref(), Some(msg_ref.as_str()));

        let reply = Message::reply(channel.join_ref(), msg_ref.clone(), "room:lobby", Reply::new("ok", json!({"id": 1})));
        mock.receive_message(&reply);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(err.load(Ordering::SeqCst), 0);

        // A second reply for the same reference is ignored
        mock.receive_message(&reply);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(*push.received().unwrap().response, Payload::Json(json!({"id": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_replays_recorded_status() {
        let (_socket, channel, _mock) = joined_channel().await;
        let push = channel.push("new_msg", json!({}), None).unwrap();
        push.trigger(status::OK, json!({"done": true}));
        assert!(push.has_received("ok"));

        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        push.receive("ok", move |payload| {
            *seen2.lock() = Some(payload.clone());
        });
        assert_eq!(*seen.lock(), Some(Payload::Json(json!({"done": true}))));

        // Other statuses do not replay
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = Arc::clone(&called);
        push.receive("error", move |_| {
            called2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once() {
        let (_socket, channel, mock) = joined_channel().await;
        let timeouts = Arc::new(AtomicUsize::new(0));
        let timeouts2 = Arc::clone(&timeouts);

        let push = channel
            .push("slow", json!({}), Some(Duration::from_secs(2)))
            .unwrap();
        push.receive("timeout", move |payload| {
            assert_eq!(payload, &Payload::empty());
            timeouts2.fetch_add(1, Ordering::SeqCst);
        });
        let msg_ref = push.msg_ref().unwrap();

        tokio::time::sleep(Duration::from_millis(2001)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert!(push.has_received(status::TIMEOUT));

        // Late reply after the timeout is ignored
        mock.receive_message(&Message::reply(
            channel.join_ref(),
            msg_ref,
            "room:lobby",
            Reply::new("ok", json!({})),
        ));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(push.has_received(status::TIMEOUT));

        // A timed-out push does not send again
        take_sent(&mock).await;
        push.send();
        assert!(take_sent(&mock).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_assigns_new_ref() {
        let (_socket, channel, mock) = joined_channel().await;
        let push = channel.push("new_msg", json!({}), None).unwrap();
        let first = push.msg_ref().unwrap();
        push.trigger(status::ERROR, json!({"reason": "nope"}));
        assert!(push.has_received("error"));

        push.resend(Duration::from_secs(5));
        let second = push.msg_ref().unwrap();
        assert_ne!(first, second);
        assert!(push.received().is_none());
        assert!(push.is_sent());
        assert_eq!(push.timeout(), Duration::from_secs(5));

        let sent = take_sent(&mock).await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].msg_ref.as_deref(), Some(second.as_str()));
    }
}
