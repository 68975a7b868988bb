//! Shared fixtures for the unit tests.

use serde_json::Value;
use std::time::Duration;
use strand_protocol::{Message, Reply};
use strand_transport::MockTransport;

use crate::{Channel, Socket, SocketOptions};

pub(crate) const ENDPOINT: &str = "ws://test.local/socket";

/// Let spawned tasks run without moving the paused clock meaningfully.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Let spawned tasks drain their queues without advancing the clock.
///
/// Outbound frames reach the mock through the connection's writer task.
pub(crate) async fn flush() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn options(mock: &MockTransport) -> SocketOptions {
    SocketOptions::default().with_transport(mock.clone())
}

/// A socket whose mock connection is already open.
pub(crate) async fn connected_socket() -> (Socket, MockTransport) {
    connected_socket_with(|options| options).await
}

pub(crate) async fn connected_socket_with(
    configure: impl FnOnce(SocketOptions) -> SocketOptions,
) -> (Socket, MockTransport) {
    init_tracing();
    let mock = MockTransport::new();
    let socket = Socket::new(ENDPOINT, configure(options(&mock))).unwrap();
    socket.connect();
    settle().await;
    assert!(socket.is_connected());
    (socket, mock)
}

/// The server's reply to `request`.
pub(crate) fn reply_to(request: &Message, status: &str, response: Value) -> Message {
    Message::reply(
        request.join_ref.clone(),
        request.msg_ref.clone().unwrap(),
        request.topic.clone(),
        Reply::new(status, response),
    )
}

/// Join `channel` and acknowledge the join from the mock server.
pub(crate) async fn join_ok(channel: &Channel, mock: &MockTransport) {
    channel.join(None).unwrap();
    let join = last_sent(mock, "phx_join").await;
    mock.receive_message(&reply_to(&join, "ok", serde_json::json!({})));
    settle().await;
    assert!(channel.is_joined());
}

/// Sent messages, once the writer caught up.
pub(crate) async fn sent_messages(mock: &MockTransport) -> Vec<Message> {
    flush().await;
    mock.sent_messages()
}

/// Drain the sent messages, once the writer caught up.
pub(crate) async fn take_sent(mock: &MockTransport) -> Vec<Message> {
    flush().await;
    mock.take_sent()
}

/// The most recent sent message with `event`.
pub(crate) async fn last_sent(mock: &MockTransport, event: &str) -> Message {
    sent_messages(mock)
        .await
        .into_iter()
        .filter(|m| m.event == event)
        .last()
        .unwrap_or_else(|| panic!("no {event} frame sent"))
}

/// Events of the sent messages, in order.
pub(crate) async fn sent_events(mock: &MockTransport) -> Vec<String> {
    sent_messages(mock).await.into_iter().map(|m| m.event).collect()
}

/// Number of sent messages with `event`.
pub(crate) async fn count_sent(mock: &MockTransport, event: &str) -> usize {
    sent_events(mock).await.iter().filter(|e| *e == event).count()
}
