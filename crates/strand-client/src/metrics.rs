//! Metrics instrumentation for the client.
//!
//! Uses the `metrics` crate facade. No exporter is installed here; embed the
//! client in an application that installs a recorder to collect these.

use metrics::{counter, gauge};
use tracing::debug;

/// Metric names.
pub mod names {
    pub const FRAMES_SENT: &str = "strand_frames_sent_total";
    pub const FRAMES_RECEIVED: &str = "strand_frames_received_total";
    pub const FRAMES_BYTES: &str = "strand_frames_bytes";
    pub const STALE_FRAMES_DROPPED: &str = "strand_stale_frames_dropped_total";
    pub const DECODE_ERRORS: &str = "strand_decode_errors_total";
    pub const HEARTBEAT_TIMEOUTS: &str = "strand_heartbeat_timeouts_total";
    pub const RECONNECTS: &str = "strand_reconnects_total";
    pub const CONNECTIONS_ACTIVE: &str = "strand_connections_active";
    pub const CHANNEL_JOINS: &str = "strand_channel_joins_total";
}

/// Describe all metrics to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::FRAMES_SENT, "Total number of frames sent");
    metrics::describe_counter!(names::FRAMES_RECEIVED, "Total number of frames received");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames sent and received");
    metrics::describe_counter!(
        names::STALE_FRAMES_DROPPED,
        "Lifecycle frames dropped because they carried a superseded join reference"
    );
    metrics::describe_counter!(names::DECODE_ERRORS, "Inbound frames that failed to decode");
    metrics::describe_counter!(
        names::HEARTBEAT_TIMEOUTS,
        "Connections force-closed after an unanswered heartbeat"
    );
    metrics::describe_counter!(names::RECONNECTS, "Reconnect attempts");
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Currently open connections");
    metrics::describe_counter!(names::CHANNEL_JOINS, "Channel join attempts");

    debug!("Metrics described");
}

/// Record a frame crossing the transport.
pub fn record_frame(bytes: usize, direction: &str) {
    let name = if direction == "inbound" {
        names::FRAMES_RECEIVED
    } else {
        names::FRAMES_SENT
    };
    counter!(name).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record a lifecycle frame dropped for a stale join reference.
pub fn record_stale_frame() {
    counter!(names::STALE_FRAMES_DROPPED).increment(1);
}

/// Record an inbound frame that failed to decode.
pub fn record_decode_error() {
    counter!(names::DECODE_ERRORS).increment(1);
}

/// Record a heartbeat timeout.
pub fn record_heartbeat_timeout() {
    counter!(names::HEARTBEAT_TIMEOUTS).increment(1);
}

/// Record a reconnect attempt.
pub fn record_reconnect() {
    counter!(names::RECONNECTS).increment(1);
}

/// Record a channel join attempt.
pub fn record_join() {
    counter!(names::CHANNEL_JOINS).increment(1);
}

/// Tracks one open connection in the active-connections gauge for as long as
/// it lives.
#[derive(Debug)]
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
