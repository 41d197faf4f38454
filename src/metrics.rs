//! Metric helpers for `mqttot`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. Without the
//! `metrics` feature every helper is a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking live broker connections.
pub const CONNECTIONS_ACTIVE: &str = "mqttot_connections_active";
/// Name of the counter tracking MQTT packets.
pub const FRAMES_PROCESSED: &str = "mqttot_frames_processed_total";
/// Name of the counter tracking payloads no decoder could handle.
pub const DECODE_FAILURES: &str = "mqttot_decode_failures_total";
/// Name of the counter tracking applied delta operations.
pub const DELTA_OPERATIONS: &str = "mqttot_delta_operations_total";
/// Name of the counter tracking detected sequence gaps.
pub const GAPS_DETECTED: &str = "mqttot_gaps_detected_total";
/// Name of the counter tracking scheduled reconnect attempts.
pub const RECONNECT_ATTEMPTS: &str = "mqttot_reconnect_attempts_total";

/// Direction of frame processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Packets received from the broker.
    Inbound,
    /// Packets written to the broker.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed packet for the given direction.
pub fn inc_frames(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record a payload that failed to decode on `topic`.
pub fn inc_decode_failures(topic: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(DECODE_FAILURES, "topic" => topic).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = topic;
}

/// Record one applied delta item.
pub fn inc_delta_op(kind: &'static str, outcome: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(DELTA_OPERATIONS, "kind" => kind, "outcome" => outcome).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, outcome);
}

/// Record a detected gap in the given scope (`thread` or `stream`).
pub fn inc_gaps(scope: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(GAPS_DETECTED, "scope" => scope).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = scope;
}

/// Record a scheduled reconnect attempt.
pub fn inc_reconnects() {
    #[cfg(feature = "metrics")]
    counter!(RECONNECT_ATTEMPTS).increment(1);
}
