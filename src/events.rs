//! Public event surface.
//!
//! The client fans [`RealtimeEvent`]s out over a
//! [`tokio::sync::broadcast`] channel. Slow receivers lag and skip events
//! rather than stall the dispatcher.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{
    decode::JsonKind,
    delta::{MessageDelta, Operation, PresenceDelta, ThreadDelta, TypingDelta},
    error::RealtimeError,
    gap::Gap,
};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notifications emitted by [`RealtimeClient`](crate::client::RealtimeClient).
#[derive(Clone, Debug)]
pub enum RealtimeEvent {
    /// The handshake succeeded and subscriptions were requested.
    Connected {
        /// `true` when the delta stream resumed from a stored sequence id.
        resumed: bool,
    },
    /// The connection closed.
    Disconnected {
        /// `true` when requested through `disconnect()`.
        deliberate: bool,
        /// Failure that closed the connection, if any.
        reason: Option<String>,
    },
    /// A reconnect attempt has been scheduled.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// A message was added, changed or removed.
    Message {
        /// Applied operation.
        op: Operation,
        /// Delta as received.
        message: MessageDelta,
    },
    /// Thread metadata changed.
    ThreadUpdate {
        /// Applied operation.
        op: Operation,
        /// Delta as received.
        thread: ThreadDelta,
    },
    /// Typing indicator started or stopped.
    Typing(TypingDelta),
    /// A user's presence changed.
    Presence(PresenceDelta),
    /// A reaction was attached to a message.
    Reaction {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Reacted item.
        item_id: String,
        /// Reacting user, when known.
        sender_id: Option<String>,
        /// Reaction value.
        reaction: String,
    },
    /// Missed deltas were detected.
    Gap(Gap),
    /// A backfill recovered a gap.
    GapFilled {
        /// The gap that was filled.
        gap: Gap,
        /// Recovered messages, or threads for a stream gap.
        recovered: usize,
    },
    /// A failure the application should see.
    Error(Arc<RealtimeError>),
    /// A non-fatal problem: undecodable frame, failed backfill, failed
    /// subscription.
    Warning {
        /// Where the problem occurred.
        context: &'static str,
        /// Human-readable description.
        message: String,
    },
    /// A JSON record with no typed event.
    Json {
        /// Topic the record arrived on.
        topic: String,
        /// Record family.
        kind: JsonKind,
        /// Document.
        value: Value,
    },
}

impl RealtimeEvent {
    /// Short event name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Message { .. } => "message",
            Self::ThreadUpdate { .. } => "thread_update",
            Self::Typing(_) => "typing",
            Self::Presence(_) => "presence",
            Self::Reaction { .. } => "reaction",
            Self::Gap(_) => "gap",
            Self::GapFilled { .. } => "gap_filled",
            Self::Error(_) => "error",
            Self::Warning { .. } => "warning",
            Self::Json { .. } => "json",
        }
    }

    pub(crate) fn warning(context: &'static str, message: impl ToString) -> Self {
        Self::Warning {
            context,
            message: message.to_string(),
        }
    }
}

/// Sending half shared by the client and its dispatcher.
#[derive(Clone, Debug)]
pub(crate) struct EventSink(broadcast::Sender<RealtimeEvent>);

impl EventSink {
    pub(crate) fn new(capacity: usize) -> Self { Self(broadcast::channel(capacity.max(1)).0) }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> { self.0.subscribe() }

    /// Deliver `event` to current receivers. Having none is not an error.
    pub(crate) fn emit(&self, event: RealtimeEvent) {
        trace!(event = event.name(), receivers = self.0.receiver_count(), "emit");
        let _ = self.0.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_every_receiver() {
        let sink = EventSink::new(4);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        sink.emit(RealtimeEvent::Connected { resumed: true });

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.expect("event");
            assert!(matches!(event, RealtimeEvent::Connected { resumed: true }));
        }
    }

    #[test]
    fn emitting_without_receivers_is_fine() {
        let sink = EventSink::new(0);
        sink.emit(RealtimeEvent::warning("test", "nobody listening"));
    }
}
