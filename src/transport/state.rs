//! Transport lifecycle state machine.

use std::fmt;

/// Lifecycle of one broker connection.
///
/// ```text
/// Idle -> Connecting -> Connected -> Subscribing -> Active -> Draining | Closing -> Closed
/// ```
///
/// Every state after `Idle` may move back to `Connecting` when the
/// connection is re-established, and any state may move to `Closing` or
/// `Closed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Nothing attempted yet.
    #[default]
    Idle,
    /// Opening the socket and performing the handshake.
    Connecting,
    /// CONNACK received.
    Connected,
    /// Publishing subscription requests.
    Subscribing,
    /// Fully subscribed and receiving.
    Active,
    /// The broker closed the connection; tasks are winding down.
    Draining,
    /// A deliberate disconnect is in progress.
    Closing,
    /// All tasks have stopped.
    Closed,
}

impl TransportState {
    /// Whether the state machine permits moving to `next`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mqttot::transport::TransportState;
    ///
    /// assert!(TransportState::Idle.can_transition_to(TransportState::Connecting));
    /// assert!(!TransportState::Idle.can_transition_to(TransportState::Active));
    /// assert!(TransportState::Active.can_transition_to(TransportState::Connecting));
    /// ```
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransportState::{Active, Closed, Closing, Connected, Connecting, Draining, Idle, Subscribing};
        match (self, next) {
            (_, Connecting | Closing | Closed) => true,
            (Idle, _) => false,
            (Connecting, Connected)
            | (Connected | Active, Subscribing)
            | (Subscribing, Active | Subscribing)
            | (Connected | Subscribing | Active, Draining) => true,
            _ => false,
        }
    }

    /// Whether publishing is allowed.
    #[must_use]
    pub fn is_open(self) -> bool { matches!(self, Self::Connected | Self::Subscribing | Self::Active) }

    /// Lower-case name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::TransportState::{self, *};

    #[rstest]
    #[case(Idle, Connecting, true)]
    #[case(Idle, Connected, false)]
    #[case(Connecting, Connected, true)]
    #[case(Connecting, Active, false)]
    #[case(Connected, Subscribing, true)]
    #[case(Subscribing, Active, true)]
    #[case(Active, Subscribing, true)]
    #[case(Active, Draining, true)]
    #[case(Draining, Connecting, true)]
    #[case(Closed, Connecting, true)]
    #[case(Closed, Active, false)]
    #[case(Idle, Closed, true)]
    fn transitions(#[case] from: TransportState, #[case] to: TransportState, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn only_connected_states_are_open() {
        let open: Vec<_> = [Idle, Connecting, Connected, Subscribing, Active, Draining, Closing, Closed]
            .into_iter()
            .filter(|s| s.is_open())
            .collect();
        assert_eq!(open, [Connected, Subscribing, Active]);
    }
}
