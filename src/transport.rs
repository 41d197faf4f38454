//! Broker transport: connection setup, session tasks and subscription
//! requests.
//!
//! A [`Connector`] opens the byte stream (TLS over TCP in production, an
//! in-memory duplex in tests). [`TransportSession::connect`] performs the
//! MQTToT handshake on top of it and runs the session until it is closed
//! locally or by the broker.

use std::time::Duration;

mod connector;
mod error;
mod session;
mod socket;
mod state;
mod subscription;

pub use connector::{BROKER_HOST, BROKER_PORT, BoxedStream, BrokerStream, Connector, TlsConnector};
pub use error::TransportError;
pub use session::{CloseReason, InboundFrame, TransportEvent, TransportSession};
pub use socket::SocketOptions;
pub use state::TransportState;
pub use subscription::SubscriptionGroup;

use crate::codec::{MAX_PACKET_LENGTH, clamp_packet_length};

/// Default MQTT keep-alive interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
/// Default bound on the CONNECT / CONNACK handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait for a PUBACK.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport tuning.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mqttot::transport::TransportConfig;
///
/// let config = TransportConfig::default().keep_alive(Duration::ZERO).normalized();
/// assert_eq!(config.keep_alive, Duration::from_secs(1));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Interval between PINGREQ packets; also sent in CONNECT.
    pub keep_alive: Duration,
    /// Bound on opening the stream and receiving CONNACK.
    pub connect_timeout: Duration,
    /// Bound on waiting for a PUBACK.
    pub ack_timeout: Duration,
    /// Largest packet accepted from or sent to the broker.
    pub max_packet_length: usize,
    /// Treat an empty CONNACK payload as a failed handshake.
    pub require_connack_payload: bool,
    /// Capacity of the outbound packet queue.
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_packet_length: MAX_PACKET_LENGTH,
            require_connack_payload: true,
            outbound_capacity: 64,
        }
    }
}

impl TransportConfig {
    /// Set the keep-alive interval.
    #[must_use]
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the PUBACK timeout.
    #[must_use]
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set whether an empty CONNACK payload fails the handshake.
    #[must_use]
    pub fn require_connack_payload(mut self, required: bool) -> Self {
        self.require_connack_payload = required;
        self
    }

    /// Clamp values into usable ranges.
    ///
    /// The keep-alive is held between one second and the largest value the
    /// CONNECT header can carry; timeouts are at least one millisecond.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.keep_alive = self
            .keep_alive
            .clamp(Duration::from_secs(1), Duration::from_secs(u64::from(u16::MAX)));
        self.connect_timeout = self.connect_timeout.max(Duration::from_millis(1));
        self.ack_timeout = self.ack_timeout.max(Duration::from_millis(1));
        self.max_packet_length = clamp_packet_length(self.max_packet_length);
        self.outbound_capacity = self.outbound_capacity.max(1);
        self
    }
}
