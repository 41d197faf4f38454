//! Error types for the transport session.

use std::{io, time::Duration};

use super::TransportState;

/// Errors emitted by [`TransportSession`](super::TransportSession).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket, TLS stream or codec failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// The TLS client configuration could not be built.
    #[error("tls configuration error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    /// The broker host is not a valid TLS server name.
    #[error("invalid broker host name: {0}")]
    InvalidHost(String),
    /// The broker host did not resolve to any address.
    #[error("broker host {0} did not resolve")]
    Unresolved(String),
    /// The handshake did not complete in time.
    #[error("connect handshake timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// The broker rejected the CONNECT packet.
    #[error("connection refused by broker (return code {code})")]
    Refused {
        /// CONNACK return code.
        code: u8,
    },
    /// The CONNACK carried no payload although one is required; usually
    /// the credential token was rejected.
    #[error("broker acknowledged with an empty CONNACK payload")]
    EmptyConnAck,
    /// The broker sent something other than CONNACK during the handshake.
    #[error("unexpected {0} packet during handshake")]
    UnexpectedPacket(&'static str),
    /// The session is not connected.
    #[error("transport is not connected (state {0})")]
    NotConnected(TransportState),
    /// The connection closed.
    #[error("connection closed")]
    Closed,
    /// No PUBACK arrived in time for a QoS 1 publish.
    #[error("no acknowledgement for packet {packet_id} within {after:?}")]
    AckTimeout {
        /// Packet id of the unacknowledged publish.
        packet_id: u16,
        /// Timeout that elapsed.
        after: Duration,
    },
    /// The broker stopped answering keep-alive pings.
    #[error("keep-alive timed out")]
    KeepAliveTimeout,
    /// A subscription payload could not be serialised.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    /// Attempted a state change the state machine does not allow.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: TransportState,
        /// Requested state.
        to: TransportState,
    },
}

impl TransportError {
    /// Whether retrying the connection might succeed.
    ///
    /// Precondition failures are not retryable; everything that reflects
    /// the network or broker is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NotConnected(_) | Self::InvalidTransition { .. } | Self::Encode(_) | Self::InvalidHost(_)
        )
    }
}
