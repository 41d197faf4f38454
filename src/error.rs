//! Canonical error and result types for the crate.
//!
//! [`RealtimeError`] is the facade-level union: each layer keeps its own
//! error enum and converts into this one at the client boundary.

use thiserror::Error;

use crate::{
    connect::BuildError,
    decode::DecodeError,
    persistence::PersistenceError,
    rest::RestError,
    transport::TransportError,
};

/// Errors surfaced by [`RealtimeClient`](crate::client::RealtimeClient).
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The auth session cannot produce a connect payload.
    #[error("cannot build connect payload: {0}")]
    Build(#[from] BuildError),
    /// Connection, handshake or publish failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Session files could not be read or written.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// The REST collaborator failed.
    #[error("rest request failed: {0}")]
    Rest(#[from] RestError),
    /// A frame could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    /// The operation needs a live connection.
    #[error("client is not connected")]
    NotConnected,
    /// The reconnect budget is spent; the client will not retry again.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// The client has been shut down.
    #[error("client has been shut down")]
    Shutdown,
}

impl RealtimeError {
    /// Short category name for logs and error events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build(_) => "build",
            Self::Transport(_) => "transport",
            Self::Persistence(_) => "persistence",
            Self::Rest(_) => "rest",
            Self::Decode(_) => "decode",
            Self::NotConnected => "not_connected",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the client stopped trying to recover.
    #[must_use]
    pub fn is_terminal(&self) -> bool { matches!(self, Self::ReconnectExhausted { .. } | Self::Shutdown) }
}

/// Result alias using [`RealtimeError`].
pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_errors_convert() {
        let err: RealtimeError = TransportError::KeepAliveTimeout.into();
        assert_eq!(err.kind(), "transport");
        assert_eq!(err.to_string(), "keep-alive timed out");

        let err: RealtimeError = BuildError::MissingUserId.into();
        assert_eq!(err.kind(), "build");
        assert!(!err.is_terminal());
    }

    #[test]
    fn exhaustion_is_terminal() {
        let err = RealtimeError::ReconnectExhausted { attempts: 5 };
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "gave up reconnecting after 5 attempts");
    }
}
