//! Error types for the codec layer.
//!
//! This module provides a structured error taxonomy that distinguishes between
//! framing errors (wire-level packet boundary issues), protocol errors
//! (malformed packet bodies after the boundary is known), I/O errors, and EOF
//! conditions.
//!
//! # Error Categories
//!
//! - [`FramingError`]: Wire-level issues in the fixed header (oversized packets, malformed
//!   remaining-length varints).
//! - [`ProtocolError`]: Packet bodies that violate the MQTT layout (unknown packet types, truncated
//!   fields, invalid QoS, invalid UTF-8 topic names).
//! - [`EofError`]: End-of-stream conditions distinguishing clean closure from premature
//!   disconnection.
//! - [`CodecError`]: Top-level enum wrapping all categories plus I/O errors.

use std::io;

use thiserror::Error;

/// Framing-level errors occurring during packet boundary detection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Remaining length indicates a packet larger than the configured maximum.
    #[error("packet exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Packet size indicated by the fixed header.
        size: usize,
        /// Maximum allowed packet size.
        max: usize,
    },

    /// Remaining-length varint is longer than four bytes.
    #[error("invalid remaining length encoding")]
    InvalidLengthEncoding,
}

/// Protocol-level errors occurring after the packet boundary is known.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The packet type nibble is not one the client understands.
    #[error("unknown packet type: {type_id}")]
    UnknownPacketType {
        /// Packet type nibble from the fixed header.
        type_id: u8,
    },

    /// A packet body ended before a required field.
    #[error("truncated {packet} packet: missing {field}")]
    Truncated {
        /// Packet kind being decoded.
        packet: &'static str,
        /// Field that could not be read.
        field: &'static str,
    },

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid UTF-8 in {packet} packet field {field}")]
    InvalidUtf8 {
        /// Packet kind being decoded.
        packet: &'static str,
        /// Field that failed validation.
        field: &'static str,
    },

    /// A QoS level outside the supported range.
    #[error("unsupported QoS level: {level}")]
    UnsupportedQos {
        /// Level found in the fixed header.
        level: u8,
    },

    /// A string exceeded the 65535-byte MQTT limit on encode.
    #[error("string field {field} too long: {len} bytes")]
    StringTooLong {
        /// Field being encoded.
        field: &'static str,
        /// Length in bytes.
        len: usize,
    },
}

/// EOF handling variants distinguishing normal vs. premature closure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// Clean EOF at a packet boundary.
    #[error("connection closed cleanly at packet boundary")]
    CleanClose,

    /// EOF received after the fixed header but before the body completed.
    #[error("premature EOF: {bytes_received} bytes of {expected} byte packet received")]
    MidFrame {
        /// Bytes received before EOF.
        bytes_received: usize,
        /// Expected total packet size.
        expected: usize,
    },

    /// EOF received while the fixed header was still incomplete.
    #[error("premature EOF during fixed header: {bytes_received} bytes received")]
    MidHeader {
        /// Header bytes received before EOF.
        bytes_received: usize,
    },
}

/// Top-level codec error taxonomy.
///
/// # Examples
///
/// ```
/// use mqttot::codec::{CodecError, FramingError};
///
/// let err = CodecError::Framing(FramingError::OversizedFrame {
///     size: 2000,
///     max: 1024,
/// });
/// assert_eq!(err.error_type(), "framing");
/// assert!(!err.is_clean_close());
/// ```
#[derive(Debug, Error)]
pub enum CodecError {
    /// Framing layer error.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Protocol layer error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport layer I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// End-of-stream handling.
    #[error("EOF: {0}")]
    Eof(#[from] EofError),
}

impl CodecError {
    /// Returns true if this error represents a clean connection close.
    #[must_use]
    pub fn is_clean_close(&self) -> bool { matches!(self, Self::Eof(EofError::CleanClose)) }

    /// Returns the error category as a string for logging and metrics.
    ///
    /// One of: `"framing"`, `"protocol"`, `"io"`, or `"eof"`.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Eof(_) => "eof",
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            CodecError::Framing(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Protocol(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Eof(e) => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        }
    }
}
