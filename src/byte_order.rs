//! Helpers for explicit network byte-order conversions.
//!
//! These helpers keep Clippy expectations scoped to the conversion points so
//! the MQTT codec can remain explicit about wire endianness without repeating
//! lint annotations. The remaining-length helpers implement the MQTT
//! variable-length integer used in every fixed header.

use bytes::{Buf, BufMut, BytesMut};

/// Largest value representable by the MQTT remaining-length field.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Serialise a `u16` in network byte order (big-endian).
///
/// # Examples
///
/// ```
/// use mqttot::byte_order::write_network_u16;
///
/// assert_eq!(write_network_u16(0x1234), [0x12, 0x34]);
/// ```
#[must_use]
pub fn write_network_u16(value: u16) -> [u8; 2] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    value.to_be_bytes()
}

/// Parse a network-order `u16` from its on-wire representation.
///
/// # Examples
///
/// ```
/// use mqttot::byte_order::read_network_u16;
///
/// assert_eq!(read_network_u16([0x12, 0x34]), 0x1234);
/// ```
#[must_use]
pub fn read_network_u16(bytes: [u8; 2]) -> u16 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    u16::from_be_bytes(bytes)
}

/// Append an MQTT remaining-length varint to `dst`.
///
/// Returns `None` if `len` exceeds [`MAX_REMAINING_LENGTH`].
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use mqttot::byte_order::put_remaining_length;
///
/// let mut buf = BytesMut::new();
/// put_remaining_length(&mut buf, 321).expect("length fits");
/// assert_eq!(&buf[..], &[0xC1, 0x02]);
/// ```
pub fn put_remaining_length(dst: &mut BytesMut, len: usize) -> Option<()> {
    if len > MAX_REMAINING_LENGTH {
        return None;
    }
    let mut value = len;
    loop {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "value is masked to seven bits"
        )]
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            return Some(());
        }
    }
}

/// Outcome of peeking at a remaining-length varint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemainingLength {
    /// The varint is complete: decoded value and bytes consumed.
    Complete {
        /// Decoded remaining length.
        value: usize,
        /// Bytes occupied by the varint itself.
        width: usize,
    },
    /// More bytes are needed.
    Incomplete,
    /// The varint uses more than four bytes.
    Malformed,
}

/// Decode a remaining-length varint from the start of `src` without
/// consuming it.
///
/// # Examples
///
/// ```
/// use mqttot::byte_order::{RemainingLength, peek_remaining_length};
///
/// assert_eq!(
///     peek_remaining_length(&[0xC1, 0x02]),
///     RemainingLength::Complete { value: 321, width: 2 }
/// );
/// assert_eq!(peek_remaining_length(&[0x80]), RemainingLength::Incomplete);
/// ```
#[must_use]
pub fn peek_remaining_length(src: &[u8]) -> RemainingLength {
    let mut value = 0usize;
    for (idx, byte) in src.iter().enumerate().take(4) {
        value |= usize::from(byte & 0x7F) << (7 * idx);
        if byte & 0x80 == 0 {
            return RemainingLength::Complete {
                value,
                width: idx + 1,
            };
        }
    }
    if src.len() >= 4 {
        RemainingLength::Malformed
    } else {
        RemainingLength::Incomplete
    }
}

/// Read a big-endian `u16` from `src`, returning `None` when fewer than two
/// bytes remain.
pub(crate) fn take_network_u16(src: &mut impl Buf) -> Option<u16> {
    if src.remaining() < 2 {
        return None;
    }
    let mut raw = [0u8; 2];
    src.copy_to_slice(&mut raw);
    Some(read_network_u16(raw))
}
