//! Wire codec for the realtime transport.
//!
//! [`MqttCodec`] frames MQTT control packets on the byte stream using the
//! remaining-length varint from [`crate::byte_order`]. Payload compression
//! lives in [`compression`]; decode failures use the structured taxonomy in
//! [`error`].

pub mod compression;
pub mod error;
mod packet;

pub use compression::{Decompressed, PayloadEncoding, compress, decompress};
pub use error::{CodecError, EofError, FramingError, ProtocolError};
pub use packet::{
    CONNECT_FLAGS,
    ConnAck,
    Connect,
    MAX_PACKET_LENGTH,
    MIN_PACKET_LENGTH,
    MqttCodec,
    PROTOCOL_LEVEL,
    PROTOCOL_NAME,
    Packet,
    Publish,
    SubAck,
    Subscribe,
    clamp_packet_length,
};
