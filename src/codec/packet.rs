//! MQTT packet model and the `tokio_util` codec that frames it.
//!
//! The broker speaks a trimmed MQTT 3.1 dialect: the CONNECT variable header
//! carries the protocol name `MQTToT`, and the CONNECT and CONNACK packets
//! carry opaque payloads (a compressed thrift blob outbound, session data
//! inbound). The codec is symmetric so the same type can drive both ends of a
//! connection in tests.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{CodecError, EofError, FramingError, ProtocolError};
use crate::{
    byte_order::{
        RemainingLength,
        peek_remaining_length,
        put_remaining_length,
        take_network_u16,
        write_network_u16,
    },
    topic::Qos,
};

/// Protocol name carried in the CONNECT variable header.
pub const PROTOCOL_NAME: &str = "MQTToT";
/// Protocol level carried in the CONNECT variable header.
pub const PROTOCOL_LEVEL: u8 = 3;
/// CONNECT flags: username, password and clean session.
pub const CONNECT_FLAGS: u8 = 0xC2;

/// Minimum accepted packet length limit.
pub const MIN_PACKET_LENGTH: usize = 64;
/// Maximum accepted packet length limit (16 MiB).
pub const MAX_PACKET_LENGTH: usize = 16 * 1024 * 1024;

/// Clamp a configured packet length limit to the supported range.
#[must_use]
pub fn clamp_packet_length(max: usize) -> usize { max.clamp(MIN_PACKET_LENGTH, MAX_PACKET_LENGTH) }

/// CONNECT packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name, normally [`PROTOCOL_NAME`].
    pub protocol_name: String,
    /// Protocol level, normally [`PROTOCOL_LEVEL`].
    pub protocol_level: u8,
    /// Connect flags, normally [`CONNECT_FLAGS`].
    pub flags: u8,
    /// Keep-alive interval in seconds.
    pub keep_alive: u16,
    /// Opaque payload (the compressed thrift connect blob).
    pub payload: Bytes,
}

impl Connect {
    /// Build a CONNECT with the broker's protocol constants.
    #[must_use]
    pub fn mqttot(keep_alive: u16, payload: Bytes) -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_owned(),
            protocol_level: PROTOCOL_LEVEL,
            flags: CONNECT_FLAGS,
            keep_alive,
            payload,
        }
    }
}

/// CONNACK packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnAck {
    /// Acknowledge flags.
    pub flags: u8,
    /// Return code; zero means accepted.
    pub return_code: u8,
    /// Payload following the variable header, possibly empty.
    pub payload: Bytes,
}

impl ConnAck {
    /// Whether the broker accepted the connection.
    #[must_use]
    pub fn is_success(&self) -> bool { self.return_code == 0 }
}

/// PUBLISH packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publish {
    /// Wire topic name (a decimal topic id for this broker).
    pub topic: String,
    /// Packet identifier; present only for `QoS 1`.
    pub packet_id: Option<u16>,
    /// Delivery guarantee.
    pub qos: Qos,
    /// Retain flag.
    pub retain: bool,
    /// Duplicate-delivery flag.
    pub dup: bool,
    /// Application payload.
    pub payload: Bytes,
}

/// SUBSCRIBE packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribe {
    /// Packet identifier.
    pub packet_id: u16,
    /// Topic filters and requested QoS.
    pub topics: Vec<(String, Qos)>,
}

/// SUBACK packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier being acknowledged.
    pub packet_id: u16,
    /// Granted QoS per filter; `0x80` means failure.
    pub return_codes: Vec<u8>,
}

/// MQTT control packets used by the realtime client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// Client connection request.
    Connect(Connect),
    /// Broker connection acknowledgement.
    ConnAck(ConnAck),
    /// Application message.
    Publish(Publish),
    /// `QoS 1` acknowledgement.
    PubAck {
        /// Packet identifier being acknowledged.
        packet_id: u16,
    },
    /// Subscription request.
    Subscribe(Subscribe),
    /// Subscription acknowledgement.
    SubAck(SubAck),
    /// Unsubscribe request.
    Unsubscribe {
        /// Packet identifier.
        packet_id: u16,
        /// Filters to remove.
        topics: Vec<String>,
    },
    /// Unsubscribe acknowledgement.
    UnsubAck {
        /// Packet identifier being acknowledged.
        packet_id: u16,
    },
    /// Keep-alive probe.
    PingReq,
    /// Keep-alive reply.
    PingResp,
    /// Graceful disconnect.
    Disconnect,
}

impl Packet {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnAck(_) => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck { .. } => "PUBACK",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::SubAck(_) => "SUBACK",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::UnsubAck { .. } => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// Symmetric MQTT codec bounded by a maximum packet length.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use mqttot::codec::{MqttCodec, Packet};
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut codec = MqttCodec::new(1024);
/// let mut buf = BytesMut::new();
/// codec.encode(Packet::PingReq, &mut buf).expect("encode");
/// assert_eq!(&buf[..], &[0xC0, 0x00]);
/// assert_eq!(codec.decode(&mut buf).expect("decode"), Some(Packet::PingReq));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct MqttCodec {
    max_packet_length: usize,
}

impl MqttCodec {
    /// Create a codec; `max_packet_length` is clamped to
    /// [`MIN_PACKET_LENGTH`]..=[`MAX_PACKET_LENGTH`].
    #[must_use]
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            max_packet_length: clamp_packet_length(max_packet_length),
        }
    }

    /// Configured maximum packet length.
    #[must_use]
    pub fn max_packet_length(&self) -> usize { self.max_packet_length }
}

impl Default for MqttCodec {
    fn default() -> Self { Self::new(MAX_PACKET_LENGTH) }
}

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let (body_len, width) = match peek_remaining_length(&src[1..]) {
            RemainingLength::Complete { value, width } => (value, width),
            RemainingLength::Incomplete => return Ok(None),
            RemainingLength::Malformed => {
                return Err(CodecError::from(FramingError::InvalidLengthEncoding).into());
            }
        };
        if body_len > self.max_packet_length {
            return Err(CodecError::from(FramingError::OversizedFrame {
                size: body_len,
                max: self.max_packet_length,
            })
            .into());
        }
        let total = 1 + width + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let header = frame.get_u8();
        frame.advance(width);
        decode_body(header, frame.freeze())
            .map(Some)
            .map_err(|e| CodecError::from(e).into())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None => Err(build_eof_error(src)),
        }
    }
}

/// Classify leftover bytes at EOF as a truncated header or body.
fn build_eof_error(src: &BytesMut) -> io::Error {
    let err = match src.get(1..).map(peek_remaining_length) {
        Some(RemainingLength::Complete { value, width }) => EofError::MidFrame {
            bytes_received: src.len(),
            expected: 1 + width + value,
        },
        _ => EofError::MidHeader {
            bytes_received: src.len(),
        },
    };
    tracing::debug!(error = %err, "stream ended inside a packet");
    CodecError::from(err).into()
}

fn decode_body(header: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    let flags = header & 0x0F;
    match header >> 4 {
        CONNECT => {
            let protocol_name = take_string(&mut body, "CONNECT", "protocol name")?;
            let protocol_level = take_u8(&mut body, "CONNECT", "protocol level")?;
            let connect_flags = take_u8(&mut body, "CONNECT", "flags")?;
            let keep_alive = take_u16(&mut body, "CONNECT", "keep alive")?;
            Ok(Packet::Connect(Connect {
                protocol_name,
                protocol_level,
                flags: connect_flags,
                keep_alive,
                payload: body,
            }))
        }
        CONNACK => {
            let ack_flags = take_u8(&mut body, "CONNACK", "flags")?;
            let return_code = take_u8(&mut body, "CONNACK", "return code")?;
            Ok(Packet::ConnAck(ConnAck {
                flags: ack_flags,
                return_code,
                payload: body,
            }))
        }
        PUBLISH => {
            let level = (flags >> 1) & 0x03;
            let qos = Qos::from_level(level).ok_or(ProtocolError::UnsupportedQos { level })?;
            let topic = take_string(&mut body, "PUBLISH", "topic")?;
            let packet_id = match qos {
                Qos::AtMostOnce => None,
                Qos::AtLeastOnce => Some(take_u16(&mut body, "PUBLISH", "packet id")?),
            };
            Ok(Packet::Publish(Publish {
                topic,
                packet_id,
                qos,
                retain: flags & 0x01 != 0,
                dup: flags & 0x08 != 0,
                payload: body,
            }))
        }
        PUBACK => Ok(Packet::PubAck {
            packet_id: take_u16(&mut body, "PUBACK", "packet id")?,
        }),
        SUBSCRIBE => {
            let packet_id = take_u16(&mut body, "SUBSCRIBE", "packet id")?;
            let mut topics = Vec::new();
            while body.has_remaining() {
                let filter = take_string(&mut body, "SUBSCRIBE", "topic filter")?;
                let level = take_u8(&mut body, "SUBSCRIBE", "requested qos")?;
                let qos = Qos::from_level(level).ok_or(ProtocolError::UnsupportedQos { level })?;
                topics.push((filter, qos));
            }
            Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
        }
        SUBACK => {
            let packet_id = take_u16(&mut body, "SUBACK", "packet id")?;
            Ok(Packet::SubAck(SubAck {
                packet_id,
                return_codes: body.to_vec(),
            }))
        }
        UNSUBSCRIBE => {
            let packet_id = take_u16(&mut body, "UNSUBSCRIBE", "packet id")?;
            let mut topics = Vec::new();
            while body.has_remaining() {
                topics.push(take_string(&mut body, "UNSUBSCRIBE", "topic filter")?);
            }
            Ok(Packet::Unsubscribe { packet_id, topics })
        }
        UNSUBACK => Ok(Packet::UnsubAck {
            packet_id: take_u16(&mut body, "UNSUBACK", "packet id")?,
        }),
        PINGREQ => Ok(Packet::PingReq),
        PINGRESP => Ok(Packet::PingResp),
        DISCONNECT => Ok(Packet::Disconnect),
        type_id => Err(ProtocolError::UnknownPacketType { type_id }),
    }
}

fn take_u8(src: &mut Bytes, packet: &'static str, field: &'static str) -> Result<u8, ProtocolError> {
    if src.has_remaining() {
        Ok(src.get_u8())
    } else {
        Err(ProtocolError::Truncated { packet, field })
    }
}

fn take_u16(src: &mut Bytes, packet: &'static str, field: &'static str) -> Result<u16, ProtocolError> {
    take_network_u16(src).ok_or(ProtocolError::Truncated { packet, field })
}

fn take_string(
    src: &mut Bytes,
    packet: &'static str,
    field: &'static str,
) -> Result<String, ProtocolError> {
    let len = usize::from(take_u16(src, packet, field)?);
    if src.remaining() < len {
        return Err(ProtocolError::Truncated { packet, field });
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { packet, field })
}

fn put_string(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong {
        field,
        len: value.len(),
    })?;
    dst.put_slice(&write_network_u16(len));
    dst.put_slice(value.as_bytes());
    Ok(())
}

impl Encoder<Packet> for MqttCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        let header = encode_body(&item, &mut body).map_err(CodecError::from)?;
        if body.len() > self.max_packet_length {
            return Err(CodecError::from(FramingError::OversizedFrame {
                size: body.len(),
                max: self.max_packet_length,
            })
            .into());
        }
        dst.reserve(body.len() + 5);
        dst.put_u8(header);
        put_remaining_length(dst, body.len()).ok_or_else(|| {
            CodecError::from(FramingError::OversizedFrame {
                size: body.len(),
                max: self.max_packet_length,
            })
        })?;
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Write the variable header and payload into `body`, returning the fixed
/// header byte.
fn encode_body(packet: &Packet, body: &mut BytesMut) -> Result<u8, ProtocolError> {
    let header = match packet {
        Packet::Connect(connect) => {
            put_string(body, "protocol name", &connect.protocol_name)?;
            body.put_u8(connect.protocol_level);
            body.put_u8(connect.flags);
            body.put_slice(&write_network_u16(connect.keep_alive));
            body.put_slice(&connect.payload);
            CONNECT << 4
        }
        Packet::ConnAck(ack) => {
            body.put_u8(ack.flags);
            body.put_u8(ack.return_code);
            body.put_slice(&ack.payload);
            CONNACK << 4
        }
        Packet::Publish(publish) => {
            put_string(body, "topic", &publish.topic)?;
            if publish.qos == Qos::AtLeastOnce {
                body.put_slice(&write_network_u16(publish.packet_id.unwrap_or_default()));
            }
            body.put_slice(&publish.payload);
            let mut flags = publish.qos.level() << 1;
            if publish.retain {
                flags |= 0x01;
            }
            if publish.dup {
                flags |= 0x08;
            }
            PUBLISH << 4 | flags
        }
        Packet::PubAck { packet_id } => {
            body.put_slice(&write_network_u16(*packet_id));
            PUBACK << 4
        }
        Packet::Subscribe(subscribe) => {
            body.put_slice(&write_network_u16(subscribe.packet_id));
            for (filter, qos) in &subscribe.topics {
                put_string(body, "topic filter", filter)?;
                body.put_u8(qos.level());
            }
            SUBSCRIBE << 4 | 0x02
        }
        Packet::SubAck(ack) => {
            body.put_slice(&write_network_u16(ack.packet_id));
            body.put_slice(&ack.return_codes);
            SUBACK << 4
        }
        Packet::Unsubscribe { packet_id, topics } => {
            body.put_slice(&write_network_u16(*packet_id));
            for filter in topics {
                put_string(body, "topic filter", filter)?;
            }
            UNSUBSCRIBE << 4 | 0x02
        }
        Packet::UnsubAck { packet_id } => {
            body.put_slice(&write_network_u16(*packet_id));
            UNSUBACK << 4
        }
        Packet::PingReq => PINGREQ << 4,
        Packet::PingResp => PINGRESP << 4,
        Packet::Disconnect => DISCONNECT << 4,
    };
    Ok(header)
}
