//! Static registry of the broker's realtime topics.
//!
//! The broker addresses topics by small integer identifiers that travel on
//! the wire as decimal strings. Each identifier maps to a fixed
//! [`TopicDescriptor`] declaring how inbound payloads are decoded, whether
//! they arrive compressed and which delivery guarantee applies.

use std::fmt;

/// Delivery guarantee requested for a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Qos {
    /// Fire-and-forget (`QoS 0`).
    AtMostOnce,
    /// Acknowledged delivery (`QoS 1`).
    AtLeastOnce,
}

impl Qos {
    /// Numeric level used in MQTT fixed headers.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }

    /// Parse a numeric level. Level 2 is not used by the broker and is
    /// downgraded to at-least-once.
    #[must_use]
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 | 2 => Some(Self::AtLeastOnce),
            _ => None,
        }
    }
}

/// Decoder selected for a topic's inbound payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecoderKind {
    /// Structured binary iris delta stream (protobuf, JSON fallback).
    Iris,
    /// Presence and typing events from the pub/sub topic.
    Skywalker,
    /// GraphQL-style JSON notifications.
    GraphQl,
    /// Region hint published right after connect.
    RegionHint,
    /// Generic JSON responses.
    Json,
    /// No declared decoder; payload is passed through untouched.
    None,
}

/// Immutable description of one broker topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopicDescriptor {
    /// Numeric identifier used as the wire topic name.
    pub id: u16,
    /// Symbolic path.
    pub path: &'static str,
    /// Decoder applied to inbound payloads.
    pub decoder: DecoderKind,
    /// Whether payloads are zlib-compressed on the wire.
    pub requires_decompression: bool,
    /// Delivery guarantee for publishes on this topic.
    pub qos: Qos,
}

impl TopicDescriptor {
    /// Wire representation of the topic name.
    #[must_use]
    pub fn wire_name(&self) -> String { self.id.to_string() }
}

impl fmt::Display for TopicDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.id)
    }
}

const fn topic(
    id: u16,
    path: &'static str,
    decoder: DecoderKind,
    requires_decompression: bool,
    qos: Qos,
) -> TopicDescriptor {
    TopicDescriptor {
        id,
        path,
        decoder,
        requires_decompression,
        qos,
    }
}

/// GraphQL notifications.
pub const GRAPHQL: TopicDescriptor = topic(9, "/graphql", DecoderKind::GraphQl, true, Qos::AtMostOnce);
/// Skywalker pub/sub: presence and typing.
pub const PUBSUB: TopicDescriptor = topic(88, "/pubsub", DecoderKind::Skywalker, true, Qos::AtLeastOnce);
/// Foreground-state announcements (outbound only).
pub const FOREGROUND_STATE: TopicDescriptor =
    topic(102, "/t_fs", DecoderKind::None, true, Qos::AtLeastOnce);
/// Outbound direct commands.
pub const SEND_MESSAGE: TopicDescriptor =
    topic(132, "/ig_send_message", DecoderKind::None, true, Qos::AtLeastOnce);
/// Responses to outbound direct commands.
pub const SEND_MESSAGE_RESPONSE: TopicDescriptor = topic(
    133,
    "/ig_send_message_response",
    DecoderKind::Json,
    true,
    Qos::AtLeastOnce,
);
/// Iris subscription requests (outbound only).
pub const IRIS_SUB: TopicDescriptor =
    topic(134, "/ig_sub_iris", DecoderKind::None, true, Qos::AtLeastOnce);
/// Iris subscription responses.
pub const IRIS_SUB_RESPONSE: TopicDescriptor = topic(
    135,
    "/ig_sub_iris_response",
    DecoderKind::Json,
    true,
    Qos::AtLeastOnce,
);
/// Direct-message delta stream.
pub const MESSAGE_SYNC: TopicDescriptor =
    topic(146, "/ig_message_sync", DecoderKind::Iris, true, Qos::AtLeastOnce);
/// GraphQL realtime subscriptions.
pub const REALTIME_SUB: TopicDescriptor =
    topic(149, "/ig_realtime_sub", DecoderKind::GraphQl, true, Qos::AtLeastOnce);
/// Region hint; delivered uncompressed.
pub const REGION_HINT: TopicDescriptor =
    topic(150, "/t_region_hint", DecoderKind::RegionHint, false, Qos::AtMostOnce);

/// Every topic known to the client.
pub const ALL_TOPICS: [TopicDescriptor; 10] = [
    GRAPHQL,
    PUBSUB,
    FOREGROUND_STATE,
    SEND_MESSAGE,
    SEND_MESSAGE_RESPONSE,
    IRIS_SUB,
    IRIS_SUB_RESPONSE,
    MESSAGE_SYNC,
    REALTIME_SUB,
    REGION_HINT,
];

/// Topic ids requested in the connect payload when the caller supplies none:
/// direct-message delta, presence/typing, region hint and command responses.
pub const DEFAULT_SUBSCRIBE_TOPICS: [u16; 6] = [
    PUBSUB.id,
    IRIS_SUB_RESPONSE.id,
    REALTIME_SUB.id,
    REGION_HINT.id,
    SEND_MESSAGE_RESPONSE.id,
    MESSAGE_SYNC.id,
];

/// Look up a topic by numeric identifier.
///
/// # Examples
///
/// ```
/// use mqttot::topic::{self, DecoderKind};
///
/// let descriptor = topic::by_id(146).expect("message sync is registered");
/// assert_eq!(descriptor.decoder, DecoderKind::Iris);
/// assert!(topic::by_id(1).is_none());
/// ```
#[must_use]
pub fn by_id(id: u16) -> Option<&'static TopicDescriptor> {
    ALL_TOPICS.iter().find(|topic| topic.id == id)
}

/// Look up a topic by symbolic path.
#[must_use]
pub fn by_path(path: &str) -> Option<&'static TopicDescriptor> {
    ALL_TOPICS.iter().find(|topic| topic.path == path)
}

/// Resolve a wire topic name, accepting either the decimal id or the path.
#[must_use]
pub fn resolve(name: &str) -> Option<&'static TopicDescriptor> {
    match name.parse::<u16>() {
        Ok(id) => by_id(id),
        Err(_) => by_path(name),
    }
}
