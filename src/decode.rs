//! Per-topic payload decoders.
//!
//! Every topic declares a [`DecoderKind`]. [`decode_frame`] applies the
//! topic's decompression flag and then the matching [`Decode`]
//! implementation:
//!
//! - [`IrisDecoder`] reads the binary delta schema and falls back to JSON;
//! - [`SkywalkerDecoder`] maps presence and typing JSON to delta items;
//! - [`JsonDecoder`] parses JSON permissively and never fails;
//! - [`PassThrough`] returns the bytes untouched.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::{
    codec,
    delta::DeltaBatch,
    topic::{DecoderKind, TopicDescriptor},
};

mod iris;
mod json;
mod lenient;
mod skywalker;

pub use iris::{
    IrisDecoder,
    IrisItem,
    IrisPayload,
    MessageSyncMessage,
    PresenceIndicator,
    ThreadUpdate,
    TypingIndicator,
};
pub use json::JsonDecoder;
pub use skywalker::SkywalkerDecoder;

/// Family of a JSON record, used to route it to the right event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JsonKind {
    /// GraphQL notification.
    GraphQl,
    /// Region hint.
    RegionHint,
    /// Skywalker event that is not presence or typing.
    Skywalker,
    /// Iris frame without delta items (subscription responses, acks).
    Iris,
    /// Any other JSON topic.
    Generic,
}

impl JsonKind {
    /// Key under which non-JSON text is wrapped.
    pub(crate) fn text_key(self) -> &'static str {
        match self {
            Self::GraphQl => "query",
            Self::RegionHint => "hint",
            Self::Skywalker | Self::Iris => "message",
            Self::Generic => "text",
        }
    }
}

/// Output of a decoder.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedRecord {
    /// State changes for the delta engine.
    Delta(DeltaBatch),
    /// A loosely-typed JSON document.
    Json {
        /// Record family.
        kind: JsonKind,
        /// Parsed document, or the wrapped text when it was not JSON.
        value: Value,
    },
    /// Undecoded payload.
    Raw(Bytes),
}

/// Errors raised by decoders that can fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload was empty.
    #[error("empty payload")]
    Empty,
    /// Neither the binary schema nor JSON accepted the payload.
    #[error("payload is neither iris protobuf ({binary}) nor JSON ({json})")]
    Unrecognised {
        /// Binary decoder failure.
        binary: String,
        /// JSON decoder failure.
        json: String,
    },
}

/// Capability shared by all payload decoders.
pub trait Decode: Send + Sync {
    /// Decode an already-decompressed payload.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the payload cannot be interpreted.
    fn decode(&self, payload: &Bytes) -> Result<DecodedRecord, DecodeError>;
}

/// Decoder returning the payload untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl Decode for PassThrough {
    fn decode(&self, payload: &Bytes) -> Result<DecodedRecord, DecodeError> { Ok(DecodedRecord::Raw(payload.clone())) }
}

static IRIS: IrisDecoder = IrisDecoder;
static SKYWALKER: SkywalkerDecoder = SkywalkerDecoder;
static GRAPHQL: JsonDecoder = JsonDecoder::new(JsonKind::GraphQl);
static REGION_HINT: JsonDecoder = JsonDecoder::new(JsonKind::RegionHint);
static GENERIC: JsonDecoder = JsonDecoder::new(JsonKind::Generic);
static PASS_THROUGH: PassThrough = PassThrough;

/// Decoder for a topic's declared kind.
#[must_use]
pub fn decoder_for(kind: DecoderKind) -> &'static dyn Decode {
    match kind {
        DecoderKind::Iris => &IRIS,
        DecoderKind::Skywalker => &SKYWALKER,
        DecoderKind::GraphQl => &GRAPHQL,
        DecoderKind::RegionHint => &REGION_HINT,
        DecoderKind::Json => &GENERIC,
        DecoderKind::None => &PASS_THROUGH,
    }
}

/// Decompress (when the topic requires it) and decode one inbound payload.
///
/// # Errors
///
/// Propagates the topic decoder's [`DecodeError`].
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use mqttot::{
///     decode::{DecodedRecord, JsonKind, decode_frame},
///     topic,
/// };
///
/// let record = decode_frame(&topic::REGION_HINT, Bytes::from_static(b"ash")).expect("never fails");
/// let DecodedRecord::Json { kind, value } = record else { panic!("json expected") };
/// assert_eq!(kind, JsonKind::RegionHint);
/// assert_eq!(value["hint"], "ash");
/// ```
pub fn decode_frame(topic: &TopicDescriptor, payload: Bytes) -> Result<DecodedRecord, DecodeError> {
    let payload = if topic.requires_decompression {
        codec::decompress(payload).bytes
    } else {
        payload
    };
    decoder_for(topic.decoder).decode(&payload)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::topic;

    #[test]
    fn pass_through_keeps_bytes() {
        let payload = Bytes::from_static(b"\x00\x01");
        let record = decode_frame(&topic::SEND_MESSAGE, payload.clone()).expect("decode");
        // 0x00 0x01 is neither zlib nor gzip, so decompression keeps it raw
        assert_eq!(record, DecodedRecord::Raw(payload));
    }

    #[rstest]
    #[case(&topic::GRAPHQL, JsonKind::GraphQl)]
    #[case(&topic::SEND_MESSAGE_RESPONSE, JsonKind::Generic)]
    #[case(&topic::REALTIME_SUB, JsonKind::GraphQl)]
    fn compressed_json_topics_are_inflated(#[case] topic: &TopicDescriptor, #[case] expected: JsonKind) {
        let packed = codec::compress(br#"{"ok":true}"#).expect("compress");
        let record = decode_frame(topic, Bytes::from(packed)).expect("decode");
        assert_eq!(
            record,
            DecodedRecord::Json {
                kind: expected,
                value: serde_json::json!({"ok": true}),
            }
        );
    }
}
