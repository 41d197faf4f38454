//! Permissive JSON decoder.

use bytes::Bytes;
use serde_json::{Map, Value};

use super::{Decode, DecodeError, DecodedRecord, JsonKind};

/// Parses JSON payloads, wrapping anything else as text. Never fails.
#[derive(Clone, Copy, Debug)]
pub struct JsonDecoder {
    kind: JsonKind,
}

impl JsonDecoder {
    /// Decoder tagging its records with `kind`.
    #[must_use]
    pub const fn new(kind: JsonKind) -> Self { Self { kind } }
}

impl Decode for JsonDecoder {
    fn decode(&self, payload: &Bytes) -> Result<DecodedRecord, DecodeError> {
        Ok(DecodedRecord::Json {
            kind: self.kind,
            value: parse_or_wrap(payload, self.kind),
        })
    }
}

/// Parse `payload` as JSON, or wrap its (lossy UTF-8) text under the kind's
/// text key.
pub(super) fn parse_or_wrap(payload: &[u8], kind: JsonKind) -> Value {
    serde_json::from_slice(payload).unwrap_or_else(|_| {
        let mut wrapped = Map::new();
        wrapped.insert(
            kind.text_key().to_owned(),
            Value::String(String::from_utf8_lossy(payload).into_owned()),
        );
        Value::Object(wrapped)
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case(JsonKind::GraphQl, b"subscription { x }" as &[u8], json!({"query": "subscription { x }"}))]
    #[case(JsonKind::Generic, b"not json", json!({"text": "not json"}))]
    #[case(JsonKind::Generic, b"", json!({"text": ""}))]
    #[case(JsonKind::Generic, b"[1,2]", json!([1, 2]))]
    fn text_is_wrapped_and_json_is_parsed(#[case] kind: JsonKind, #[case] input: &[u8], #[case] expected: Value) {
        let record = JsonDecoder::new(kind)
            .decode(&Bytes::copy_from_slice(input))
            .expect("json decoder never fails");
        assert_eq!(record, DecodedRecord::Json { kind, value: expected });
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let value = parse_or_wrap(&[0xFF, b'a'], JsonKind::Generic);
        assert_eq!(value["text"], "\u{FFFD}a");
    }
}
