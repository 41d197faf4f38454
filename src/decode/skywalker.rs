//! Skywalker pub/sub decoder: presence, typing and reaction events.

use bytes::Bytes;
use serde_json::Value;

use super::{Decode, DecodeError, DecodedRecord, JsonKind, json::parse_or_wrap, lenient::LenientValue};
use crate::delta::{DeltaBatch, DeltaItem, DeltaRecord, MessageDelta, Operation, PresenceDelta, TypingDelta};

/// Maps skywalker JSON events onto delta items; other documents are
/// returned as [`JsonKind::Skywalker`] records. Never fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkywalkerDecoder;

impl Decode for SkywalkerDecoder {
    fn decode(&self, payload: &Bytes) -> Result<DecodedRecord, DecodeError> {
        let value = parse_or_wrap(payload, JsonKind::Skywalker);
        let items: Vec<DeltaItem> = match &value {
            Value::Array(events) => events.iter().filter_map(event_item).collect(),
            event => event_item(event).into_iter().collect(),
        };
        if items.is_empty() {
            Ok(DecodedRecord::Json {
                kind: JsonKind::Skywalker,
                value,
            })
        } else {
            Ok(DecodedRecord::Delta(DeltaBatch::new(items)))
        }
    }
}

fn string(event: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| event.get(key))
        .find_map(LenientValue::as_lenient_string)
}

fn int(event: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|key| event.get(key))
        .find_map(LenientValue::as_lenient_i64)
}

fn event_item(event: &Value) -> Option<DeltaItem> {
    // Presence events are sometimes wrapped: {"presence_event": {...}}
    let event = event.get("presence_event").unwrap_or(event);
    let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
    let record = match kind {
        "typing_on" | "typing_off" => typing(event, kind == "typing_on")?,
        "reaction" => DeltaRecord::Message(MessageDelta {
            item_id: string(event, &["message_id", "item_id"])?,
            thread_id: string(event, &["thread_id"]),
            reaction: string(event, &["emoji"]),
            ..MessageDelta::default()
        }),
        "presence" => presence(event)?,
        _ if event.get("status").is_some() && event.get("user_id").is_some() => presence(event)?,
        _ if event.get("thread_id").is_some()
            && ["state", "is_typing", "activity_status"]
                .iter()
                .any(|key| event.get(key).is_some()) =>
        {
            let active = match (event.get("state"), event.get("is_typing"), event.get("activity_status")) {
                (Some(state), _, _) => state.as_str().is_none_or(|s| !s.eq_ignore_ascii_case("stopped")),
                (None, Some(flag), _) => flag.as_lenient_bool().unwrap_or(true),
                (None, None, status) => status.and_then(LenientValue::as_lenient_i64).is_none_or(|s| s != 0),
            };
            typing(event, active)?
        }
        _ => return None,
    };
    Some(DeltaItem::new(Operation::Update, record))
}

fn typing(event: &Value, is_active: bool) -> Option<DeltaRecord> {
    Some(DeltaRecord::Typing(TypingDelta {
        thread_id: string(event, &["thread_id"])?,
        user_id: string(event, &["from_user_id", "user_id", "sender_id"]),
        is_active,
        timestamp: int(event, &["timestamp"]),
    }))
}

fn presence(event: &Value) -> Option<DeltaRecord> {
    Some(DeltaRecord::Presence(PresenceDelta {
        user_id: string(event, &["user_id"])?,
        status: string(event, &["status"]),
        last_activity_at: int(event, &["last_activity", "last_activity_at_ms", "last_seen_at"]),
    }))
}
