//! Iris delta-stream decoder.
//!
//! The binary schema is protobuf. Brokers also deliver the same stream as
//! JSON in two shapes: the protobuf layout with snake-case keys, and the
//! message-sync layout `{seq_id, data: [{op, path, value}]}` where the path
//! addresses a thread, an item or a typing indicator and `value` is a JSON
//! document (often itself JSON-encoded as a string).

use bytes::Bytes;
use prost::Message as _;
use serde::Deserialize;
use serde_json::Value;

use super::{
    Decode,
    DecodeError,
    DecodedRecord,
    JsonKind,
    lenient::{self, LenientValue},
};
use crate::delta::{
    DeltaBatch,
    DeltaItem,
    DeltaRecord,
    MessageDelta,
    Operation,
    PresenceDelta,
    ThreadDelta,
    TypingDelta,
};

/// Top-level iris frame.
#[derive(Clone, PartialEq, ::prost::Message, Deserialize)]
#[serde(default)]
pub struct IrisPayload {
    #[prost(string, tag = "1")]
    #[serde(deserialize_with = "lenient::string")]
    pub action: String,
    #[prost(int64, tag = "2")]
    #[serde(deserialize_with = "lenient::i64")]
    pub seq_id: i64,
    #[prost(message, repeated, tag = "3")]
    pub items: Vec<IrisItem>,
}

/// One entry of an iris frame; exactly one of the record fields is set.
#[derive(Clone, PartialEq, ::prost::Message, Deserialize)]
#[serde(default)]
pub struct IrisItem {
    #[prost(string, tag = "1")]
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
    #[prost(string, tag = "2")]
    #[serde(rename = "type", deserialize_with = "lenient::string")]
    pub kind: String,
    #[prost(int64, tag = "3")]
    #[serde(deserialize_with = "lenient::i64")]
    pub timestamp: i64,
    #[prost(string, tag = "4")]
    #[serde(deserialize_with = "lenient::string")]
    pub op: String,
    #[prost(string, tag = "5")]
    #[serde(deserialize_with = "lenient::string")]
    pub path: String,
    #[prost(message, optional, tag = "6")]
    pub message: Option<MessageSyncMessage>,
    #[prost(message, optional, tag = "7")]
    pub thread: Option<ThreadUpdate>,
    #[prost(message, optional, tag = "8")]
    pub typing: Option<TypingIndicator>,
    #[prost(message, optional, tag = "9")]
    pub presence: Option<PresenceIndicator>,
}

#[derive(Clone, PartialEq, ::prost::Message, Deserialize)]
#[serde(default)]
pub struct MessageSyncMessage {
    #[prost(string, tag = "1")]
    #[serde(deserialize_with = "lenient::string")]
    pub item_id: String,
    #[prost(int64, tag = "2")]
    #[serde(deserialize_with = "lenient::i64")]
    pub user_id: i64,
    #[prost(int64, tag = "3")]
    #[serde(deserialize_with = "lenient::i64")]
    pub timestamp: i64,
    #[prost(string, tag = "4")]
    #[serde(deserialize_with = "lenient::string")]
    pub thread_id: String,
    #[prost(string, tag = "5")]
    #[serde(deserialize_with = "lenient::string")]
    pub thread_v2_id: String,
    #[prost(string, tag = "6")]
    #[serde(deserialize_with = "lenient::string")]
    pub item_type: String,
    #[prost(string, tag = "7")]
    #[serde(deserialize_with = "lenient::string")]
    pub text: String,
    #[prost(bool, tag = "8")]
    pub is_sent: bool,
    #[prost(bool, tag = "9")]
    pub is_delivered: bool,
    #[prost(bool, tag = "10")]
    pub is_read: bool,
    #[prost(string, tag = "11")]
    #[serde(deserialize_with = "lenient::string")]
    pub emoji_reaction: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Deserialize)]
#[serde(default)]
pub struct ThreadUpdate {
    #[prost(string, tag = "1")]
    #[serde(deserialize_with = "lenient::string")]
    pub thread_id: String,
    #[prost(string, tag = "2")]
    #[serde(deserialize_with = "lenient::string")]
    pub thread_v2_id: String,
    #[prost(int64, repeated, tag = "3")]
    #[serde(deserialize_with = "lenient::i64_vec")]
    pub user_ids: Vec<i64>,
    #[prost(string, tag = "4")]
    #[serde(deserialize_with = "lenient::string")]
    pub thread_title: String,
    #[prost(int64, tag = "5")]
    #[serde(deserialize_with = "lenient::i64")]
    pub last_activity_at: i64,
    #[prost(bool, optional, tag = "6")]
    pub is_group: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub is_archived: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub is_muted: Option<bool>,
    #[prost(string, tag = "9")]
    #[serde(deserialize_with = "lenient::string")]
    pub thread_type: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Deserialize)]
#[serde(default)]
pub struct TypingIndicator {
    #[prost(int64, tag = "1")]
    #[serde(deserialize_with = "lenient::i64")]
    pub thread_id: i64,
    #[prost(int64, tag = "2")]
    #[serde(deserialize_with = "lenient::i64")]
    pub from_user_id: i64,
    #[prost(string, tag = "3")]
    #[serde(deserialize_with = "lenient::string")]
    pub state: String,
    #[prost(int64, tag = "4")]
    #[serde(deserialize_with = "lenient::i64")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Deserialize)]
#[serde(default)]
pub struct PresenceIndicator {
    #[prost(int64, tag = "1")]
    #[serde(deserialize_with = "lenient::i64")]
    pub user_id: i64,
    #[prost(string, tag = "2")]
    #[serde(deserialize_with = "lenient::string")]
    pub status: String,
    #[prost(int64, tag = "3")]
    #[serde(deserialize_with = "lenient::i64")]
    pub last_seen_at: i64,
}

fn non_empty(value: &str) -> Option<String> { (!value.is_empty()).then(|| value.to_owned()) }

fn non_zero(value: i64) -> Option<i64> { (value != 0).then_some(value) }

impl IrisPayload {
    /// Convert to a delta batch. Items carrying no record are skipped.
    #[must_use]
    pub fn into_batch(self) -> DeltaBatch {
        let seq_id = non_zero(self.seq_id);
        let items = self
            .items
            .into_iter()
            .filter_map(IrisItem::into_delta)
            .map(|mut item| {
                item.seq_id = seq_id;
                item
            })
            .collect();
        DeltaBatch { seq_id, items }
    }
}

impl IrisItem {
    fn operation(&self) -> Operation {
        [self.op.as_str(), self.kind.as_str()]
            .into_iter()
            .filter(|tag| !tag.is_empty())
            .find_map(Operation::parse)
            .unwrap_or_default()
    }

    /// Convert to a delta item, or `None` when no record field is set.
    #[must_use]
    pub fn into_delta(self) -> Option<DeltaItem> {
        let op = self.operation();
        let record = if let Some(m) = self.message {
            DeltaRecord::Message(MessageDelta {
                item_id: non_empty(&m.item_id).unwrap_or(self.id),
                thread_id: non_empty(&m.thread_id).or_else(|| non_empty(&m.thread_v2_id)),
                sender_id: non_zero(m.user_id).map(|id| id.to_string()),
                item_type: non_empty(&m.item_type),
                text: non_empty(&m.text),
                timestamp: non_zero(m.timestamp).or_else(|| non_zero(self.timestamp)),
                is_sent: m.is_sent.then_some(true),
                is_delivered: m.is_delivered.then_some(true),
                is_read: m.is_read.then_some(true),
                reaction: non_empty(&m.emoji_reaction),
            })
        } else if let Some(t) = self.thread {
            DeltaRecord::Thread(ThreadDelta {
                thread_id: non_empty(&t.thread_id).unwrap_or(t.thread_v2_id),
                title: non_empty(&t.thread_title),
                participant_ids: (!t.user_ids.is_empty())
                    .then(|| t.user_ids.iter().map(ToString::to_string).collect()),
                is_group: t.is_group,
                last_activity_at: non_zero(t.last_activity_at),
                muted: t.is_muted,
                archived: t.is_archived,
            })
        } else if let Some(t) = self.typing {
            DeltaRecord::Typing(TypingDelta {
                thread_id: t.thread_id.to_string(),
                user_id: non_zero(t.from_user_id).map(|id| id.to_string()),
                is_active: !t.state.eq_ignore_ascii_case("stopped"),
                timestamp: non_zero(t.timestamp),
            })
        } else if let Some(p) = self.presence {
            DeltaRecord::Presence(PresenceDelta {
                user_id: p.user_id.to_string(),
                status: non_empty(&p.status),
                last_activity_at: non_zero(p.last_seen_at),
            })
        } else {
            tracing::trace!(id = %self.id, path = %self.path, "iris item without record");
            return None;
        };
        Some(DeltaItem::new(op, record))
    }
}

/// Decoder for the iris delta stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct IrisDecoder;

impl Decode for IrisDecoder {
    fn decode(&self, payload: &Bytes) -> Result<DecodedRecord, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        // A protobuf frame of this schema never starts with `{` or `[`.
        if looks_like_json(payload) {
            if let Ok(value) = serde_json::from_slice::<Value>(payload) {
                return Ok(from_json(value));
            }
        }
        let binary = match IrisPayload::decode(&payload[..]) {
            Ok(frame) => return Ok(DecodedRecord::Delta(frame.into_batch())),
            Err(err) => err,
        };
        tracing::debug!(error = %binary, "iris protobuf decode failed; trying JSON");
        serde_json::from_slice::<Value>(payload)
            .map(from_json)
            .map_err(|json| DecodeError::Unrecognised {
                binary: binary.to_string(),
                json: json.to_string(),
            })
    }
}

fn looks_like_json(payload: &[u8]) -> bool {
    payload
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| matches!(b, b'{' | b'['))
}

/// Interpret a JSON iris frame; documents without delta content are
/// returned as [`JsonKind::Iris`] records.
fn from_json(value: Value) -> DecodedRecord {
    match json_batch(&value) {
        Some(batch) if !batch.is_empty() || batch.seq_id.is_some() => DecodedRecord::Delta(batch),
        _ => DecodedRecord::Json {
            kind: JsonKind::Iris,
            value,
        },
    }
}

fn json_batch(value: &Value) -> Option<DeltaBatch> {
    match value {
        Value::Array(elements) => {
            let mut merged = DeltaBatch::default();
            for batch in elements.iter().filter_map(json_batch) {
                merged.seq_id = merged.seq_id.max(batch.seq_id);
                merged.items.extend(batch.items);
            }
            Some(merged)
        }
        Value::Object(obj) if obj.get("items").is_some_and(Value::is_array) => {
            let mut normalised = value.clone();
            if let Some(items) = normalised.get_mut("items").and_then(Value::as_array_mut) {
                items.iter_mut().for_each(hoist_data);
            }
            serde_json::from_value::<IrisPayload>(normalised)
                .map(IrisPayload::into_batch)
                .ok()
        }
        Value::Object(obj) => {
            let entries = obj.get("data").and_then(Value::as_array)?;
            let seq_id = obj.get("seq_id").and_then(LenientValue::as_lenient_i64);
            let items = entries
                .iter()
                .filter_map(|entry| path_entry(entry, seq_id))
                .collect();
            Some(DeltaBatch { seq_id, items })
        }
        _ => None,
    }
}

/// Move the fields of an item's `data` wrapper up into the item.
fn hoist_data(item: &mut Value) {
    let Some(obj) = item.as_object_mut() else { return };
    if let Some(Value::Object(data)) = obj.remove("data") {
        for (key, value) in data {
            obj.entry(key).or_insert(value);
        }
    }
}

/// Target of a message-sync path.
#[derive(Debug, PartialEq, Eq)]
enum SyncPath<'a> {
    Item { thread_id: &'a str, item_id: &'a str },
    Typing { thread_id: &'a str },
    Thread { thread_id: &'a str },
}

fn parse_sync_path(path: &str) -> Option<SyncPath<'_>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["direct_v2", "threads", thread_id, "items", item_id, ..] => Some(SyncPath::Item { thread_id, item_id }),
        ["direct_v2", "threads", thread_id, "activity_indicator_id", ..] => Some(SyncPath::Typing { thread_id }),
        ["direct_v2", "threads", thread_id] | ["direct_v2", "inbox", "threads", thread_id, ..] => {
            Some(SyncPath::Thread { thread_id })
        }
        _ => None,
    }
}

fn first<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(key))
        .find(|v| !v.is_null())
}

fn path_entry(entry: &Value, seq_id: Option<i64>) -> Option<DeltaItem> {
    let path = entry.get("path").and_then(Value::as_str)?;
    let target = parse_sync_path(path)?;
    let op = entry
        .get("op")
        .and_then(Value::as_str)
        .and_then(Operation::parse)
        .unwrap_or_default();
    let value = match entry.get("value") {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    let string = |keys: &[&str]| first(&value, keys).and_then(LenientValue::as_lenient_string);
    let int = |keys: &[&str]| first(&value, keys).and_then(LenientValue::as_lenient_i64);
    let flag = |keys: &[&str]| first(&value, keys).and_then(LenientValue::as_lenient_bool);

    let record = match target {
        SyncPath::Item { thread_id, item_id } => DeltaRecord::Message(MessageDelta {
            item_id: string(&["item_id", "id"]).unwrap_or_else(|| item_id.to_owned()),
            thread_id: Some(thread_id.to_owned()),
            sender_id: string(&["user_id", "from_user_id", "sender_id"]),
            item_type: string(&["item_type"]),
            text: string(&["text"]),
            timestamp: int(&["timestamp"]),
            is_sent: None,
            is_delivered: None,
            is_read: None,
            reaction: reaction_of(&value),
        }),
        SyncPath::Typing { thread_id } => DeltaRecord::Typing(TypingDelta {
            thread_id: thread_id.to_owned(),
            user_id: string(&["sender_id", "from_user_id", "user_id"]),
            is_active: int(&["activity_status"]).is_none_or(|status| status != 0),
            timestamp: int(&["timestamp"]),
        }),
        SyncPath::Thread { thread_id } => DeltaRecord::Thread(ThreadDelta {
            thread_id: thread_id.to_owned(),
            title: string(&["thread_title", "title"]),
            participant_ids: participants(&value),
            is_group: flag(&["is_group"]),
            last_activity_at: int(&["last_activity_at"]),
            muted: flag(&["muted", "is_muted"]),
            archived: flag(&["archived", "is_archived"]),
        }),
    };
    Some(DeltaItem {
        op,
        seq_id,
        record,
    })
}

fn reaction_of(value: &Value) -> Option<String> {
    if let Some(emoji) = first(value, &["emoji", "emoji_reaction"]).and_then(Value::as_str) {
        return Some(emoji.to_owned());
    }
    value
        .pointer("/reactions/emojis")
        .and_then(Value::as_array)
        .and_then(|emojis| emojis.last())
        .and_then(|last| last.get("emoji"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

fn participants(value: &Value) -> Option<Vec<String>> {
    if let Some(users) = value.get("users").and_then(Value::as_array) {
        return Some(
            users
                .iter()
                .filter_map(|user| first(user, &["pk", "pk_id", "id"]))
                .filter_map(LenientValue::as_lenient_string)
                .collect(),
        );
    }
    value.get("user_ids").and_then(Value::as_array).map(|ids| {
        ids.iter()
            .filter_map(LenientValue::as_lenient_string)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn decode(payload: &[u8]) -> Result<DecodedRecord, DecodeError> {
        IrisDecoder.decode(&Bytes::copy_from_slice(payload))
    }

    fn batch(record: DecodedRecord) -> DeltaBatch {
        match record {
            DecodedRecord::Delta(batch) => batch,
            other => panic!("expected delta batch, got {other:?}"),
        }
    }

    #[test]
    fn protobuf_frames_decode_to_typed_items() {
        let frame = IrisPayload {
            action: "sync".into(),
            seq_id: 41,
            items: vec![
                IrisItem {
                    op: "add".into(),
                    message: Some(MessageSyncMessage {
                        item_id: "m1".into(),
                        user_id: 7,
                        thread_v2_id: "t1".into(),
                        text: "hi".into(),
                        is_sent: true,
                        ..MessageSyncMessage::default()
                    }),
                    ..IrisItem::default()
                },
                IrisItem {
                    op: "replace".into(),
                    thread: Some(ThreadUpdate {
                        thread_id: "t1".into(),
                        thread_title: "Alice".into(),
                        user_ids: vec![7, 8],
                        ..ThreadUpdate::default()
                    }),
                    ..IrisItem::default()
                },
                IrisItem {
                    typing: Some(TypingIndicator {
                        thread_id: 99,
                        from_user_id: 7,
                        state: "stopped".into(),
                        timestamp: 0,
                    }),
                    ..IrisItem::default()
                },
                IrisItem::default(),
            ],
        };
        let decoded = batch(decode(&frame.encode_to_vec()).expect("decode"));
        assert_eq!(decoded.seq_id, Some(41));
        assert_eq!(decoded.len(), 3, "record-less items are skipped");

        let DeltaRecord::Message(message) = &decoded.items[0].record else {
            panic!("message expected");
        };
        assert_eq!(message.thread_id.as_deref(), Some("t1"));
        assert_eq!(message.sender_id.as_deref(), Some("7"));
        assert_eq!(message.is_sent, Some(true));
        assert_eq!(message.is_read, None);
        assert_eq!(decoded.items[0].seq_id, Some(41));

        assert_eq!(decoded.items[1].op, Operation::Update);
        let DeltaRecord::Typing(typing) = &decoded.items[2].record else {
            panic!("typing expected");
        };
        assert!(!typing.is_active);
        assert_eq!(typing.thread_id, "99");
    }

    #[test]
    fn unset_thread_flags_are_left_alone() {
        let update = |thread: ThreadUpdate| IrisPayload {
            action: "sync".into(),
            seq_id: 7,
            items: vec![IrisItem {
                op: "update".into(),
                thread: Some(thread),
                ..IrisItem::default()
            }],
        };
        let thread = |frame: IrisPayload| match batch(decode(&frame.encode_to_vec()).expect("decode"))
            .items
            .remove(0)
            .record
        {
            DeltaRecord::Thread(thread) => thread,
            other => panic!("thread expected, got {other:?}"),
        };

        let renamed = thread(update(ThreadUpdate {
            thread_id: "t1".into(),
            thread_title: "Renamed".into(),
            ..ThreadUpdate::default()
        }));
        assert_eq!(renamed.title.as_deref(), Some("Renamed"));
        assert_eq!((renamed.is_group, renamed.muted, renamed.archived), (None, None, None));

        let unmuted = thread(update(ThreadUpdate {
            thread_id: "t1".into(),
            is_muted: Some(false),
            ..ThreadUpdate::default()
        }));
        assert_eq!(unmuted.muted, Some(false));
        assert_eq!(unmuted.archived, None);
    }

    #[test]
    fn protobuf_shaped_json_is_accepted() {
        let payload = json!({
            "seq_id": "12",
            "items": [
                {"op": "delete", "data": {"message": {"item_id": "m9", "thread_id": "t1"}}},
                {"presence": {"user_id": "5", "status": "active", "last_seen_at": 10}}
            ]
        });
        let decoded = batch(decode(payload.to_string().as_bytes()).expect("decode"));
        assert_eq!(decoded.seq_id, Some(12));
        assert_eq!(decoded.items[0].op, Operation::Delete);
        assert_eq!(decoded.items[0].record.key(), "m9");
        assert_eq!(decoded.items[1].record.key(), "5");
    }

    #[test]
    fn message_sync_paths_are_decoded() {
        let payload = json!([{
            "event": "patch",
            "seq_id": 300,
            "data": [
                {
                    "op": "add",
                    "path": "/direct_v2/threads/340282366841710300949128/items/2960",
                    "value": "{\"item_id\":\"2960\",\"user_id\":1234,\"timestamp\":\"1700000000000000\",\"item_type\":\"text\",\"text\":\"hey\"}"
                },
                {
                    "op": "replace",
                    "path": "/direct_v2/inbox/threads/340282366841710300949128",
                    "value": {"thread_title": "Alice", "users": [{"pk": 1234}]}
                },
                {
                    "op": "add",
                    "path": "/direct_v2/threads/340282366841710300949128/activity_indicator_id/abc",
                    "value": "{\"activity_status\":1,\"sender_id\":\"1234\"}"
                },
                {"op": "add", "path": "/direct_v2/visual_action_badge", "value": "{}"}
            ]
        }]);
        let decoded = batch(decode(payload.to_string().as_bytes()).expect("decode"));
        assert_eq!(decoded.seq_id, Some(300));
        assert_eq!(decoded.len(), 3);

        let DeltaRecord::Message(message) = &decoded.items[0].record else {
            panic!("message expected");
        };
        assert_eq!(message.item_id, "2960");
        assert_eq!(message.thread_id.as_deref(), Some("340282366841710300949128"));
        assert_eq!(message.sender_id.as_deref(), Some("1234"));
        assert_eq!(message.timestamp, Some(1_700_000_000_000_000));

        let DeltaRecord::Thread(thread) = &decoded.items[1].record else {
            panic!("thread expected");
        };
        assert_eq!(thread.title.as_deref(), Some("Alice"));
        assert_eq!(thread.participant_ids, Some(vec!["1234".to_owned()]));

        let DeltaRecord::Typing(typing) = &decoded.items[2].record else {
            panic!("typing expected");
        };
        assert!(typing.is_active);
    }

    #[test]
    fn json_without_deltas_is_surfaced_as_iris_json() {
        let record = decode(br#"{"succeeded": true}"#).expect("decode");
        assert_eq!(
            record,
            DecodedRecord::Json {
                kind: JsonKind::Iris,
                value: json!({"succeeded": true}),
            }
        );
    }

    #[rstest]
    #[case(b"" as &[u8])]
    #[case(b"\xFF\xFF\xFF")]
    fn undecodable_payloads_are_errors(#[case] payload: &[u8]) {
        assert!(decode(payload).is_err());
    }

    #[rstest]
    #[case("/direct_v2/threads/1/items/2", Some(SyncPath::Item { thread_id: "1", item_id: "2" }))]
    #[case("/direct_v2/threads/1", Some(SyncPath::Thread { thread_id: "1" }))]
    #[case("/direct_v2/inbox/threads/1", Some(SyncPath::Thread { thread_id: "1" }))]
    #[case("/direct_v2/threads/1/activity_indicator_id/x", Some(SyncPath::Typing { thread_id: "1" }))]
    #[case("/direct_v2/threads/1/participants/2/has_seen", None)]
    fn sync_paths(#[case] path: &str, #[case] expected: Option<SyncPath<'static>>) {
        assert_eq!(parse_sync_path(path), expected);
    }
}
