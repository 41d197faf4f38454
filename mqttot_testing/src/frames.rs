//! Builders for message-sync frames in the JSON patch form.

use serde_json::{Value, json};

/// One patch entry adding or replacing an item in a thread.
#[must_use]
pub fn item(op: &str, thread_id: &str, item_id: &str, text: &str) -> Value {
    json!({
        "op": op,
        "path": format!("/direct_v2/threads/{thread_id}/items/{item_id}"),
        "value": {"item_id": item_id, "user_id": "7", "item_type": "text", "text": text},
    })
}

/// One patch entry removing an item.
#[must_use]
pub fn removal(thread_id: &str, item_id: &str) -> Value {
    json!({
        "op": "remove",
        "path": format!("/direct_v2/threads/{thread_id}/items/{item_id}"),
    })
}

/// One patch entry replacing thread metadata.
#[must_use]
pub fn thread(thread_id: &str, title: &str) -> Value {
    json!({
        "op": "replace",
        "path": format!("/direct_v2/inbox/threads/{thread_id}"),
        "value": {"thread_title": title},
    })
}

/// One patch entry for a typing indicator.
#[must_use]
pub fn typing(thread_id: &str, user_id: &str, active: bool) -> Value {
    json!({
        "op": "add",
        "path": format!("/direct_v2/threads/{thread_id}/activity_indicator_id/{user_id}"),
        "value": {"activity_status": i32::from(active), "sender_id": user_id},
    })
}

/// A message-sync frame at `seq_id` carrying `entries`.
#[must_use]
pub fn message_sync(seq_id: i64, entries: Vec<Value>) -> Value {
    json!({"event": "patch", "seq_id": seq_id, "data": entries})
}
