//! Typed delta items and the state records they mutate.

use serde::{Deserialize, Serialize};

/// Mutation requested by a delta item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Insert or overwrite.
    #[default]
    Add,
    /// Merge into an existing entry, creating it when absent.
    Update,
    /// Remove; absent keys are ignored.
    Delete,
}

impl Operation {
    /// Parse a wire operation tag. Empty tags mean [`Operation::Add`];
    /// unrecognised tags yield `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mqttot::delta::Operation;
    ///
    /// assert_eq!(Operation::parse(""), Some(Operation::Add));
    /// assert_eq!(Operation::parse("replace"), Some(Operation::Update));
    /// assert_eq!(Operation::parse("deletion"), Some(Operation::Delete));
    /// assert_eq!(Operation::parse("message"), None);
    /// ```
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "" | "add" | "insert" => Some(Self::Add),
            "update" | "replace" => Some(Self::Update),
            "delete" | "deletion" | "remove" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Lower-case name used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Delivery progress of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFlags {
    /// Accepted by the server.
    pub sent: bool,
    /// Delivered to the recipient device.
    pub delivered: bool,
    /// Seen by the recipient.
    pub read: bool,
}

/// Message fields carried by a delta. `None` leaves the stored value as is
/// on update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelta {
    /// Item id (state key).
    pub item_id: String,
    /// Owning thread.
    pub thread_id: Option<String>,
    /// Sender account id.
    pub sender_id: Option<String>,
    /// Item type such as `text`, `media` or `like`.
    pub item_type: Option<String>,
    /// Message text.
    pub text: Option<String>,
    /// Server timestamp (microseconds or milliseconds, as delivered).
    pub timestamp: Option<i64>,
    /// Marked as sent.
    pub is_sent: Option<bool>,
    /// Marked as delivered.
    pub is_delivered: Option<bool>,
    /// Marked as read.
    pub is_read: Option<bool>,
    /// Emoji reaction attached to the message.
    pub reaction: Option<String>,
}

/// Thread fields carried by a delta.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDelta {
    /// Thread id (state key).
    pub thread_id: String,
    /// Title.
    pub title: Option<String>,
    /// Participant account ids.
    pub participant_ids: Option<Vec<String>>,
    /// Group conversation flag.
    pub is_group: Option<bool>,
    /// Last activity timestamp.
    pub last_activity_at: Option<i64>,
    /// Muted flag.
    pub muted: Option<bool>,
    /// Archived flag.
    pub archived: Option<bool>,
}

/// Typing indicator carried by a delta.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingDelta {
    /// Thread id (state key).
    pub thread_id: String,
    /// Typing user.
    pub user_id: Option<String>,
    /// `false` when the user stopped typing.
    pub is_active: bool,
    /// Event timestamp.
    pub timestamp: Option<i64>,
}

/// Presence update carried by a delta.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDelta {
    /// User id (state key).
    pub user_id: String,
    /// Status such as `active` or `inactive`.
    pub status: Option<String>,
    /// Last activity timestamp.
    pub last_activity_at: Option<i64>,
}

impl PresenceDelta {
    /// Whether the status reports the user as gone.
    #[must_use]
    pub fn is_inactive(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("inactive"))
    }
}

/// Record payload of a [`DeltaItem`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeltaRecord {
    /// Message change.
    Message(MessageDelta),
    /// Thread metadata change.
    Thread(ThreadDelta),
    /// Typing indicator.
    Typing(TypingDelta),
    /// Presence change.
    Presence(PresenceDelta),
}

impl DeltaRecord {
    /// Record kind name used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Thread(_) => "thread",
            Self::Typing(_) => "typing",
            Self::Presence(_) => "presence",
        }
    }

    /// State key the record addresses.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Message(m) => &m.item_id,
            Self::Thread(t) => &t.thread_id,
            Self::Typing(t) => &t.thread_id,
            Self::Presence(p) => &p.user_id,
        }
    }
}

/// One incremental state change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaItem {
    /// Requested mutation.
    #[serde(default)]
    pub op: Operation,
    /// Stream position, when the payload carried one.
    #[serde(default)]
    pub seq_id: Option<i64>,
    /// Record to apply.
    #[serde(flatten)]
    pub record: DeltaRecord,
}

impl DeltaItem {
    /// Build an item without a stream position.
    #[must_use]
    pub fn new(op: Operation, record: DeltaRecord) -> Self {
        Self {
            op,
            seq_id: None,
            record,
        }
    }

    /// Shorthand for a message item.
    #[must_use]
    pub fn message(op: Operation, message: MessageDelta) -> Self { Self::new(op, DeltaRecord::Message(message)) }

    /// Shorthand for a thread item.
    #[must_use]
    pub fn thread(op: Operation, thread: ThreadDelta) -> Self { Self::new(op, DeltaRecord::Thread(thread)) }
}

/// Items decoded from one inbound frame, applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaBatch {
    /// Stream sequence id of the frame, if present.
    pub seq_id: Option<i64>,
    /// Items in arrival order.
    pub items: Vec<DeltaItem>,
}

impl DeltaBatch {
    /// Batch without a stream position.
    #[must_use]
    pub fn new(items: Vec<DeltaItem>) -> Self { Self { seq_id: None, items } }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize { self.items.len() }

    /// Whether the batch carries no items.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

/// Stored thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: String,
    pub title: String,
    pub participant_ids: Vec<String>,
    pub is_group: bool,
    pub last_activity_at: Option<i64>,
    pub muted: bool,
    pub archived: bool,
}

/// Stored message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    pub item_id: String,
    pub thread_id: String,
    pub sender_id: Option<String>,
    pub item_type: String,
    pub text: Option<String>,
    pub timestamp: Option<i64>,
    pub delivery: DeliveryFlags,
    pub reaction: Option<String>,
}

/// Stored typing indicator; one per thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingState {
    pub thread_id: String,
    pub user_id: Option<String>,
    pub is_active: bool,
    pub timestamp: Option<i64>,
}

/// Stored presence; one per user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: String,
    pub status: String,
    pub last_activity_at: Option<i64>,
}

/// A stored record that a delta patch can create, merge into, or terminate.
pub(crate) trait Record: Sized {
    type Patch;

    fn key(patch: &Self::Patch) -> &str;
    fn from_patch(patch: &Self::Patch) -> Self;
    fn merge(&mut self, patch: &Self::Patch);

    /// Whether the patch itself reports the entry as finished.
    fn is_terminal(_patch: &Self::Patch) -> bool { false }
}

fn merge_opt<T: Clone>(slot: &mut T, value: Option<&T>) {
    if let Some(value) = value {
        slot.clone_from(value);
    }
}

impl Record for MessageState {
    type Patch = MessageDelta;

    fn key(patch: &MessageDelta) -> &str { &patch.item_id }

    fn from_patch(patch: &MessageDelta) -> Self {
        let mut state = Self {
            item_id: patch.item_id.clone(),
            item_type: "text".to_owned(),
            ..Self::default()
        };
        state.merge(patch);
        state
    }

    fn merge(&mut self, patch: &MessageDelta) {
        merge_opt(&mut self.thread_id, patch.thread_id.as_ref());
        merge_opt(&mut self.item_type, patch.item_type.as_ref());
        if patch.sender_id.is_some() {
            self.sender_id.clone_from(&patch.sender_id);
        }
        if patch.text.is_some() {
            self.text.clone_from(&patch.text);
        }
        if patch.timestamp.is_some() {
            self.timestamp = patch.timestamp;
        }
        if patch.reaction.is_some() {
            self.reaction.clone_from(&patch.reaction);
        }
        merge_opt(&mut self.delivery.sent, patch.is_sent.as_ref());
        merge_opt(&mut self.delivery.delivered, patch.is_delivered.as_ref());
        merge_opt(&mut self.delivery.read, patch.is_read.as_ref());
    }
}

impl Record for ThreadState {
    type Patch = ThreadDelta;

    fn key(patch: &ThreadDelta) -> &str { &patch.thread_id }

    fn from_patch(patch: &ThreadDelta) -> Self {
        let mut state = Self {
            thread_id: patch.thread_id.clone(),
            ..Self::default()
        };
        state.merge(patch);
        state
    }

    fn merge(&mut self, patch: &ThreadDelta) {
        merge_opt(&mut self.title, patch.title.as_ref());
        merge_opt(&mut self.participant_ids, patch.participant_ids.as_ref());
        merge_opt(&mut self.is_group, patch.is_group.as_ref());
        merge_opt(&mut self.muted, patch.muted.as_ref());
        merge_opt(&mut self.archived, patch.archived.as_ref());
        if patch.last_activity_at.is_some() {
            self.last_activity_at = patch.last_activity_at;
        }
    }
}

impl Record for TypingState {
    type Patch = TypingDelta;

    fn key(patch: &TypingDelta) -> &str { &patch.thread_id }

    fn from_patch(patch: &TypingDelta) -> Self {
        Self {
            thread_id: patch.thread_id.clone(),
            user_id: patch.user_id.clone(),
            is_active: patch.is_active,
            timestamp: patch.timestamp,
        }
    }

    fn merge(&mut self, patch: &TypingDelta) {
        if patch.user_id.is_some() {
            self.user_id.clone_from(&patch.user_id);
        }
        if patch.timestamp.is_some() {
            self.timestamp = patch.timestamp;
        }
        self.is_active = patch.is_active;
    }

    fn is_terminal(patch: &TypingDelta) -> bool { !patch.is_active }
}

impl Record for PresenceState {
    type Patch = PresenceDelta;

    fn key(patch: &PresenceDelta) -> &str { &patch.user_id }

    fn from_patch(patch: &PresenceDelta) -> Self {
        Self {
            user_id: patch.user_id.clone(),
            status: patch.status.clone().unwrap_or_else(|| "active".to_owned()),
            last_activity_at: patch.last_activity_at,
        }
    }

    fn merge(&mut self, patch: &PresenceDelta) {
        merge_opt(&mut self.status, patch.status.as_ref());
        if patch.last_activity_at.is_some() {
            self.last_activity_at = patch.last_activity_at;
        }
    }

    fn is_terminal(patch: &PresenceDelta) -> bool { patch.is_inactive() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_merges_only_present_fields() {
        let mut state = MessageState::from_patch(&MessageDelta {
            item_id: "m1".into(),
            thread_id: Some("t1".into()),
            text: Some("hi".into()),
            ..MessageDelta::default()
        });
        state.merge(&MessageDelta {
            item_id: "m1".into(),
            is_read: Some(true),
            ..MessageDelta::default()
        });
        assert_eq!(state.text.as_deref(), Some("hi"));
        assert_eq!(state.thread_id, "t1");
        assert!(state.delivery.read);
    }

    #[test]
    fn delta_items_serialise_with_kind_tag() {
        let item = DeltaItem::thread(
            Operation::Update,
            ThreadDelta {
                thread_id: "t1".into(),
                title: Some("Alice".into()),
                ..ThreadDelta::default()
            },
        );
        let json = serde_json::to_value(&item).expect("serialise");
        assert_eq!(json["kind"], "thread");
        assert_eq!(json["op"], "update");
        assert_eq!(json["thread_id"], "t1");
    }
}
