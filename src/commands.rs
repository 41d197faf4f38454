//! Outbound direct commands.
//!
//! Every command is serialised into one JSON envelope
//! `{action, thread_id, item_type?, text?, timestamp, client_context, ...}`
//! and published, compressed, on [`SEND_MESSAGE`] at QoS 1.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::{
    connect::now_ms,
    topic::{Qos, SEND_MESSAGE},
    transport::{TransportError, TransportSession},
};

/// Status of a reaction command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReactionStatus {
    /// Add the reaction.
    #[default]
    Created,
    /// Remove the reaction.
    Deleted,
}

impl ReactionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
        }
    }
}

/// Notification streams that can be requested with [`Command::Subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    /// New followers.
    Follow,
    /// Mentions.
    Mention,
    /// Incoming calls.
    Call,
}

impl NotificationKind {
    fn subscription_type(self) -> &'static str {
        match self {
            Self::Follow => "follow_notifications",
            Self::Mention => "mention_notifications",
            Self::Call => "call_notifications",
        }
    }
}

/// An outbound action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Plain text message.
    SendText { thread_id: String, text: String },
    /// Text quoting an earlier item.
    Reply { thread_id: String, item_id: String, text: String },
    /// Share an uploaded media item.
    SendMedia { thread_id: String, media_id: String, text: Option<String> },
    /// Share a location.
    SendLocation { thread_id: String, location_id: String, text: Option<String> },
    /// Share a profile.
    SendProfile { thread_id: String, user_id: String, text: Option<String> },
    /// Share a hashtag.
    SendHashtag { thread_id: String, hashtag: String, text: Option<String> },
    /// Share a story.
    SendStory { thread_id: String, story_id: String, text: Option<String> },
    /// Send a like.
    SendLike { thread_id: String },
    /// Unsend an item.
    DeleteItem { thread_id: String, item_id: String },
    /// Replace an item's text.
    EditItem { thread_id: String, item_id: String, text: String },
    /// React to an item.
    Reaction {
        thread_id: String,
        item_id: String,
        reaction_type: String,
        status: ReactionStatus,
        emoji: Option<String>,
    },
    /// Mark an item as seen.
    MarkSeen { thread_id: String, item_id: String },
    /// Typing indicator.
    IndicateActivity { thread_id: String, is_active: bool },
    /// Add a participant.
    AddMember { thread_id: String, user_id: String },
    /// Remove a participant.
    RemoveMember { thread_id: String, user_id: String },
    /// Request a notification stream.
    Subscribe(NotificationKind),
    /// Broadcast the account's own presence.
    SendPresence { status: String },
}

impl Command {
    /// Text message shorthand.
    #[must_use]
    pub fn text(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::SendText {
            thread_id: thread_id.into(),
            text: text.into(),
        }
    }

    /// Like reaction shorthand.
    #[must_use]
    pub fn like(thread_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self::Reaction {
            thread_id: thread_id.into(),
            item_id: item_id.into(),
            reaction_type: "like".to_owned(),
            status: ReactionStatus::Created,
            emoji: None,
        }
    }

    /// Wire action name.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::SendText { .. }
            | Self::Reply { .. }
            | Self::SendMedia { .. }
            | Self::SendLocation { .. }
            | Self::SendProfile { .. }
            | Self::SendHashtag { .. }
            | Self::SendStory { .. }
            | Self::SendLike { .. } => "send_item",
            Self::DeleteItem { .. } => "delete_item",
            Self::EditItem { .. } => "edit_item",
            Self::Reaction { .. } => "send_reaction",
            Self::MarkSeen { .. } => "mark_as_seen",
            Self::IndicateActivity { .. } => "indicate_activity",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::Subscribe(_) => "subscribe",
            Self::SendPresence { .. } => "send_presence",
        }
    }

    fn thread_id(&self) -> Option<&str> {
        match self {
            Self::SendText { thread_id, .. }
            | Self::Reply { thread_id, .. }
            | Self::SendMedia { thread_id, .. }
            | Self::SendLocation { thread_id, .. }
            | Self::SendProfile { thread_id, .. }
            | Self::SendHashtag { thread_id, .. }
            | Self::SendStory { thread_id, .. }
            | Self::SendLike { thread_id }
            | Self::DeleteItem { thread_id, .. }
            | Self::EditItem { thread_id, .. }
            | Self::Reaction { thread_id, .. }
            | Self::MarkSeen { thread_id, .. }
            | Self::IndicateActivity { thread_id, .. }
            | Self::AddMember { thread_id, .. }
            | Self::RemoveMember { thread_id, .. } => Some(thread_id),
            Self::Subscribe(_) | Self::SendPresence { .. } => None,
        }
    }

    fn item_type(&self) -> Option<&'static str> {
        match self {
            Self::SendText { .. } | Self::Reply { .. } => Some("text"),
            Self::SendMedia { .. } => Some("media"),
            Self::SendLocation { .. } => Some("location"),
            Self::SendProfile { .. } => Some("profile"),
            Self::SendHashtag { .. } => Some("hashtag"),
            Self::SendStory { .. } => Some("story"),
            Self::SendLike { .. } => Some("like"),
            _ => None,
        }
    }

    fn text_field(&self) -> Option<String> {
        match self {
            Self::SendText { text, .. } | Self::Reply { text, .. } | Self::EditItem { text, .. } => Some(text.clone()),
            Self::SendMedia { text, .. }
            | Self::SendLocation { text, .. }
            | Self::SendProfile { text, .. }
            | Self::SendHashtag { text, .. }
            | Self::SendStory { text, .. } => Some(text.clone().unwrap_or_default()),
            _ => None,
        }
    }

    fn extra(&self) -> Map<String, Value> {
        let extra = match self {
            Self::Reply { item_id, .. } => json!({ "replying_to_item_id": item_id }),
            Self::SendMedia { media_id, .. } => json!({ "media_id": media_id }),
            Self::SendLocation { location_id, .. } => json!({ "location_id": location_id }),
            Self::SendProfile { user_id, .. } | Self::AddMember { user_id, .. } | Self::RemoveMember { user_id, .. } => {
                json!({ "user_id": user_id })
            }
            Self::SendHashtag { hashtag, .. } => json!({ "hashtag": hashtag }),
            Self::SendStory { story_id, .. } => json!({ "story_id": story_id }),
            Self::DeleteItem { item_id, .. } | Self::EditItem { item_id, .. } | Self::MarkSeen { item_id, .. } => {
                json!({ "item_id": item_id })
            }
            Self::Reaction {
                item_id,
                reaction_type,
                status,
                emoji,
                ..
            } => json!({
                "item_id": item_id,
                "reaction_type": reaction_type,
                "reaction_status": status.as_str(),
                "emoji": emoji.as_deref().unwrap_or_default(),
            }),
            Self::IndicateActivity { is_active, .. } => json!({ "is_active": is_active }),
            Self::Subscribe(kind) => json!({ "subscription_type": kind.subscription_type() }),
            Self::SendPresence { status } => json!({ "status": status }),
            Self::SendText { .. } | Self::SendLike { .. } => Value::Null,
        };
        match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Serialised form of a [`Command`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    /// Wire action name.
    pub action: &'static str,
    /// Target thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Item type for `send_item`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_type: Option<&'static str>,
    /// Message text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    /// Idempotency token; reuse it to correlate later edits or deletes.
    pub client_context: String,
    /// Action-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Envelope for `command` as of `timestamp`. A missing `client_context`
    /// is replaced by a fresh UUID v4.
    #[must_use]
    pub fn build(command: &Command, client_context: Option<String>, timestamp: u64) -> Self {
        Self {
            action: command.action(),
            thread_id: command.thread_id().map(str::to_owned),
            item_type: command.item_type(),
            text: command.text_field(),
            timestamp,
            client_context: client_context.unwrap_or_else(|| Uuid::new_v4().to_string()),
            fields: command.extra(),
        }
    }

    /// JSON bytes as published, before compression.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> { serde_json::to_vec(self) }
}

/// Builds [`Envelope`]s stamped with a clock.
#[derive(Clone, Copy, Debug)]
pub struct CommandEncoder {
    clock: fn() -> u64,
}

impl Default for CommandEncoder {
    fn default() -> Self { Self { clock: now_ms } }
}

impl CommandEncoder {
    /// Encoder using the wall clock.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Encoder using `clock` for envelope timestamps.
    #[must_use]
    pub fn with_clock(clock: fn() -> u64) -> Self { Self { clock } }

    /// Encode `command` with a fresh client context.
    #[must_use]
    pub fn encode(&self, command: &Command) -> Envelope { Envelope::build(command, None, (self.clock)()) }

    /// Encode `command` reusing `client_context`.
    #[must_use]
    pub fn encode_with_context(&self, command: &Command, client_context: impl Into<String>) -> Envelope {
        Envelope::build(command, Some(client_context.into()), (self.clock)())
    }
}

/// Anything commands can be published through.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic_id`.
    async fn publish(&self, topic_id: u16, payload: &[u8], qos: Qos) -> Result<(), TransportError>;
}

#[async_trait]
impl Publisher for TransportSession {
    async fn publish(&self, topic_id: u16, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
        TransportSession::publish(self, topic_id, payload, qos).await
    }
}

/// Publish `envelope` on the command topic.
///
/// # Errors
///
/// Publish failures are returned unchanged; nothing is retried here.
pub async fn publish_envelope<P>(publisher: &P, envelope: &Envelope) -> Result<(), TransportError>
where
    P: Publisher + ?Sized,
{
    let body = envelope.to_vec()?;
    debug!(
        action = envelope.action,
        thread_id = ?envelope.thread_id,
        client_context = %envelope.client_context,
        "sending command"
    );
    publisher.publish(SEND_MESSAGE.id, &body, SEND_MESSAGE.qos).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rstest::rstest;

    use super::*;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(u16, Vec<u8>, Qos)>>,
        fail: bool,
    }

    #[async_trait]
    impl Publisher for Recording {
        async fn publish(&self, topic_id: u16, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::AckTimeout {
                    packet_id: 3,
                    after: std::time::Duration::from_secs(1),
                });
            }
            self.sent.lock().expect("lock").push((topic_id, payload.to_vec(), qos));
            Ok(())
        }
    }

    fn value(envelope: &Envelope) -> Value { serde_json::to_value(envelope).expect("serialise") }

    #[test]
    fn text_envelope_shape() {
        let envelope = Envelope::build(&Command::text("t1", "hi"), Some("ctx".into()), 1_000);
        assert_eq!(
            value(&envelope),
            json!({
                "action": "send_item",
                "thread_id": "t1",
                "item_type": "text",
                "text": "hi",
                "timestamp": 1_000,
                "client_context": "ctx",
            })
        );
    }

    #[test]
    fn client_context_is_fresh_unless_supplied() {
        let command = Command::text("t1", "hi");
        let a = CommandEncoder::new().encode(&command);
        let b = CommandEncoder::new().encode(&command);
        assert_ne!(a.client_context, b.client_context);
        assert!(Uuid::parse_str(&a.client_context).is_ok());
        assert_eq!(CommandEncoder::new().encode_with_context(&command, "keep").client_context, "keep");
    }

    #[test]
    fn encoder_stamps_its_clock() {
        let encoder = CommandEncoder::with_clock(|| 42);
        assert_eq!(encoder.encode(&Command::text("t1", "hi")).timestamp, 42);
    }

    #[rstest]
    #[case(Command::like("t1", "i1"), "send_reaction", json!({"reaction_type": "like", "reaction_status": "created", "emoji": ""}))]
    #[case(Command::Reply { thread_id: "t1".into(), item_id: "i1".into(), text: "ok".into() }, "send_item", json!({"replying_to_item_id": "i1"}))]
    #[case(Command::DeleteItem { thread_id: "t1".into(), item_id: "i1".into() }, "delete_item", json!({"item_id": "i1"}))]
    #[case(Command::IndicateActivity { thread_id: "t1".into(), is_active: false }, "indicate_activity", json!({"is_active": false}))]
    #[case(Command::SendMedia { thread_id: "t1".into(), media_id: "m9".into(), text: None }, "send_item", json!({"media_id": "m9", "item_type": "media", "text": ""}))]
    #[case(Command::AddMember { thread_id: "t1".into(), user_id: "u2".into() }, "add_member", json!({"user_id": "u2"}))]
    fn action_specific_fields(#[case] command: Command, #[case] action: &str, #[case] expected: Value) {
        let encoded = value(&Envelope::build(&command, None, 0));
        assert_eq!(encoded["action"], action);
        assert_eq!(encoded["thread_id"], "t1");
        for (key, field) in expected.as_object().expect("object") {
            assert_eq!(&encoded[key], field, "field {key}");
        }
    }

    #[test]
    fn subscriptions_and_presence_carry_no_thread() {
        let follow = value(&Envelope::build(&Command::Subscribe(NotificationKind::Follow), None, 0));
        assert_eq!(follow["subscription_type"], "follow_notifications");
        assert!(follow.get("thread_id").is_none());

        let presence = value(&Envelope::build(
            &Command::SendPresence {
                status: "online".into(),
            },
            None,
            0,
        ));
        assert_eq!(presence["action"], "send_presence");
        assert_eq!(presence["status"], "online");
    }

    #[tokio::test]
    async fn envelopes_are_published_on_the_command_topic() {
        let publisher = Recording::default();
        let envelope = CommandEncoder::new().encode(&Command::text("t1", "hi"));
        publish_envelope(&publisher, &envelope).await.expect("publish");

        let sent = publisher.sent.lock().expect("lock");
        let (topic, body, qos) = &sent[0];
        assert_eq!(*topic, 132);
        assert_eq!(*qos, Qos::AtLeastOnce);
        let body: Value = serde_json::from_slice(body).expect("json");
        assert_eq!(body["client_context"], envelope.client_context.as_str());
    }

    #[tokio::test]
    async fn publish_errors_propagate_unchanged() {
        let publisher = Recording {
            fail: true,
            ..Recording::default()
        };
        let envelope = CommandEncoder::new().encode(&Command::text("t1", "hi"));
        let err = publish_envelope(&publisher, &envelope).await.expect_err("should fail");
        assert!(matches!(err, TransportError::AckTimeout { packet_id: 3, .. }));
    }
}
