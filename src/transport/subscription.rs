//! Subscription groups published after the handshake.

use serde_json::{Value, json};

use crate::topic::{self, TopicDescriptor};

/// One independently subscribed group of realtime topics.
///
/// Groups are requested by publishing a JSON document on the group's
/// topic rather than with MQTT SUBSCRIBE packets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionGroup {
    /// GraphQL subscriptions, published on `/ig_realtime_sub`.
    GraphQl(Vec<String>),
    /// Presence and typing subscriptions, published on `/pubsub`.
    Skywalker(Vec<String>),
    /// Direct message delta stream resumed from a sequence id, published on
    /// `/ig_sub_iris`.
    Iris {
        /// Sequence id to resume after.
        seq_id: i64,
        /// Snapshot time matching `seq_id`, in milliseconds.
        snapshot_at_ms: i64,
        /// Client app version the snapshot was taken with.
        app_version: String,
    },
}

impl SubscriptionGroup {
    /// Topic the request is published on.
    #[must_use]
    pub fn topic(&self) -> &'static TopicDescriptor {
        match self {
            Self::GraphQl(_) => &topic::REALTIME_SUB,
            Self::Skywalker(_) => &topic::PUBSUB,
            Self::Iris { .. } => &topic::IRIS_SUB,
        }
    }

    /// Short group name used in logs and events.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::GraphQl(_) => "graphql",
            Self::Skywalker(_) => "skywalker",
            Self::Iris { .. } => "iris",
        }
    }

    /// JSON request body.
    ///
    /// # Examples
    ///
    /// ```
    /// use mqttot::transport::SubscriptionGroup;
    /// use serde_json::json;
    ///
    /// let group = SubscriptionGroup::Skywalker(vec!["typing_subscribe".into()]);
    /// assert_eq!(group.payload(), json!({"sub": ["typing_subscribe"]}));
    /// ```
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::GraphQl(subs) | Self::Skywalker(subs) => json!({ "sub": subs }),
            Self::Iris {
                seq_id,
                snapshot_at_ms,
                app_version,
            } => json!({
                "seq_id": seq_id,
                "snapshot_at_ms": snapshot_at_ms,
                "snapshot_app_version": app_version,
            }),
        }
    }
}
