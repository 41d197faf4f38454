//! Persisted session documents.

use serde::{Deserialize, Serialize};

/// Default GraphQL subscriptions requested on connect.
pub const DEFAULT_GRAPHQL_SUBS: [&str; 2] = ["ig_sub_direct", "ig_sub_direct_v2_message_sync"];
/// Default skywalker subscriptions requested on connect.
pub const DEFAULT_SKYWALKER_SUBS: [&str; 2] = ["presence_subscribe", "typing_subscribe"];

/// Broker session details, stored in `mqtt-session.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttSession {
    /// Credential session id used for the connection.
    pub session_id: Option<String>,
    /// Broker session id of the last successful connection.
    pub mqtt_session_id: Option<i64>,
    /// Time of the last successful connection, in milliseconds.
    pub last_connected_at: Option<u64>,
    /// Reconnect attempts since the last successful connection.
    pub reconnect_attempts: u32,
}

/// Subscription lists, stored in `subscriptions.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscriptions {
    /// GraphQL topic subscriptions.
    #[serde(rename = "graphQlSubs")]
    pub graphql: Vec<String>,
    /// Skywalker (presence/typing) subscriptions.
    #[serde(rename = "skywalkerSubs")]
    pub skywalker: Vec<String>,
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self {
            graphql: DEFAULT_GRAPHQL_SUBS.map(String::from).to_vec(),
            skywalker: DEFAULT_SKYWALKER_SUBS.map(String::from).to_vec(),
        }
    }
}

impl Subscriptions {
    /// Whether both lists are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.graphql.is_empty() && self.skywalker.is_empty() }
}

/// Delta stream position, stored in `seq-ids.json`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqIds {
    /// Last applied stream sequence id.
    pub seq_id: i64,
    /// Snapshot time the sequence id belongs to, in milliseconds.
    #[serde(default)]
    pub snapshot_at_ms: i64,
}

/// Everything the client persists between runs.
///
/// Also used as a partial update by
/// [`SessionStore::save`](super::SessionStore::save): only `Some` parts are
/// replaced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Broker session details.
    pub mqtt: Option<MqttSession>,
    /// Subscription lists.
    pub subscriptions: Option<Subscriptions>,
    /// Stream position.
    pub seq_ids: Option<SeqIds>,
}

impl SessionRecord {
    /// Whether a stream can be resumed without a fresh snapshot: a positive
    /// sequence id and at least one subscription are stored.
    ///
    /// # Examples
    ///
    /// ```
    /// use mqttot::persistence::{SeqIds, SessionRecord, Subscriptions};
    ///
    /// let mut record = SessionRecord::default();
    /// assert!(!record.is_resumable());
    /// record.subscriptions = Some(Subscriptions::default());
    /// record.seq_ids = Some(SeqIds { seq_id: 42, snapshot_at_ms: 1 });
    /// assert!(record.is_resumable());
    /// ```
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.seq_ids.is_some_and(|ids| ids.seq_id > 0) && self.subscriptions.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Replace every part present in `partial`; returns which parts changed.
    pub(super) fn merge(&mut self, partial: SessionRecord) -> Parts {
        let mut changed = Parts::default();
        if let Some(mqtt) = partial.mqtt {
            changed.mqtt = self.mqtt.as_ref() != Some(&mqtt);
            self.mqtt = Some(mqtt);
        }
        if let Some(subscriptions) = partial.subscriptions {
            changed.subscriptions = self.subscriptions.as_ref() != Some(&subscriptions);
            self.subscriptions = Some(subscriptions);
        }
        if let Some(seq_ids) = partial.seq_ids {
            changed.seq_ids = self.seq_ids != Some(seq_ids);
            self.seq_ids = Some(seq_ids);
        }
        changed
    }
}

/// Set of record parts, one per file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct Parts {
    pub mqtt: bool,
    pub subscriptions: bool,
    pub seq_ids: bool,
}

impl Parts {
    pub const ALL: Self = Self {
        mqtt: true,
        subscriptions: true,
        seq_ids: true,
    };

    pub fn any(self) -> bool { self.mqtt || self.subscriptions || self.seq_ids }

    pub fn union(self, other: Self) -> Self {
        Self {
            mqtt: self.mqtt || other.mqtt,
            subscriptions: self.subscriptions || other.subscriptions,
            seq_ids: self.seq_ids || other.seq_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn files_use_camel_case_and_snake_case_keys() {
        let mqtt = MqttSession {
            session_id: Some("abc".into()),
            mqtt_session_id: Some(42),
            last_connected_at: Some(1_700_000_000_000),
            reconnect_attempts: 2,
        };
        assert_eq!(
            serde_json::to_value(&mqtt).expect("serialise"),
            json!({
                "sessionId": "abc",
                "mqttSessionId": 42,
                "lastConnectedAt": 1_700_000_000_000_u64,
                "reconnectAttempts": 2,
            })
        );
        let subs: Subscriptions =
            serde_json::from_value(json!({"graphQlSubs": ["a"], "skywalkerSubs": []})).expect("deserialise");
        assert_eq!(subs.graphql, ["a"]);
        let seq: SeqIds = serde_json::from_value(json!({"seq_id": 9})).expect("deserialise");
        assert_eq!(seq, SeqIds {
            seq_id: 9,
            snapshot_at_ms: 0,
        });
    }

    #[test]
    fn merge_reports_changed_parts_only() {
        let mut record = SessionRecord::default();
        let changed = record.merge(SessionRecord {
            seq_ids: Some(SeqIds {
                seq_id: 1,
                snapshot_at_ms: 2,
            }),
            ..SessionRecord::default()
        });
        assert_eq!(changed, Parts {
            seq_ids: true,
            ..Parts::default()
        });
        let unchanged = record.merge(record.clone());
        assert!(!unchanged.any());
    }

    #[test]
    fn zero_seq_id_is_not_resumable() {
        let record = SessionRecord {
            subscriptions: Some(Subscriptions::default()),
            seq_ids: Some(SeqIds::default()),
            mqtt: None,
        };
        assert!(!record.is_resumable());
    }
}
