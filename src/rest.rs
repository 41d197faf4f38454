//! Boundary to the HTTP API used for snapshots, backfill and user lookups.
//!
//! The realtime client never performs HTTP itself. Applications provide a
//! [`RestCollaborator`] that wraps their authenticated HTTP client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::delta::{DeltaBatch, DeltaItem, MessageDelta, Operation, ThreadDelta};

/// Inbox state returned by the snapshot endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxSnapshot {
    /// Stream position the snapshot corresponds to.
    pub seq_id: Option<i64>,
    /// Server time the snapshot was taken, in milliseconds.
    pub snapshot_at_ms: Option<i64>,
    /// Threads in the inbox.
    pub threads: Vec<ThreadDelta>,
    /// Most recent messages of those threads.
    pub messages: Vec<MessageDelta>,
}

impl InboxSnapshot {
    /// Convert into a batch that upserts every thread, then every message.
    #[must_use]
    pub fn into_batch(self) -> DeltaBatch {
        let items = self
            .threads
            .into_iter()
            .map(|thread| DeltaItem::thread(Operation::Update, thread))
            .chain(
                self.messages
                    .into_iter()
                    .map(|message| DeltaItem::message(Operation::Update, message)),
            )
            .collect();
        DeltaBatch {
            seq_id: self.seq_id,
            items,
        }
    }
}

/// Profile data returned by a user lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Account id.
    pub user_id: String,
    /// Handle.
    pub username: String,
    /// Display name, if set.
    pub full_name: Option<String>,
}

/// Failure reported by a [`RestCollaborator`].
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// The server answered with a non-success status.
    #[error("request failed with status {status}")]
    Status { status: u16 },
    /// The response could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Any other transport or client failure.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// HTTP capabilities the realtime client depends on.
///
/// Implementations must be cancellation-safe: backfill futures are dropped
/// when the client disconnects.
#[async_trait]
pub trait RestCollaborator: Send + Sync {
    /// Fetch the inbox snapshot used on cold start and for stream gaps.
    async fn inbox_snapshot(&self) -> Result<InboxSnapshot, RestError>;

    /// Fetch up to `limit` of the most recent messages in a thread.
    async fn thread_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<MessageDelta>, RestError>;

    /// Look up a user's profile.
    async fn user_info(&self, user_id: &str) -> Result<UserInfo, RestError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaRecord;

    #[test]
    fn snapshot_batch_puts_threads_first() {
        let snapshot = InboxSnapshot {
            seq_id: Some(7),
            snapshot_at_ms: Some(1_000),
            threads: vec![ThreadDelta {
                thread_id: "t1".into(),
                ..ThreadDelta::default()
            }],
            messages: vec![MessageDelta {
                item_id: "m1".into(),
                thread_id: Some("t1".into()),
                ..MessageDelta::default()
            }],
        };
        let batch = snapshot.into_batch();
        assert_eq!(batch.seq_id, Some(7));
        assert!(matches!(batch.items[0].record, DeltaRecord::Thread(_)));
        assert!(matches!(batch.items[1].record, DeltaRecord::Message(_)));
        assert!(batch.items.iter().all(|item| item.op == Operation::Update));
    }
}
