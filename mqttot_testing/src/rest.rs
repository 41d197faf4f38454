//! Scriptable [`RestCollaborator`].

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use mqttot::{
    delta::MessageDelta,
    rest::{InboxSnapshot, RestCollaborator, RestError, UserInfo},
};

/// REST stub returning queued responses.
///
/// Snapshot requests pop the snapshot queue and fall back to the default
/// snapshot once it is empty. Thread requests pop that thread's queue;
/// an empty queue answers with an empty page.
#[derive(Debug, Default)]
pub struct StubRest {
    default_snapshot: Mutex<InboxSnapshot>,
    snapshots: Mutex<VecDeque<Result<InboxSnapshot, u16>>>,
    threads: Mutex<HashMap<String, VecDeque<Result<Vec<MessageDelta>, u16>>>>,
    snapshot_delay: Mutex<Option<Duration>>,
    snapshot_calls: AtomicUsize,
    thread_calls: AtomicUsize,
}

impl StubRest {
    /// Stub answering every snapshot request with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: InboxSnapshot) -> Self {
        Self {
            default_snapshot: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    /// Answer the next snapshot request with `snapshot`.
    pub fn queue_snapshot(&self, snapshot: InboxSnapshot) {
        self.snapshots.lock().expect("stub lock").push_back(Ok(snapshot));
    }

    /// Fail the next snapshot request with HTTP `status`.
    pub fn fail_snapshot(&self, status: u16) {
        self.snapshots.lock().expect("stub lock").push_back(Err(status));
    }

    /// Hold every later snapshot response for `delay`.
    pub fn delay_snapshots(&self, delay: Duration) { *self.snapshot_delay.lock().expect("stub lock") = Some(delay); }

    /// Answer the next backfill of `thread_id` with `messages`.
    pub fn queue_messages(&self, thread_id: &str, messages: Vec<MessageDelta>) {
        self.thread_queue(thread_id, Ok(messages));
    }

    /// Fail the next backfill of `thread_id` with HTTP `status`.
    pub fn fail_messages(&self, thread_id: &str, status: u16) { self.thread_queue(thread_id, Err(status)); }

    fn thread_queue(&self, thread_id: &str, response: Result<Vec<MessageDelta>, u16>) {
        self.threads
            .lock()
            .expect("stub lock")
            .entry(thread_id.to_owned())
            .or_default()
            .push_back(response);
    }

    /// Snapshot requests served.
    #[must_use]
    pub fn snapshot_calls(&self) -> usize { self.snapshot_calls.load(Ordering::SeqCst) }

    /// Thread backfills served.
    #[must_use]
    pub fn thread_calls(&self) -> usize { self.thread_calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl RestCollaborator for StubRest {
    async fn inbox_snapshot(&self) -> Result<InboxSnapshot, RestError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.snapshot_delay.lock().expect("stub lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.snapshots.lock().expect("stub lock").pop_front();
        match queued {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(status)) => Err(RestError::Status { status }),
            None => Ok(self.default_snapshot.lock().expect("stub lock").clone()),
        }
    }

    async fn thread_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<MessageDelta>, RestError> {
        self.thread_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .threads
            .lock()
            .expect("stub lock")
            .get_mut(thread_id)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(Ok(mut messages)) => {
                messages.truncate(limit);
                Ok(messages)
            }
            Some(Err(status)) => Err(RestError::Status { status }),
            None => Ok(Vec::new()),
        }
    }

    async fn user_info(&self, user_id: &str) -> Result<UserInfo, RestError> {
        Ok(UserInfo {
            user_id: user_id.to_owned(),
            username: format!("user_{user_id}"),
            full_name: None,
        })
    }
}
