//! The delta sync engine.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::model::{
    DeltaBatch,
    DeltaItem,
    DeltaRecord,
    MessageState,
    Operation,
    PresenceState,
    Record,
    ThreadState,
    TypingState,
};
use crate::metrics;

/// The four state maps maintained by the engine.
///
/// Cloning yields a fully independent copy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Threads by thread id.
    pub threads: BTreeMap<String, ThreadState>,
    /// Messages by item id.
    pub messages: BTreeMap<String, MessageState>,
    /// Typing indicators by thread id.
    pub typing: BTreeMap<String, TypingState>,
    /// Presence by user id.
    pub presence: BTreeMap<String, PresenceState>,
}

impl SyncState {
    /// Look up a thread.
    #[must_use]
    pub fn thread(&self, thread_id: &str) -> Option<&ThreadState> { self.threads.get(thread_id) }

    /// Messages of a thread ordered by timestamp, then item id.
    #[must_use]
    pub fn thread_messages(&self, thread_id: &str) -> Vec<&MessageState> {
        let mut messages: Vec<_> = self
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .collect();
        messages.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        messages
    }

    /// Active typing indicator of a thread.
    #[must_use]
    pub fn typing_in(&self, thread_id: &str) -> Option<&TypingState> { self.typing.get(thread_id) }

    /// Presence of a user.
    #[must_use]
    pub fn presence_of(&self, user_id: &str) -> Option<&PresenceState> { self.presence.get(user_id) }

    /// Thread ids referenced by messages but not yet known as threads.
    #[must_use]
    pub fn orphan_thread_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .messages
            .values()
            .map(|m| m.thread_id.as_str())
            .filter(|id| !id.is_empty() && !self.threads.contains_key(*id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Per-operation mutation counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounters {
    pub add: u64,
    pub update: u64,
    pub delete: u64,
}

/// Entry counts and counters returned by [`DeltaSyncEngine::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub threads: usize,
    pub messages: usize,
    pub typing: usize,
    pub presence: usize,
    pub operations: OperationCounters,
}

/// Effect of applying one item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new entry was stored (or an existing one overwritten by `add`).
    Added,
    /// An existing entry was merged.
    Updated,
    /// An entry was removed.
    Deleted,
    /// Nothing changed (delete of an absent key).
    Unchanged,
}

impl Outcome {
    /// Whether state was mutated.
    #[must_use]
    pub fn is_mutation(self) -> bool { !matches!(self, Self::Unchanged) }

    /// Lower-case label used in metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "add",
            Self::Updated => "update",
            Self::Deleted => "delete",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of [`DeltaSyncEngine::apply_batch`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Items that mutated state.
    pub applied: usize,
    /// Items in the batch.
    pub total: usize,
    /// Per-item outcome in batch order.
    pub outcomes: Vec<Outcome>,
}

/// Observer invoked once per batch that changed state.
pub type Observer = Arc<dyn Fn(&DeltaBatch, &SyncState) + Send + Sync>;

/// Handle returned by [`DeltaSyncEngine::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Applies delta batches to the four state maps.
///
/// # Examples
///
/// ```
/// use mqttot::delta::{DeltaBatch, DeltaItem, DeltaSyncEngine, MessageDelta, Operation};
///
/// let mut engine = DeltaSyncEngine::new();
/// let report = engine.apply_batch(&DeltaBatch::new(vec![DeltaItem::message(
///     Operation::Add,
///     MessageDelta {
///         item_id: "m1".into(),
///         thread_id: Some("t1".into()),
///         text: Some("hi".into()),
///         ..MessageDelta::default()
///     },
/// )]));
/// assert_eq!(report.applied, 1);
/// assert_eq!(engine.state().thread_messages("t1").len(), 1);
/// ```
#[derive(Default)]
pub struct DeltaSyncEngine {
    state: SyncState,
    counters: OperationCounters,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl fmt::Debug for DeltaSyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaSyncEngine")
            .field("stats", &self.stats())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl DeltaSyncEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Apply every item of `batch` in order, then notify observers once if
    /// anything changed.
    pub fn apply_batch(&mut self, batch: &DeltaBatch) -> ApplyReport {
        let outcomes: Vec<Outcome> = batch.items.iter().map(|item| self.apply_item(item)).collect();
        let applied = outcomes.iter().filter(|o| o.is_mutation()).count();
        debug!(
            seq_id = ?batch.seq_id,
            applied,
            total = batch.items.len(),
            "applied delta batch"
        );
        if applied > 0 {
            for (_, observer) in &self.observers {
                observer(batch, &self.state);
            }
        }
        ApplyReport {
            applied,
            total: batch.items.len(),
            outcomes,
        }
    }

    /// Apply one item without notifying observers.
    pub fn apply_item(&mut self, item: &DeltaItem) -> Outcome {
        let state = &mut self.state;
        let counters = &mut self.counters;
        let outcome = match &item.record {
            DeltaRecord::Message(patch) => apply_record(&mut state.messages, item.op, patch, counters),
            DeltaRecord::Thread(patch) => apply_record(&mut state.threads, item.op, patch, counters),
            DeltaRecord::Typing(patch) => apply_record(&mut state.typing, item.op, patch, counters),
            DeltaRecord::Presence(patch) => apply_record(&mut state.presence, item.op, patch, counters),
        };
        trace!(
            kind = item.record.kind(),
            key = item.record.key(),
            op = item.op.as_str(),
            ?outcome,
            "delta item"
        );
        if outcome.is_mutation() {
            metrics::inc_delta_op(item.record.kind(), outcome.as_str());
        }
        outcome
    }

    /// Register an observer.
    pub fn subscribe(&mut self, observer: impl Fn(&DeltaBatch, &SyncState) + Send + Sync + 'static) -> ObserverId {
        self.next_observer += 1;
        let id = ObserverId(self.next_observer);
        self.observers.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer; returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        before != self.observers.len()
    }

    /// Borrow the current state.
    #[must_use]
    pub fn state(&self) -> &SyncState { &self.state }

    /// Deep copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SyncState { self.state.clone() }

    /// Entry counts and operation counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            threads: self.state.threads.len(),
            messages: self.state.messages.len(),
            typing: self.state.typing.len(),
            presence: self.state.presence.len(),
            operations: self.counters,
        }
    }

    /// Drop all state and reset counters. Observers stay registered.
    pub fn clear(&mut self) {
        self.state = SyncState::default();
        self.counters = OperationCounters::default();
        debug!("delta state cleared");
    }
}

fn apply_record<R: Record>(
    map: &mut BTreeMap<String, R>,
    op: Operation,
    patch: &R::Patch,
    counters: &mut OperationCounters,
) -> Outcome {
    let key = R::key(patch);
    if op == Operation::Delete || R::is_terminal(patch) {
        return if map.remove(key).is_some() {
            counters.delete += 1;
            Outcome::Deleted
        } else {
            Outcome::Unchanged
        };
    }
    match (op, map.get_mut(key)) {
        (Operation::Update, Some(existing)) => {
            existing.merge(patch);
            counters.update += 1;
            Outcome::Updated
        }
        _ => {
            map.insert(key.to_owned(), R::from_patch(patch));
            counters.add += 1;
            Outcome::Added
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::{fixture, rstest};

    use super::*;
    use crate::delta::{MessageDelta, PresenceDelta, ThreadDelta, TypingDelta};

    #[fixture]
    fn engine() -> DeltaSyncEngine { DeltaSyncEngine::new() }

    fn message(id: &str, thread: &str, text: &str, ts: i64) -> MessageDelta {
        MessageDelta {
            item_id: id.into(),
            thread_id: Some(thread.into()),
            text: Some(text.into()),
            timestamp: Some(ts),
            ..MessageDelta::default()
        }
    }

    fn thread(id: &str, title: Option<&str>) -> ThreadDelta {
        ThreadDelta {
            thread_id: id.into(),
            title: title.map(Into::into),
            ..ThreadDelta::default()
        }
    }

    #[rstest]
    fn message_before_thread_is_kept(mut engine: DeltaSyncEngine) {
        let batch = DeltaBatch::new(vec![
            DeltaItem::message(Operation::Add, message("m1", "t1", "hi", 1)),
            DeltaItem::thread(Operation::Add, thread("t1", Some("Alice"))),
        ]);
        let report = engine.apply_batch(&batch);
        assert_eq!(report.applied, 2);

        let state = engine.snapshot();
        assert_eq!(state.thread("t1").map(|t| t.title.as_str()), Some("Alice"));
        let messages = state.thread_messages("t1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text.as_deref(), Some("hi"));
        assert!(state.orphan_thread_ids().is_empty());
    }

    #[rstest]
    fn update_before_add_creates_entry(mut engine: DeltaSyncEngine) {
        let outcome = engine.apply_item(&DeltaItem::thread(Operation::Update, thread("t9", Some("Bob"))));
        assert_eq!(outcome, Outcome::Added);
        assert_eq!(engine.stats().operations.add, 1);

        let outcome = engine.apply_item(&DeltaItem::thread(Operation::Update, thread("t9", None)));
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(engine.state().thread("t9").map(|t| t.title.as_str()), Some("Bob"));
    }

    #[rstest]
    fn deleting_absent_keys_is_a_noop(mut engine: DeltaSyncEngine) {
        let delete = DeltaItem::message(Operation::Delete, message("m1", "t1", "", 0));
        engine.apply_item(&DeltaItem::message(Operation::Add, message("m1", "t1", "x", 0)));
        assert_eq!(engine.apply_item(&delete), Outcome::Deleted);
        let before = engine.snapshot();
        assert_eq!(engine.apply_item(&delete), Outcome::Unchanged);
        assert_eq!(engine.snapshot(), before);
        assert_eq!(engine.stats().operations.delete, 1);
    }

    #[rstest]
    fn terminal_typing_and_presence_remove_entries(mut engine: DeltaSyncEngine) {
        let typing = |active| {
            DeltaItem::new(
                Operation::Add,
                DeltaRecord::Typing(TypingDelta {
                    thread_id: "t1".into(),
                    user_id: Some("7".into()),
                    is_active: active,
                    timestamp: None,
                }),
            )
        };
        let presence = |status: &str| {
            DeltaItem::new(
                Operation::Update,
                DeltaRecord::Presence(PresenceDelta {
                    user_id: "7".into(),
                    status: Some(status.into()),
                    last_activity_at: None,
                }),
            )
        };
        engine.apply_batch(&DeltaBatch::new(vec![typing(true), presence("active")]));
        assert!(engine.state().typing_in("t1").is_some());
        assert!(engine.state().presence_of("7").is_some());

        engine.apply_batch(&DeltaBatch::new(vec![typing(false), presence("inactive")]));
        assert!(engine.state().typing_in("t1").is_none());
        assert!(engine.state().presence_of("7").is_none());
    }

    #[rstest]
    fn observers_fire_once_per_mutating_batch(mut engine: DeltaSyncEngine) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = engine.subscribe(move |batch, state| {
            assert_eq!(state.messages.len(), batch.len());
            seen.fetch_add(1, Ordering::SeqCst);
        });

        engine.apply_batch(&DeltaBatch::new(vec![
            DeltaItem::message(Operation::Add, message("a", "t", "1", 1)),
            DeltaItem::message(Operation::Add, message("b", "t", "2", 2)),
        ]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine.apply_batch(&DeltaBatch::new(vec![DeltaItem::message(
            Operation::Delete,
            message("zz", "t", "", 0),
        )]));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no-op batch must not notify");

        assert!(engine.unsubscribe(id));
        assert!(!engine.unsubscribe(id));
    }

    #[rstest]
    fn snapshots_are_independent(mut engine: DeltaSyncEngine) {
        engine.apply_item(&DeltaItem::thread(Operation::Add, thread("t1", Some("A"))));
        let mut copy = engine.snapshot();
        copy.threads.clear();
        assert_eq!(engine.stats().threads, 1);
    }

    #[rstest]
    fn thread_messages_are_ordered_by_timestamp_then_id(mut engine: DeltaSyncEngine) {
        engine.apply_batch(&DeltaBatch::new(vec![
            DeltaItem::message(Operation::Add, message("c", "t", "", 2)),
            DeltaItem::message(Operation::Add, message("b", "t", "", 1)),
            DeltaItem::message(Operation::Add, message("a", "t", "", 2)),
            DeltaItem::message(Operation::Add, message("d", "other", "", 0)),
        ]));
        let ids: Vec<_> = engine
            .state()
            .thread_messages("t")
            .iter()
            .map(|m| m.item_id.as_str())
            .collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert_eq!(engine.state().orphan_thread_ids(), ["other", "t"]);
    }

    #[rstest]
    fn clear_resets_state_and_counters(mut engine: DeltaSyncEngine) {
        engine.apply_item(&DeltaItem::thread(Operation::Add, thread("t1", None)));
        engine.clear();
        assert_eq!(engine.stats(), EngineStats::default());
    }
}
