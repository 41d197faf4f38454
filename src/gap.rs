//! Sequence gap detection and REST backfill.
//!
//! [`GapDetector`] is pure bookkeeping: it remembers the last item id seen
//! per thread and the last stream `seq_id`, and reports a [`Gap`] when two
//! consecutive numeric identifiers differ by more than one. [`GapHandler`]
//! wraps a detector and runs backfill fetches as tracked background tasks
//! whose results come back over a channel tagged with the session
//! generation that requested them.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    delta::MessageDelta,
    metrics,
    rest::{InboxSnapshot, RestCollaborator, RestError},
};

/// Default number of messages fetched when backfilling a thread.
pub const DEFAULT_BACKFILL_LIMIT: usize = 50;

/// What a gap was detected in.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GapScope {
    /// Item ids within one thread.
    Thread(String),
    /// The delta stream's sequence ids.
    Stream,
}

impl GapScope {
    /// Thread id for thread gaps.
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Self::Thread(id) => Some(id),
            Self::Stream => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Thread(_) => "thread",
            Self::Stream => "stream",
        }
    }
}

/// A detected discontinuity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gap {
    /// Where the gap was seen.
    pub scope: GapScope,
    /// Last identifier before the gap.
    pub from: String,
    /// First identifier after the gap.
    pub to: String,
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            GapScope::Thread(id) => write!(f, "thread {id} gap {} -> {}", self.from, self.to),
            GapScope::Stream => write!(f, "stream gap {} -> {}", self.from, self.to),
        }
    }
}

/// Tracks identifiers and records open gaps.
///
/// # Examples
///
/// ```
/// use mqttot::gap::{GapDetector, GapScope};
///
/// let mut detector = GapDetector::default();
/// assert!(detector.observe_item("t1", "5").is_none());
/// assert!(detector.observe_item("t1", "6").is_none());
/// let gap = detector.observe_item("t1", "9").expect("gap");
/// assert_eq!(gap.scope, GapScope::Thread("t1".into()));
/// assert_eq!((gap.from.as_str(), gap.to.as_str()), ("6", "9"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct GapDetector {
    last_items: HashMap<String, String>,
    stream_seq: Option<i64>,
    open: BTreeMap<GapScope, Gap>,
}

impl GapDetector {
    /// Detector whose stream baseline is `seq_id` (warm start), or none
    /// (cold start, the first sequence id is always accepted).
    #[must_use]
    pub fn with_baseline(seq_id: Option<i64>) -> Self {
        Self {
            stream_seq: seq_id,
            ..Self::default()
        }
    }

    /// Current stream baseline.
    #[must_use]
    pub fn stream_seq(&self) -> Option<i64> { self.stream_seq }

    /// Replace the stream baseline.
    pub fn set_baseline(&mut self, seq_id: Option<i64>) { self.stream_seq = seq_id; }

    /// Record `item_id` as the latest item of `thread_id`.
    ///
    /// Returns a gap when both the previous and the new id are numeric and
    /// differ by more than one. Non-numeric ids replace the baseline without
    /// comparison.
    pub fn observe_item(&mut self, thread_id: &str, item_id: &str) -> Option<Gap> {
        let previous = self.last_items.insert(thread_id.to_owned(), item_id.to_owned())?;
        if previous == item_id {
            return None;
        }
        let distance = numeric(&previous)?.abs_diff(numeric(item_id)?);
        (distance > 1).then(|| {
            self.open(Gap {
                scope: GapScope::Thread(thread_id.to_owned()),
                from: previous,
                to: item_id.to_owned(),
            })
        })
    }

    /// Record a stream sequence id.
    ///
    /// Only forward jumps larger than one are gaps. Repeated or older ids
    /// leave the baseline unchanged.
    pub fn observe_seq(&mut self, seq_id: i64) -> Option<Gap> {
        let Some(previous) = self.stream_seq else {
            self.stream_seq = Some(seq_id);
            return None;
        };
        if seq_id <= previous {
            return None;
        }
        self.stream_seq = Some(seq_id);
        (seq_id - previous > 1).then(|| {
            self.open(Gap {
                scope: GapScope::Stream,
                from: previous.to_string(),
                to: seq_id.to_string(),
            })
        })
    }

    fn open(&mut self, gap: Gap) -> Gap {
        metrics::inc_gaps(gap.scope.label());
        debug!(%gap, "gap detected");
        // A newer gap in the same scope subsumes the older one.
        self.open.insert(gap.scope.clone(), gap.clone());
        gap
    }

    /// Gaps not yet filled.
    #[must_use]
    pub fn open_gaps(&self) -> Vec<Gap> { self.open.values().cloned().collect() }

    /// Mark the gap in `scope` as filled.
    pub fn clear_gap(&mut self, scope: &GapScope) -> Option<Gap> { self.open.remove(scope) }

    /// Forget every baseline and open gap.
    pub fn reset(&mut self) {
        self.last_items.clear();
        self.stream_seq = None;
        self.open.clear();
    }
}

fn numeric(id: &str) -> Option<i128> { id.trim().parse().ok() }

/// Data recovered by a backfill.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recovered {
    /// Recent messages of one thread.
    Messages(Vec<MessageDelta>),
    /// A fresh inbox snapshot.
    Snapshot(InboxSnapshot),
}

impl Recovered {
    /// Number of recovered messages, or threads for snapshots.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Messages(messages) => messages.len(),
            Self::Snapshot(snapshot) => snapshot.threads.len(),
        }
    }
}

/// Completion report of one backfill task.
#[derive(Debug)]
pub struct BackfillResult {
    /// Session generation that requested the backfill.
    pub generation: u64,
    /// The gap being filled.
    pub gap: Gap,
    /// Fetched data or the collaborator's error.
    pub outcome: Result<Recovered, RestError>,
}

/// Runs backfill fetches for detected gaps.
///
/// Fetches run on a [`TaskTracker`] and never block the caller. Each
/// session generation owns a [`CancellationToken`]; [`GapHandler::shutdown`]
/// cancels outstanding fetches, and results carry the generation so the
/// consumer can discard those belonging to an earlier session.
pub struct GapHandler {
    detector: GapDetector,
    rest: Arc<dyn RestCollaborator>,
    limit: usize,
    results: mpsc::UnboundedSender<BackfillResult>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    generation: u64,
    in_flight: HashSet<GapScope>,
}

impl fmt::Debug for GapHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GapHandler")
            .field("detector", &self.detector)
            .field("limit", &self.limit)
            .field("generation", &self.generation)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl GapHandler {
    /// Create a handler delivering results to `results`.
    #[must_use]
    pub fn new(rest: Arc<dyn RestCollaborator>, limit: usize, results: mpsc::UnboundedSender<BackfillResult>) -> Self {
        Self {
            detector: GapDetector::default(),
            rest,
            limit: limit.max(1),
            results,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            generation: 0,
            in_flight: HashSet::new(),
        }
    }

    /// Begin a new session generation. Earlier fetches are cancelled and
    /// the detector restarts from `baseline` with no open gaps.
    pub fn start_session(&mut self, baseline: Option<i64>) -> u64 {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation += 1;
        self.in_flight.clear();
        self.detector = GapDetector::with_baseline(baseline);
        debug!(generation = self.generation, ?baseline, "gap handler session started");
        self.generation
    }

    /// Current session generation.
    #[must_use]
    pub fn generation(&self) -> u64 { self.generation }

    /// Whether `result` belongs to the active session.
    #[must_use]
    pub fn is_current(&self, result: &BackfillResult) -> bool { result.generation == self.generation }

    /// Borrow the detector.
    #[must_use]
    pub fn detector(&self) -> &GapDetector { &self.detector }

    /// Replace the stream baseline, e.g. after applying a fresh snapshot.
    pub fn set_baseline(&mut self, seq_id: Option<i64>) { self.detector.set_baseline(seq_id); }

    /// Check a thread item and backfill when a gap appears.
    pub fn observe_item(&mut self, thread_id: &str, item_id: &str) -> Option<Gap> {
        let gap = self.detector.observe_item(thread_id, item_id)?;
        self.backfill(gap.clone());
        Some(gap)
    }

    /// Check a stream sequence id and backfill when a gap appears.
    pub fn observe_seq(&mut self, seq_id: i64) -> Option<Gap> {
        let gap = self.detector.observe_seq(seq_id)?;
        self.backfill(gap.clone());
        Some(gap)
    }

    /// Record a finished backfill. Successful fills close the gap; failed
    /// ones leave it open for [`GapHandler::retry_open_gaps`]. Returns
    /// `false` for results from an earlier generation.
    pub fn complete(&mut self, result: &BackfillResult) -> bool {
        if !self.is_current(result) {
            debug!(
                generation = result.generation,
                current = self.generation,
                "discarding stale backfill result"
            );
            return false;
        }
        self.in_flight.remove(&result.gap.scope);
        if result.outcome.is_ok() {
            self.detector.clear_gap(&result.gap.scope);
        }
        true
    }

    /// Request backfill for every open gap without a fetch in flight.
    /// Returns the number of fetches started.
    pub fn retry_open_gaps(&mut self) -> usize {
        let gaps = self.detector.open_gaps();
        gaps.into_iter().filter(|gap| self.backfill(gap.clone())).count()
    }

    fn backfill(&mut self, gap: Gap) -> bool {
        if !self.in_flight.insert(gap.scope.clone()) {
            return false;
        }
        let rest = Arc::clone(&self.rest);
        let limit = self.limit;
        let generation = self.generation;
        let cancel = self.cancel.clone();
        let results = self.results.clone();
        info!(%gap, generation, "starting backfill");
        self.tracker.spawn(async move {
            let fetch = async {
                match &gap.scope {
                    GapScope::Thread(thread_id) => {
                        rest.thread_messages(thread_id, limit).await.map(Recovered::Messages)
                    }
                    GapScope::Stream => rest.inbox_snapshot().await.map(Recovered::Snapshot),
                }
            };
            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(%gap, "backfill cancelled");
                    return;
                }
                outcome = fetch => outcome,
            };
            if let Err(e) = &outcome {
                warn!(%gap, error = %e, "backfill failed");
            }
            // The receiver is gone once the client shut down.
            let _ = results.send(BackfillResult {
                generation,
                gap,
                outcome,
            });
        });
        true
    }

    /// Cancel outstanding fetches and wait for their tasks to finish.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.in_flight.clear();
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker = TaskTracker::new();
    }
}
