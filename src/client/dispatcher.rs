//! The single consumer that owns the delta engine and gap handler.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::runtime::Shared;
use crate::{
    decode::DecodedRecord,
    delta::{
        ApplyReport,
        DeltaBatch,
        DeltaItem,
        DeltaRecord,
        DeltaSyncEngine,
        EngineStats,
        ObserverId,
        Operation,
        SyncState,
    },
    events::RealtimeEvent,
    gap::{BackfillResult, Gap, GapHandler, GapScope, Recovered},
    persistence::{SeqIds, SessionRecord},
    rest::InboxSnapshot,
    transport::{CloseReason, InboundFrame, TransportEvent, TransportSession},
};

type BoxedObserver = Box<dyn Fn(&DeltaBatch, &SyncState) + Send + Sync>;

/// A freshly connected session handed to the dispatcher.
pub(super) struct Attach {
    pub session: Arc<TransportSession>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub seq_ids: Option<SeqIds>,
    pub snapshot: Option<InboxSnapshot>,
}

/// Requests served by the dispatcher task.
pub(super) enum Control {
    Attach(Attach),
    Detach(oneshot::Sender<()>),
    Reconnect,
    Snapshot(oneshot::Sender<SyncState>),
    Stats(oneshot::Sender<EngineStats>),
    OpenGaps(oneshot::Sender<Vec<Gap>>),
    RetryGaps(oneshot::Sender<usize>),
    Observe(BoxedObserver, oneshot::Sender<ObserverId>),
    Unobserve(ObserverId, oneshot::Sender<bool>),
}

pub(super) struct Dispatcher {
    shared: Arc<Shared>,
    engine: DeltaSyncEngine,
    gaps: GapHandler,
    backfills: mpsc::UnboundedReceiver<BackfillResult>,
    control: mpsc::UnboundedReceiver<Control>,
    session: Option<Arc<TransportSession>>,
    transport: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: CancellationToken,
}

async fn next_event(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    pub(super) fn new(
        shared: Arc<Shared>,
        backfill_limit: usize,
        control: mpsc::UnboundedReceiver<Control>,
        shutdown: CancellationToken,
    ) -> Self {
        let (results, backfills) = mpsc::unbounded_channel();
        let gaps = GapHandler::new(Arc::clone(&shared.rest), backfill_limit, results);
        Self {
            shared,
            engine: DeltaSyncEngine::new(),
            gaps,
            backfills,
            control,
            session: None,
            transport: None,
            shutdown,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                control = self.control.recv() => match control {
                    Some(control) => self.handle_control(control).await,
                    None => break,
                },
                event = next_event(&mut self.transport) => match event {
                    Some(event) => self.handle_transport(event),
                    None => self.transport = None,
                },
                Some(result) = self.backfills.recv() => self.handle_backfill(result),
            }
        }
        self.gaps.shutdown().await;
        debug!("dispatcher stopped");
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Attach(attach) => self.attach(attach),
            Control::Detach(done) => {
                self.drain_transport();
                self.gaps.shutdown().await;
                self.gaps.start_session(None);
                self.session = None;
                let _ = done.send(());
            }
            Control::Reconnect => {
                let shared = Arc::clone(&self.shared);
                self.shared.tasks.spawn(async move { shared.reconnect_attempt().await });
            }
            Control::Snapshot(reply) => {
                let _ = reply.send(self.engine.snapshot());
            }
            Control::Stats(reply) => {
                let _ = reply.send(self.engine.stats());
            }
            Control::OpenGaps(reply) => {
                let _ = reply.send(self.gaps.detector().open_gaps());
            }
            Control::RetryGaps(reply) => {
                let started = self.gaps.retry_open_gaps();
                info!(started, "retrying open gaps");
                let _ = reply.send(started);
            }
            Control::Observe(observer, reply) => {
                let _ = reply.send(self.engine.subscribe(observer));
            }
            Control::Unobserve(id, reply) => {
                let _ = reply.send(self.engine.unsubscribe(id));
            }
        }
    }

    fn attach(&mut self, attach: Attach) {
        let baseline = attach.seq_ids.map(|ids| ids.seq_id);
        let generation = self.gaps.start_session(baseline);
        debug!(generation, ?baseline, "session attached");
        self.session = Some(attach.session);
        self.transport = Some(attach.events);
        if let Some(snapshot) = attach.snapshot {
            let report = self.engine.apply_batch(&snapshot.into_batch());
            info!(applied = report.applied, "applied inbox snapshot");
        }
    }

    /// Handle events already queued by a session that is going away.
    fn drain_transport(&mut self) {
        if let Some(rx) = self.transport.as_mut() {
            let mut queued = Vec::new();
            while let Ok(event) = rx.try_recv() {
                queued.push(event);
            }
            for event in queued {
                self.handle_transport(event);
            }
        }
        self.transport = None;
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.handle_frame(frame),
            TransportEvent::Closed(reason) => self.handle_closed(reason),
        }
    }

    fn handle_closed(&mut self, reason: CloseReason) {
        if let Some(session) = self.session.take() {
            self.shared.clear_session(&session);
        }
        let deliberate = reason.deliberate || self.shared.is_deliberate();
        self.shared.events.emit(RealtimeEvent::Disconnected {
            deliberate,
            reason: reason.error.as_ref().map(ToString::to_string),
        });
        if !deliberate {
            self.shared.schedule_reconnect();
        }
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        match frame.decoded {
            Ok(DecodedRecord::Delta(batch)) => self.apply_live(&batch),
            Ok(DecodedRecord::Json { kind, value }) => self.shared.events.emit(RealtimeEvent::Json {
                topic: frame.topic,
                kind,
                value,
            }),
            Ok(DecodedRecord::Raw(bytes)) => trace!(topic = %frame.topic, len = bytes.len(), "raw frame"),
            Err(e) => self
                .shared
                .events
                .emit(RealtimeEvent::warning("decode", format!("topic {}: {e}", frame.topic))),
        }
    }

    fn apply_live(&mut self, batch: &DeltaBatch) {
        if let Some(seq_id) = batch.seq_id {
            let before = self.gaps.detector().stream_seq();
            if let Some(gap) = self.gaps.observe_seq(seq_id) {
                self.shared.events.emit(RealtimeEvent::Gap(gap));
            }
            if self.gaps.detector().stream_seq() != before {
                self.persist_seq(seq_id);
            }
        }
        for item in &batch.items {
            if let DeltaRecord::Message(message) = &item.record
                && item.op == Operation::Add
                && let Some(thread_id) = &message.thread_id
                && let Some(gap) = self.gaps.observe_item(thread_id, &message.item_id)
            {
                self.shared.events.emit(RealtimeEvent::Gap(gap));
            }
        }
        let report = self.engine.apply_batch(batch);
        self.emit_items(batch, &report);
    }

    fn emit_items(&self, batch: &DeltaBatch, report: &ApplyReport) {
        for (item, outcome) in batch.items.iter().zip(&report.outcomes) {
            if outcome.is_mutation() {
                self.shared.events.emit(item_event(item));
            }
        }
    }

    fn persist_seq(&self, seq_id: i64) {
        let Some(store) = &self.shared.store else {
            return;
        };
        let snapshot_at_ms = store
            .load()
            .seq_ids
            .map_or_else(super::runtime::now_ms_i64, |ids| ids.snapshot_at_ms);
        store.save(SessionRecord {
            seq_ids: Some(SeqIds {
                seq_id,
                snapshot_at_ms,
            }),
            ..SessionRecord::default()
        });
    }

    fn handle_backfill(&mut self, result: BackfillResult) {
        if !self.gaps.complete(&result) {
            return;
        }
        let BackfillResult { gap, outcome, .. } = result;
        match outcome {
            Ok(recovered) => {
                let recovered_count = recovered.count();
                let batch = match recovered {
                    Recovered::Messages(messages) => {
                        let thread_id = gap.scope.thread_id().map(str::to_owned);
                        DeltaBatch::new(
                            messages
                                .into_iter()
                                .map(|mut message| {
                                    if message.thread_id.is_none() {
                                        message.thread_id.clone_from(&thread_id);
                                    }
                                    DeltaItem::message(Operation::Update, message)
                                })
                                .collect(),
                        )
                    }
                    Recovered::Snapshot(snapshot) => snapshot.into_batch(),
                };
                if gap.scope == GapScope::Stream
                    && let Some(seq_id) = batch.seq_id
                    && self.gaps.detector().stream_seq().is_none_or(|current| seq_id > current)
                {
                    self.gaps.set_baseline(Some(seq_id));
                    self.persist_seq(seq_id);
                }
                let report = self.engine.apply_batch(&batch);
                info!(%gap, recovered = recovered_count, applied = report.applied, "gap filled");
                self.shared.events.emit(RealtimeEvent::GapFilled {
                    gap,
                    recovered: recovered_count,
                });
            }
            Err(e) => self
                .shared
                .events
                .emit(RealtimeEvent::warning("backfill", format!("{gap}: {e}"))),
        }
    }
}

fn item_event(item: &DeltaItem) -> RealtimeEvent {
    match &item.record {
        DeltaRecord::Message(message) => match &message.reaction {
            Some(reaction) if item.op != Operation::Delete => RealtimeEvent::Reaction {
                thread_id: message.thread_id.clone(),
                item_id: message.item_id.clone(),
                sender_id: message.sender_id.clone(),
                reaction: reaction.clone(),
            },
            _ => RealtimeEvent::Message {
                op: item.op,
                message: message.clone(),
            },
        },
        DeltaRecord::Thread(thread) => RealtimeEvent::ThreadUpdate {
            op: item.op,
            thread: thread.clone(),
        },
        DeltaRecord::Typing(typing) => RealtimeEvent::Typing(typing.clone()),
        DeltaRecord::Presence(presence) => RealtimeEvent::Presence(presence.clone()),
    }
}
