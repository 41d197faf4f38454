//! Client runtime: connection lifecycle and the public API.

use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use super::{
    RealtimeClientBuilder,
    UserResolver,
    dispatcher::{Attach, Control},
};
use crate::{
    commands::{Command, CommandEncoder, publish_envelope},
    connect::{AuthSession, ConnectDescriptor, ConnectionBuilder, CredentialSource, now_ms},
    delta::{DeltaBatch, EngineStats, ObserverId, SyncState},
    error::{RealtimeError, Result},
    events::{EventSink, RealtimeEvent},
    gap::Gap,
    metrics,
    persistence::{SeqIds, SessionRecord, SessionStore, Subscriptions},
    reconnect::{ReconnectManager, ReconnectState, ScheduledReconnect},
    rest::{InboxSnapshot, RestCollaborator, RestError, UserInfo},
    transport::{Connector, SubscriptionGroup, TransportConfig, TransportSession, TransportState},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(PoisonError::into_inner) }

pub(super) fn now_ms_i64() -> i64 { i64::try_from(now_ms()).unwrap_or(i64::MAX) }

/// How the delta stream starts on a new connection.
struct StreamStart {
    seq_ids: Option<SeqIds>,
    snapshot: Option<InboxSnapshot>,
    subscriptions: Subscriptions,
    resumed: bool,
}

/// State shared between the client handle, the dispatcher and reconnect
/// tasks.
pub(super) struct Shared {
    pub(super) auth: AuthSession,
    pub(super) connector: Arc<dyn Connector>,
    pub(super) rest: Arc<dyn RestCollaborator>,
    pub(super) store: Option<SessionStore>,
    pub(super) transport_config: TransportConfig,
    pub(super) topics: Vec<u16>,
    pub(super) subscriptions: Subscriptions,
    pub(super) events: EventSink,
    pub(super) control: mpsc::UnboundedSender<Control>,
    pub(super) tasks: TaskTracker,
    pub(super) session: Mutex<Option<Arc<TransportSession>>>,
    pub(super) reconnect: Mutex<ReconnectManager>,
    pub(super) deliberate: AtomicBool,
    pub(super) connecting: tokio::sync::Mutex<()>,
    /// Cancelled by `disconnect` to abandon the attempt in flight.
    pub(super) attempt: Mutex<CancellationToken>,
}

impl Shared {
    pub(super) fn is_deliberate(&self) -> bool { self.deliberate.load(Ordering::Acquire) }

    fn current_session(&self) -> Option<Arc<TransportSession>> { lock(&self.session).clone() }

    pub(super) fn clear_session(&self, closed: &Arc<TransportSession>) {
        let mut slot = lock(&self.session);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, closed)) {
            *slot = None;
        }
    }

    /// Connect, prepare the delta stream and subscribe. Attempts are
    /// serialised so at most one live session exists.
    ///
    /// A concurrent `disconnect` abandons the attempt: the handshake or
    /// snapshot fetch is dropped, a half-open session is closed and
    /// [`RealtimeError::NotConnected`] is returned.
    pub(super) async fn connect_once(&self) -> Result<()> {
        let _attempt = self.connecting.lock().await;
        if self.current_session().is_some_and(|session| session.state().is_open()) {
            debug!("already connected");
            return Ok(());
        }
        let abandoned = CancellationToken::new();
        *lock(&self.attempt) = abandoned.clone();
        if self.is_deliberate() {
            return Err(RealtimeError::NotConnected);
        }
        let descriptor = ConnectionBuilder::new(&self.auth)
            .topics(self.topics.iter().copied())
            .build()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = tokio::select! {
            biased;
            () = abandoned.cancelled() => return Err(RealtimeError::NotConnected),
            session = TransportSession::connect(
                self.connector.as_ref(),
                self.transport_config.clone(),
                &descriptor,
                events_tx,
            ) => Arc::new(session?),
        };
        lock(&self.reconnect).reset();
        self.record_connection(&descriptor);

        let start = tokio::select! {
            biased;
            () = abandoned.cancelled() => None,
            start = self.prepare_stream() => Some(start),
        };
        let Some(mut start) = start else {
            session.disconnect().await;
            return Err(RealtimeError::NotConnected);
        };
        {
            let mut slot = lock(&self.session);
            if self.is_deliberate() {
                drop(slot);
                session.disconnect().await;
                return Err(RealtimeError::NotConnected);
            }
            self.control
                .send(Control::Attach(Attach {
                    session: Arc::clone(&session),
                    events: events_rx,
                    seq_ids: start.seq_ids,
                    snapshot: start.snapshot.take(),
                }))
                .map_err(|_| RealtimeError::Shutdown)?;
            *slot = Some(Arc::clone(&session));
        }

        self.subscribe_all(&session, &start).await;
        if self.is_deliberate() {
            return Err(RealtimeError::NotConnected);
        }
        info!(resumed = start.resumed, "realtime client connected");
        self.events.emit(RealtimeEvent::Connected {
            resumed: start.resumed,
        });
        Ok(())
    }

    fn record_connection(&self, descriptor: &ConnectDescriptor) {
        let Some(store) = &self.store else {
            return;
        };
        let session_id =
            (descriptor.credential_source != CredentialSource::Placeholder).then(|| descriptor.credential_token.clone());
        let mqtt_session_id = descriptor.mqtt_session_id;
        store.update_mqtt(|mqtt| {
            mqtt.session_id = session_id;
            mqtt.mqtt_session_id = Some(mqtt_session_id);
            mqtt.last_connected_at = Some(now_ms());
            mqtt.reconnect_attempts = 0;
        });
    }

    /// Resume from the stored sequence id when possible, otherwise fetch a
    /// fresh inbox snapshot.
    async fn prepare_stream(&self) -> StreamStart {
        let record = self.store.as_ref().map(SessionStore::load).unwrap_or_default();
        let subscriptions = record
            .subscriptions
            .clone()
            .filter(|subs| !subs.is_empty())
            .unwrap_or_else(|| self.subscriptions.clone());
        if record.is_resumable() {
            debug!(seq_ids = ?record.seq_ids, "resuming delta stream");
            return StreamStart {
                seq_ids: record.seq_ids,
                snapshot: None,
                subscriptions,
                resumed: true,
            };
        }
        match self.rest.inbox_snapshot().await {
            Ok(snapshot) => {
                let seq_ids = snapshot.seq_id.map(|seq_id| SeqIds {
                    seq_id,
                    snapshot_at_ms: snapshot.snapshot_at_ms.unwrap_or_else(now_ms_i64),
                });
                debug!(?seq_ids, threads = snapshot.threads.len(), "fetched inbox snapshot");
                if let (Some(store), Some(ids)) = (&self.store, seq_ids) {
                    store.save(SessionRecord {
                        seq_ids: Some(ids),
                        ..SessionRecord::default()
                    });
                }
                StreamStart {
                    seq_ids,
                    snapshot: Some(snapshot),
                    subscriptions,
                    resumed: false,
                }
            }
            Err(e) => {
                warn!(error = %e, "inbox snapshot failed; starting without a baseline");
                self.events.emit(RealtimeEvent::warning("snapshot", &e));
                StreamStart {
                    seq_ids: None,
                    snapshot: None,
                    subscriptions,
                    resumed: false,
                }
            }
        }
    }

    async fn subscribe_all(&self, session: &TransportSession, start: &StreamStart) {
        let subs = &start.subscriptions;
        let mut groups = Vec::with_capacity(3);
        if !subs.graphql.is_empty() {
            groups.push(SubscriptionGroup::GraphQl(subs.graphql.clone()));
        }
        if !subs.skywalker.is_empty() {
            groups.push(SubscriptionGroup::Skywalker(subs.skywalker.clone()));
        }
        if let Some(ids) = start.seq_ids {
            groups.push(SubscriptionGroup::Iris {
                seq_id: ids.seq_id,
                snapshot_at_ms: ids.snapshot_at_ms,
                app_version: self.auth.app_version.clone(),
            });
        }
        for group in &groups {
            if let Err(e) = session.subscribe(group).await {
                self.events.emit(RealtimeEvent::warning(
                    "subscribe",
                    format!("{} subscription failed: {e}", group.name()),
                ));
            }
        }
        if let Some(store) = &self.store {
            store.save(SessionRecord {
                subscriptions: Some(subs.clone()),
                ..SessionRecord::default()
            });
        }
    }

    /// Schedule the next reconnect attempt, or report exhaustion.
    pub(super) fn schedule_reconnect(&self) {
        if self.is_deliberate() {
            return;
        }
        let trigger = self.control.clone();
        let mut manager = lock(&self.reconnect);
        match manager.schedule(move || async move {
            let _ = trigger.send(Control::Reconnect);
        }) {
            Some(ScheduledReconnect { attempt, delay }) => {
                drop(manager);
                metrics::inc_reconnects();
                info!(attempt, ?delay, "reconnect scheduled");
                if let Some(store) = &self.store {
                    store.update_mqtt(|mqtt| mqtt.reconnect_attempts = attempt);
                }
                self.events.emit(RealtimeEvent::Reconnecting { attempt, delay });
            }
            None => {
                let attempts = manager.state().attempt;
                drop(manager);
                warn!(attempts, "reconnect budget exhausted");
                self.events.emit(RealtimeEvent::Error(Arc::new(RealtimeError::ReconnectExhausted {
                    attempts,
                })));
            }
        }
    }

    /// Run one reconnect attempt; failures schedule the next one.
    pub(super) async fn reconnect_attempt(&self) {
        if self.is_deliberate() {
            return;
        }
        if let Err(e) = self.connect_once().await {
            warn!(error = %e, "reconnect attempt failed");
            let retry = matches!(&e, RealtimeError::Transport(t) if t.is_retryable());
            self.events.emit(RealtimeEvent::Error(Arc::new(e)));
            if retry {
                self.schedule_reconnect();
            }
        }
    }
}

/// Realtime direct-message client.
///
/// Build one with [`RealtimeClient::builder`], subscribe to
/// [`RealtimeClient::events`], then call [`RealtimeClient::connect`].
/// Unexpected disconnects are retried with exponential backoff until
/// [`RealtimeClient::disconnect`] is called or the attempt budget is spent.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use mqttot::{client::RealtimeClient, connect::AuthSession, rest::RestCollaborator};
///
/// # async fn run(rest: Arc<dyn RestCollaborator>) -> mqttot::error::Result<()> {
/// let client = RealtimeClient::builder(AuthSession::new("1234"), rest).build().await?;
/// let mut events = client.events();
/// client.connect().await?;
/// while let Ok(event) = events.recv().await {
///     println!("{}", event.name());
/// }
/// # Ok(())
/// # }
/// ```
pub struct RealtimeClient {
    pub(super) shared: Arc<Shared>,
    pub(super) resolver: UserResolver,
    pub(super) encoder: CommandEncoder,
    pub(super) shutdown: CancellationToken,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &self.transport_state())
            .field("reconnect", &self.reconnect_state())
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    /// Start building a client for `auth`, using `rest` for snapshots,
    /// backfill and user lookups.
    #[must_use]
    pub fn builder(auth: AuthSession, rest: Arc<dyn RestCollaborator>) -> RealtimeClientBuilder {
        RealtimeClientBuilder::new(auth, rest)
    }

    /// Receive future events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RealtimeEvent> { self.shared.events.subscribe() }

    /// Connect and subscribe.
    ///
    /// Suspends until the handshake completes or times out. A retryable
    /// failure is returned and a reconnect is scheduled in the background.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Build`] for an unusable auth session,
    /// [`RealtimeError::Transport`] when the handshake fails and
    /// [`RealtimeError::NotConnected`] when [`RealtimeClient::disconnect`]
    /// is called before the connection is up.
    pub async fn connect(&self) -> Result<()> {
        self.shared.deliberate.store(false, Ordering::Release);
        let result = self.shared.connect_once().await;
        if let Err(RealtimeError::Transport(e)) = &result
            && e.is_retryable()
        {
            self.shared.schedule_reconnect();
        }
        result
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Safe in any state. Pending reconnect timers and backfills are
    /// cancelled and pending session writes are flushed.
    pub async fn disconnect(&self) {
        self.shared.deliberate.store(true, Ordering::Release);
        lock(&self.shared.reconnect).cancel();
        lock(&self.shared.attempt).cancel();
        let session = lock(&self.shared.session).take();
        if let Some(session) = session {
            session.disconnect().await;
        }
        // An abandoned attempt releases the lock once its session is closed.
        drop(self.shared.connecting.lock().await);
        let (tx, rx) = oneshot::channel();
        if self.shared.control.send(Control::Detach(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(store) = &self.shared.store
            && let Err(e) = store.flush().await
        {
            warn!(error = %e, "failed to flush session state");
        }
        info!("realtime client disconnected");
    }

    /// State of the current connection, if any.
    #[must_use]
    pub fn transport_state(&self) -> Option<TransportState> {
        self.shared.current_session().map(|session| session.state())
    }

    /// Whether a connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.transport_state().is_some_and(TransportState::is_open) }

    /// Reconnect counters and pending delay.
    #[must_use]
    pub fn reconnect_state(&self) -> ReconnectState { lock(&self.shared.reconnect).state() }

    fn session(&self) -> Result<Arc<TransportSession>> {
        self.shared
            .current_session()
            .filter(|session| session.state().is_open())
            .ok_or(RealtimeError::NotConnected)
    }

    /// Publish `command` with a fresh client context, returned on success.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotConnected`] without a live connection and
    /// the publish error otherwise.
    pub async fn send(&self, command: &Command) -> Result<String> {
        let envelope = self.encoder.encode(command);
        publish_envelope(self.session()?.as_ref(), &envelope).await?;
        Ok(envelope.client_context)
    }

    /// Publish `command` reusing `client_context`.
    ///
    /// # Errors
    ///
    /// As for [`RealtimeClient::send`].
    pub async fn send_with_context(&self, command: &Command, client_context: impl Into<String>) -> Result<String> {
        let envelope = self.encoder.encode_with_context(command, client_context);
        publish_envelope(self.session()?.as_ref(), &envelope).await?;
        Ok(envelope.client_context)
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// As for [`RealtimeClient::send`].
    pub async fn send_text(&self, thread_id: &str, text: &str) -> Result<String> {
        self.send(&Command::text(thread_id, text)).await
    }

    /// Send a like to a thread.
    ///
    /// # Errors
    ///
    /// As for [`RealtimeClient::send`].
    pub async fn send_like(&self, thread_id: &str) -> Result<String> {
        self.send(&Command::SendLike {
            thread_id: thread_id.to_owned(),
        })
        .await
    }

    /// Start or stop the typing indicator.
    ///
    /// # Errors
    ///
    /// As for [`RealtimeClient::send`].
    pub async fn indicate_activity(&self, thread_id: &str, is_active: bool) -> Result<String> {
        self.send(&Command::IndicateActivity {
            thread_id: thread_id.to_owned(),
            is_active,
        })
        .await
    }

    /// Broadcast the account's own presence.
    ///
    /// # Errors
    ///
    /// As for [`RealtimeClient::send`].
    pub async fn broadcast_presence(&self, status: &str) -> Result<String> {
        self.send(&Command::SendPresence {
            status: status.to_owned(),
        })
        .await
    }

    /// Publish one subscription group. GraphQL and skywalker lists are
    /// remembered for later connections.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotConnected`] before `connect()` and the
    /// publish error otherwise.
    pub async fn subscribe(&self, group: &SubscriptionGroup) -> Result<()> {
        self.session()?.subscribe(group).await?;
        if let Some(store) = &self.shared.store {
            let mut subs = store.load().subscriptions.unwrap_or_else(|| self.shared.subscriptions.clone());
            match group {
                SubscriptionGroup::GraphQl(list) => subs.graphql.clone_from(list),
                SubscriptionGroup::Skywalker(list) => subs.skywalker.clone_from(list),
                SubscriptionGroup::Iris { .. } => return Ok(()),
            }
            store.save(SessionRecord {
                subscriptions: Some(subs),
                ..SessionRecord::default()
            });
        }
        Ok(())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Control) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.shared.control.send(make(tx)).map_err(|_| RealtimeError::Shutdown)?;
        rx.await.map_err(|_| RealtimeError::Shutdown)
    }

    /// Deep copy of the synchronised state.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Shutdown`] once the client has been dropped.
    pub async fn get_state(&self) -> Result<SyncState> { self.request(Control::Snapshot).await }

    /// Entry counts and operation counters.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Shutdown`] once the client has been dropped.
    pub async fn stats(&self) -> Result<EngineStats> { self.request(Control::Stats).await }

    /// Gaps still waiting for a successful backfill.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Shutdown`] once the client has been dropped.
    pub async fn open_gaps(&self) -> Result<Vec<Gap>> { self.request(Control::OpenGaps).await }

    /// Request backfill again for every open gap; returns the number of
    /// fetches started.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Shutdown`] once the client has been dropped.
    pub async fn retry_gaps(&self) -> Result<usize> { self.request(Control::RetryGaps).await }

    /// Register an observer called once per applied batch.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Shutdown`] once the client has been dropped.
    pub async fn observe(
        &self,
        observer: impl Fn(&DeltaBatch, &SyncState) + Send + Sync + 'static,
    ) -> Result<ObserverId> {
        self.request(|reply| Control::Observe(Box::new(observer), reply)).await
    }

    /// Remove an observer.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Shutdown`] once the client has been dropped.
    pub async fn unobserve(&self, id: ObserverId) -> Result<bool> {
        self.request(|reply| Control::Unobserve(id, reply)).await
    }

    /// Look up a user, sharing in-flight fetches and caching results.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's error.
    pub async fn resolve_user(&self, user_id: &str) -> std::result::Result<UserInfo, Arc<RestError>> {
        self.resolver.resolve(user_id).await
    }

    /// Persisted session record, when persistence is enabled.
    #[must_use]
    pub fn session_record(&self) -> Option<SessionRecord> { self.shared.store.as_ref().map(SessionStore::load) }

    /// Re-read the session files from disk.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Persistence`] if a file cannot be parsed.
    pub async fn reload_session(&self) -> Result<Option<SessionRecord>> {
        match &self.shared.store {
            Some(store) => Ok(Some(store.reload().await?)),
            None => Ok(None),
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shared.deliberate.store(true, Ordering::Release);
        lock(&self.shared.reconnect).cancel();
        lock(&self.shared.attempt).cancel();
        lock(&self.shared.session).take();
        self.shutdown.cancel();
        self.shared.tasks.close();
    }
}
