//! Builder for [`RealtimeClient`].

use std::sync::{Arc, Mutex, atomic::AtomicBool};

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

use super::{
    RealtimeClient,
    UserResolver,
    dispatcher::Dispatcher,
    runtime::Shared,
};
use crate::{
    commands::CommandEncoder,
    connect::AuthSession,
    error::Result,
    events::{DEFAULT_EVENT_CAPACITY, EventSink},
    gap::DEFAULT_BACKFILL_LIMIT,
    persistence::{PersistenceConfig, SessionStore, Subscriptions},
    reconnect::{ReconnectConfig, ReconnectManager},
    rest::RestCollaborator,
    transport::{Connector, TlsConnector, TransportConfig},
};

/// Configures and starts a [`RealtimeClient`].
///
/// # Examples
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
///
/// use mqttot::{
///     client::RealtimeClient,
///     connect::AuthSession,
///     persistence::PersistenceConfig,
///     reconnect::ReconnectConfig,
///     rest::RestCollaborator,
///     transport::TransportConfig,
/// };
///
/// # async fn run(rest: Arc<dyn RestCollaborator>) -> mqttot::error::Result<()> {
/// let client = RealtimeClient::builder(AuthSession::new("1234"), rest)
///     .transport(TransportConfig::default().keep_alive(Duration::from_secs(30)))
///     .reconnect(ReconnectConfig {
///         max_attempts: 5,
///         ..ReconnectConfig::default()
///     })
///     .persistence(PersistenceConfig::new("./session"))
///     .build()
///     .await?;
/// # let _ = client;
/// # Ok(())
/// # }
/// ```
pub struct RealtimeClientBuilder {
    auth: AuthSession,
    rest: Arc<dyn RestCollaborator>,
    connector: Option<Arc<dyn Connector>>,
    transport: TransportConfig,
    reconnect: ReconnectConfig,
    persistence: Option<PersistenceConfig>,
    topics: Vec<u16>,
    subscriptions: Subscriptions,
    backfill_limit: usize,
    event_capacity: usize,
}

impl RealtimeClientBuilder {
    /// Builder with default settings and no persistence.
    #[must_use]
    pub fn new(auth: AuthSession, rest: Arc<dyn RestCollaborator>) -> Self {
        Self {
            auth,
            rest,
            connector: None,
            transport: TransportConfig::default(),
            reconnect: ReconnectConfig::default(),
            persistence: None,
            topics: Vec::new(),
            subscriptions: Subscriptions::default(),
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Open broker streams through `connector` instead of TLS to the
    /// default broker.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Timeouts and limits for each connection.
    #[must_use]
    pub fn transport(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    /// Backoff policy for unexpected disconnects.
    #[must_use]
    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Persist session state under `config.folder`.
    #[must_use]
    pub fn persistence(mut self, config: PersistenceConfig) -> Self {
        self.persistence = Some(config);
        self
    }

    /// Topic ids requested in the CONNECT payload. An empty list keeps the
    /// defaults.
    #[must_use]
    pub fn topics(mut self, topics: impl IntoIterator<Item = u16>) -> Self {
        self.topics = topics.into_iter().collect();
        self
    }

    /// Subscriptions used when none have been persisted.
    #[must_use]
    pub fn subscriptions(mut self, subscriptions: Subscriptions) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Messages requested per thread backfill.
    #[must_use]
    pub fn backfill_limit(mut self, limit: usize) -> Self {
        self.backfill_limit = limit.max(1);
        self
    }

    /// Buffered events per receiver before slow receivers lag.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Open the session store, start the dispatcher and return the client.
    /// Nothing connects until [`RealtimeClient::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Persistence`] if the session folder cannot
    /// be created and [`RealtimeError::Transport`] if the default TLS
    /// connector cannot be configured.
    ///
    /// [`RealtimeError::Persistence`]: crate::error::RealtimeError::Persistence
    /// [`RealtimeError::Transport`]: crate::error::RealtimeError::Transport
    pub async fn build(self) -> Result<RealtimeClient> {
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TlsConnector::new()?),
        };
        let store = match self.persistence {
            Some(config) => Some(SessionStore::open(config).await?),
            None => None,
        };
        let (control, control_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            auth: self.auth,
            connector,
            rest: Arc::clone(&self.rest),
            store,
            transport_config: self.transport.normalized(),
            topics: self.topics,
            subscriptions: self.subscriptions,
            events: EventSink::new(self.event_capacity),
            control,
            tasks: TaskTracker::new(),
            session: Mutex::new(None),
            reconnect: Mutex::new(ReconnectManager::new(self.reconnect)),
            deliberate: AtomicBool::new(false),
            connecting: tokio::sync::Mutex::new(()),
            attempt: Mutex::new(CancellationToken::new()),
        });
        let dispatcher = Dispatcher::new(Arc::clone(&shared), self.backfill_limit, control_rx, shutdown.clone());
        shared.tasks.spawn(dispatcher.run());
        debug!(persistent = shared.store.is_some(), "realtime client built");
        Ok(RealtimeClient {
            resolver: UserResolver::new(self.rest),
            encoder: CommandEncoder::new(),
            shared,
            shutdown,
        })
    }
}
