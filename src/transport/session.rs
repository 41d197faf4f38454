//! The live broker connection and its background tasks.

use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{
    SinkExt,
    StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tokio_util::{codec::Framed, sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use super::{BoxedStream, Connector, SubscriptionGroup, TransportConfig, TransportError, TransportState};
use crate::{
    codec::{self, ConnAck, Connect, MqttCodec, Packet, Publish},
    connect::ConnectDescriptor,
    decode::{self, DecodeError, DecodedRecord},
    metrics::{self, Direction},
    topic::{self, Qos, TopicDescriptor},
};

type PacketStream = Framed<BoxedStream, MqttCodec>;

/// Time allowed for the DISCONNECT packet to be written on a deliberate
/// close.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// A decoded inbound PUBLISH.
#[derive(Debug)]
pub struct InboundFrame {
    /// Topic name as sent by the broker.
    pub topic: String,
    /// Registry entry for the topic, if known.
    pub descriptor: Option<&'static TopicDescriptor>,
    /// Decoder output.
    pub decoded: Result<DecodedRecord, DecodeError>,
}

/// Why a session stopped.
#[derive(Debug)]
pub struct CloseReason {
    /// `true` when [`TransportSession::disconnect`] (or drop) caused the
    /// close.
    pub deliberate: bool,
    /// Failure that ended the session, if any.
    pub error: Option<TransportError>,
}

/// Notifications produced by a session's receive loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound PUBLISH, decoded for its topic.
    Frame(InboundFrame),
    /// The session ended. Sent exactly once, after the last frame.
    Closed(CloseReason),
}

struct Inner {
    state: Mutex<TransportState>,
    pending: DashMap<u16, oneshot::Sender<()>>,
    next_packet_id: AtomicU16,
    deliberate: AtomicBool,
    failure: Mutex<Option<TransportError>>,
    last_inbound: Mutex<Instant>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(PoisonError::into_inner) }

impl Inner {
    fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Idle),
            pending: DashMap::new(),
            next_packet_id: AtomicU16::new(1),
            deliberate: AtomicBool::new(false),
            failure: Mutex::new(None),
            last_inbound: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> TransportState { *lock(&self.state) }

    fn transition(&self, to: TransportState) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let from = *state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, "rejected transport state transition");
            return Err(TransportError::InvalidTransition { from, to });
        }
        *state = to;
        debug!(%from, %to, "transport state changed");
        Ok(())
    }

    fn fail(&self, error: TransportError) {
        let mut slot = lock(&self.failure);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn touch(&self) { *lock(&self.last_inbound) = Instant::now(); }

    fn idle_for(&self) -> Duration { lock(&self.last_inbound).elapsed() }

    fn allocate_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// One authenticated broker connection.
///
/// Created by [`TransportSession::connect`], which performs the CONNECT /
/// CONNACK handshake before starting three tasks: a reader that decodes
/// inbound PUBLISH packets and forwards them as [`TransportEvent`]s, a
/// writer that owns the sink, and a keep-alive pinger. Any close not
/// requested through [`TransportSession::disconnect`] is reported with
/// `deliberate: false` so the owner can reconnect.
pub struct TransportSession {
    inner: Arc<Inner>,
    outbound: mpsc::Sender<Packet>,
    tracker: TaskTracker,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    config: TransportConfig,
    connack: ConnAck,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state())
            .field("pending_acks", &self.inner.pending.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransportSession {
    /// Open a connection, perform the handshake and start the session tasks.
    ///
    /// Suspends until the broker acknowledges or `config.connect_timeout`
    /// elapses. Inbound frames and the final close notification are sent to
    /// `events`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the stream cannot be opened, the
    /// handshake times out, or the broker refuses the connection.
    pub async fn connect(
        connector: &dyn Connector,
        config: TransportConfig,
        descriptor: &ConnectDescriptor,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let config = config.normalized();
        let inner = Arc::new(Inner::new());
        inner.transition(TransportState::Connecting)?;
        let keep_alive = u16::try_from(config.keep_alive.as_secs()).unwrap_or(u16::MAX);
        let connect = Connect::mqttot(keep_alive, descriptor.to_payload()?);
        debug!(
            client_identifier = %descriptor.client_identifier,
            mqtt_session_id = descriptor.mqtt_session_id,
            topics = ?descriptor.subscribed_topic_ids,
            "connecting to broker"
        );

        let (framed, connack) = timeout(config.connect_timeout, handshake(connector, &config, connect))
            .await
            .map_err(|_| TransportError::ConnectTimeout(config.connect_timeout))??;
        if !connack.is_success() {
            return Err(TransportError::Refused {
                code: connack.return_code,
            });
        }
        if config.require_connack_payload && connack.payload.is_empty() {
            return Err(TransportError::EmptyConnAck);
        }
        inner.transition(TransportState::Connected)?;
        inner.touch();
        info!(payload_len = connack.payload.len(), "broker connection established");
        metrics::inc_connections();

        let (sink, stream) = framed.split();
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let tracker = TaskTracker::new();
        let writer = tracker.spawn(write_loop(Arc::clone(&inner), sink, outbound_rx));
        tracker.spawn(read_loop(Arc::clone(&inner), stream, outbound.clone(), events));
        tracker.spawn(keep_alive_loop(Arc::clone(&inner), outbound.clone(), config.keep_alive));
        tracker.close();

        Ok(Self {
            inner,
            outbound,
            tracker,
            writer: tokio::sync::Mutex::new(Some(writer)),
            config,
            connack,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransportState { self.inner.state() }

    /// The broker's CONNACK.
    #[must_use]
    pub fn connack(&self) -> &ConnAck { &self.connack }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &TransportConfig { &self.config }

    /// Whether a close was requested locally.
    #[must_use]
    pub fn is_deliberately_closed(&self) -> bool { self.inner.deliberate.load(Ordering::Acquire) }

    fn ensure_open(&self) -> Result<(), TransportError> {
        match self.state() {
            state if state.is_open() && !self.inner.cancel.is_cancelled() => Ok(()),
            state => Err(TransportError::NotConnected(state)),
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.outbound.send(packet).await.map_err(|_| TransportError::Closed)
    }

    /// Publish `payload` on `topic_id`, compressing it when the topic
    /// expects compressed payloads. QoS 1 publishes wait for the PUBACK.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] before the handshake or after
    /// close, [`TransportError::AckTimeout`] when no PUBACK arrives in time,
    /// and [`TransportError::Closed`] if the connection drops meanwhile.
    pub async fn publish(&self, topic_id: u16, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
        self.ensure_open()?;
        let descriptor = topic::by_id(topic_id);
        let compress = descriptor.is_none_or(|t| t.requires_decompression);
        let body = if compress {
            Bytes::from(codec::compress(payload)?)
        } else {
            Bytes::copy_from_slice(payload)
        };
        let mut publish = Publish {
            topic: descriptor.map_or_else(|| topic_id.to_string(), TopicDescriptor::wire_name),
            packet_id: None,
            qos,
            retain: false,
            dup: false,
            payload: body,
        };
        if qos == Qos::AtMostOnce {
            trace!(topic_id, "publishing");
            return self.send(Packet::Publish(publish)).await;
        }

        let packet_id = self.inner.allocate_packet_id();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner.pending.insert(packet_id, ack_tx);
        publish.packet_id = Some(packet_id);
        trace!(topic_id, packet_id, "publishing with acknowledgement");
        if let Err(e) = self.send(Packet::Publish(publish)).await {
            self.inner.pending.remove(&packet_id);
            return Err(e);
        }
        match timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.inner.pending.remove(&packet_id);
                Err(TransportError::AckTimeout {
                    packet_id,
                    after: self.config.ack_timeout,
                })
            }
        }
    }

    /// Publish one subscription group's request.
    ///
    /// # Errors
    ///
    /// Returns the underlying publish error; other groups are unaffected.
    pub async fn subscribe(&self, group: &SubscriptionGroup) -> Result<(), TransportError> {
        self.ensure_open()?;
        let payload = serde_json::to_vec(&group.payload())?;
        self.inner.transition(TransportState::Subscribing)?;
        let descriptor = group.topic();
        let result = self.publish(descriptor.id, &payload, descriptor.qos).await;
        match &result {
            Ok(()) => debug!(group = group.name(), "subscription requested"),
            Err(e) => warn!(group = group.name(), error = %e, "subscription failed"),
        }
        if self.state() == TransportState::Subscribing {
            self.inner.transition(TransportState::Active)?;
        }
        result
    }

    /// Close the connection deliberately. Safe to call in any state and
    /// more than once; the close is reported with `deliberate: true`.
    pub async fn disconnect(&self) {
        self.inner.deliberate.store(true, Ordering::Release);
        if self.inner.transition(TransportState::Closing).is_ok() && !self.inner.cancel.is_cancelled() {
            let _ = self.outbound.try_send(Packet::Disconnect);
            if let Some(writer) = self.writer.lock().await.take() {
                let _ = timeout(DISCONNECT_GRACE, writer).await;
            }
        }
        self.inner.cancel.cancel();
        self.tracker.wait().await;
        let _ = self.inner.transition(TransportState::Closed);
        info!("broker connection closed");
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.inner.deliberate.store(true, Ordering::Release);
        self.inner.cancel.cancel();
    }
}

async fn handshake(
    connector: &dyn Connector,
    config: &TransportConfig,
    connect: Connect,
) -> Result<(PacketStream, ConnAck), TransportError> {
    let stream = connector.connect().await?;
    let mut framed = Framed::new(stream, MqttCodec::new(config.max_packet_length));
    framed.send(Packet::Connect(connect)).await?;
    metrics::inc_frames(Direction::Outbound);
    match framed.next().await {
        Some(Ok(Packet::ConnAck(connack))) => {
            metrics::inc_frames(Direction::Inbound);
            Ok((framed, connack))
        }
        Some(Ok(other)) => Err(TransportError::UnexpectedPacket(other.kind())),
        Some(Err(e)) => Err(e.into()),
        None => Err(TransportError::Closed),
    }
}

async fn write_loop(inner: Arc<Inner>, mut sink: SplitSink<PacketStream, Packet>, mut rx: mpsc::Receiver<Packet>) {
    loop {
        let packet = select! {
            () = inner.cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let last = matches!(packet, Packet::Disconnect);
        let kind = packet.kind();
        if let Err(e) = sink.send(packet).await {
            warn!(kind, error = %e, "failed to write packet");
            inner.fail(e.into());
            inner.cancel.cancel();
            break;
        }
        metrics::inc_frames(Direction::Outbound);
        if last {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: Arc<Inner>,
    mut stream: SplitStream<PacketStream>,
    outbound: mpsc::Sender<Packet>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let next = select! {
            () = inner.cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(packet)) => {
                inner.touch();
                metrics::inc_frames(Direction::Inbound);
                handle_packet(&inner, packet, &outbound, &events).await;
            }
            Some(Err(e)) => {
                warn!(error = %e, "broker stream failed");
                inner.fail(e.into());
                break;
            }
            None => {
                debug!("broker closed the stream");
                break;
            }
        }
    }
    inner.cancel.cancel();
    inner.pending.clear();
    let deliberate = inner.deliberate.load(Ordering::Acquire);
    if !deliberate {
        let _ = inner.transition(TransportState::Draining);
    }
    let error = lock(&inner.failure).take();
    metrics::dec_connections();
    if !deliberate {
        warn!(error = ?error.as_ref().map(ToString::to_string), "broker connection lost");
    }
    let _ = events.send(TransportEvent::Closed(CloseReason { deliberate, error }));
    if !deliberate {
        let _ = inner.transition(TransportState::Closed);
    }
}

async fn handle_packet(
    inner: &Inner,
    packet: Packet,
    outbound: &mpsc::Sender<Packet>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    match packet {
        Packet::Publish(publish) => {
            if let (Qos::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
                let _ = outbound.send(Packet::PubAck { packet_id }).await;
            }
            let _ = events.send(TransportEvent::Frame(decode_inbound(publish)));
        }
        Packet::PubAck { packet_id } => match inner.pending.remove(&packet_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(());
            }
            None => debug!(packet_id, "acknowledgement for unknown packet"),
        },
        Packet::PingResp => trace!("pong"),
        Packet::Disconnect => debug!("broker requested disconnect"),
        other => debug!(kind = other.kind(), "ignoring packet"),
    }
}

fn decode_inbound(publish: Publish) -> InboundFrame {
    let descriptor = topic::resolve(&publish.topic);
    let decoded = match descriptor {
        Some(descriptor) => decode::decode_frame(descriptor, publish.payload),
        None => {
            debug!(topic = %publish.topic, "publish on unknown topic");
            Ok(DecodedRecord::Raw(codec::decompress(publish.payload).bytes))
        }
    };
    if let (Some(descriptor), Err(e)) = (descriptor, &decoded) {
        debug!(topic = descriptor.path, error = %e, "payload failed to decode");
        metrics::inc_decode_failures(descriptor.path);
    }
    InboundFrame {
        topic: publish.topic,
        descriptor,
        decoded,
    }
}

async fn keep_alive_loop(inner: Arc<Inner>, outbound: mpsc::Sender<Packet>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            () = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if inner.idle_for() > period + period / 2 {
            warn!(?period, "no traffic from broker; closing");
            inner.fail(TransportError::KeepAliveTimeout);
            inner.cancel.cancel();
            break;
        }
        if outbound.send(Packet::PingReq).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_wrap_and_skip_zero() {
        let inner = Inner::new();
        inner.next_packet_id.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(inner.allocate_packet_id(), u16::MAX);
        assert_eq!(inner.allocate_packet_id(), 1);
    }

    #[test]
    fn packet_ids_in_flight_are_not_reused() {
        let inner = Inner::new();
        let (tx, _rx) = oneshot::channel();
        inner.pending.insert(1, tx);
        assert_eq!(inner.allocate_packet_id(), 2);
    }

    #[test]
    fn first_failure_wins() {
        let inner = Inner::new();
        inner.fail(TransportError::KeepAliveTimeout);
        inner.fail(TransportError::Closed);
        assert!(matches!(lock(&inner.failure).take(), Some(TransportError::KeepAliveTimeout)));
    }
}
