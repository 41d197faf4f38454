//! Client facade tests against an in-memory broker.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{
    io::DuplexStream,
    sync::{broadcast, mpsc},
};
use tokio_util::codec::Framed;

use super::*;
use crate::{
    codec::{self, ConnAck, MqttCodec, Packet, Publish},
    connect::AuthSession,
    delta::{MessageDelta, Operation, ThreadDelta},
    error::RealtimeError,
    events::RealtimeEvent,
    persistence::{PersistenceConfig, SeqIds},
    reconnect::ReconnectConfig,
    rest::{InboxSnapshot, RestCollaborator, RestError, UserInfo},
    topic::Qos,
    transport::{BoxedStream, Connector, TransportError, TransportState},
};

#[derive(Default)]
struct QueueConnector(Mutex<VecDeque<DuplexStream>>);

#[async_trait]
impl Connector for QueueConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let stream = self
            .0
            .lock()
            .expect("connector lock")
            .pop_front()
            .ok_or(TransportError::Closed)?;
        Ok(Box::new(stream))
    }
}

#[derive(Default)]
struct StubRest {
    snapshot: InboxSnapshot,
}

#[async_trait]
impl RestCollaborator for StubRest {
    async fn inbox_snapshot(&self) -> Result<InboxSnapshot, RestError> { Ok(self.snapshot.clone()) }

    async fn thread_messages(&self, _thread_id: &str, _limit: usize) -> Result<Vec<MessageDelta>, RestError> {
        Ok(Vec::new())
    }

    async fn user_info(&self, user_id: &str) -> Result<UserInfo, RestError> {
        Ok(UserInfo {
            user_id: user_id.to_owned(),
            username: format!("user{user_id}"),
            full_name: None,
        })
    }
}

/// Broker task that accepts the handshake, acknowledges QoS 1 publishes
/// and forwards them for inspection.
struct Broker {
    published: mpsc::UnboundedReceiver<Publish>,
    outbound: Option<mpsc::UnboundedSender<Packet>>,
}

impl Broker {
    fn spawn(stream: DuplexStream) -> Self {
        let mut framed = Framed::new(stream, MqttCodec::default());
        let (published_tx, published) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = framed.next() => match packet {
                        Some(Ok(Packet::Connect(_))) => {
                            let connack = ConnAck {
                                flags: 0,
                                return_code: 0,
                                payload: Bytes::from_static(b"{}"),
                            };
                            let _ = framed.send(Packet::ConnAck(connack)).await;
                        }
                        Some(Ok(Packet::Publish(publish))) => {
                            if let Some(packet_id) = publish.packet_id {
                                let _ = framed.send(Packet::PubAck { packet_id }).await;
                            }
                            let _ = published_tx.send(publish);
                        }
                        Some(Ok(Packet::PingReq)) => {
                            let _ = framed.send(Packet::PingResp).await;
                        }
                        Some(Ok(Packet::Disconnect) | Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    packet = outbound_rx.recv() => match packet {
                        Some(packet) => {
                            let _ = framed.send(packet).await;
                        }
                        None => break,
                    },
                }
            }
        });
        Self {
            published,
            outbound: Some(outbound),
        }
    }

    async fn next_publish(&mut self) -> Publish { self.published.recv().await.expect("publish") }

    fn push(&self, topic: u16, body: &Value) {
        let payload = codec::compress(body.to_string().as_bytes()).expect("compress");
        let publish = Publish {
            topic: topic.to_string(),
            packet_id: None,
            qos: Qos::AtMostOnce,
            retain: false,
            dup: false,
            payload: Bytes::from(payload),
        };
        self.outbound
            .as_ref()
            .expect("broker open")
            .send(Packet::Publish(publish))
            .expect("broker task");
    }

    /// Drop the connection from the broker side.
    fn hang_up(&mut self) { self.outbound = None; }
}

fn snapshot() -> InboxSnapshot {
    InboxSnapshot {
        seq_id: Some(10),
        snapshot_at_ms: Some(1_700_000_000_000),
        threads: vec![ThreadDelta {
            thread_id: "t1".into(),
            title: Some("Alice".into()),
            ..ThreadDelta::default()
        }],
        messages: Vec::new(),
    }
}

async fn client(brokers: usize, persistence: Option<PersistenceConfig>) -> (RealtimeClient, Vec<Broker>) {
    let connector = QueueConnector::default();
    let mut handles = Vec::new();
    for _ in 0..brokers {
        let (client_end, broker_end) = tokio::io::duplex(64 * 1024);
        connector.0.lock().expect("connector lock").push_back(client_end);
        handles.push(Broker::spawn(broker_end));
    }
    let rest = Arc::new(StubRest { snapshot: snapshot() });
    let mut builder = RealtimeClient::builder(AuthSession::new("42"), rest)
        .connector(connector)
        .reconnect(ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            ..ReconnectConfig::default()
        });
    if let Some(config) = persistence {
        builder = builder.persistence(config);
    }
    (builder.build().await.expect("build client"), handles)
}

async fn wait_for(
    events: &mut broadcast::Receiver<RealtimeEvent>,
    mut wanted: impl FnMut(&RealtimeEvent) -> bool,
) -> RealtimeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

fn body(publish: &Publish) -> Value {
    let bytes = codec::decompress(publish.payload.clone()).bytes;
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn commands_require_a_connection() {
    let (client, _) = client(0, None).await;

    let err = client.send_text("t1", "hi").await.expect_err("not connected");
    assert!(matches!(err, RealtimeError::NotConnected));
    assert!(!client.is_connected());
    assert_eq!(client.transport_state(), None);
}

#[tokio::test]
async fn cold_start_applies_snapshot_and_subscribes() {
    let (client, mut brokers) = client(1, None).await;
    let mut events = client.events();

    client.connect().await.expect("connect");

    let broker = &mut brokers[0];
    let topics = [
        broker.next_publish().await,
        broker.next_publish().await,
        broker.next_publish().await,
    ]
    .map(|publish| publish.topic);
    assert_eq!(topics, ["149", "88", "134"].map(String::from));
    let event = wait_for(&mut events, |e| matches!(e, RealtimeEvent::Connected { .. })).await;
    assert!(matches!(event, RealtimeEvent::Connected { resumed: false }));
    assert_eq!(client.transport_state(), Some(TransportState::Active));

    let state = client.get_state().await.expect("state");
    assert_eq!(state.thread("t1").map(|t| t.title.as_str()), Some("Alice"));
}

#[tokio::test]
async fn live_deltas_update_state_and_emit_events() {
    let (client, mut brokers) = client(1, None).await;
    let mut events = client.events();
    client.connect().await.expect("connect");

    brokers[0].push(
        146,
        &json!({
            "seq_id": 11,
            "data": [{
                "op": "add",
                "path": "/direct_v2/threads/t1/items/m1",
                "value": {"item_id": "m1", "user_id": "7", "text": "hello"}
            }]
        }),
    );

    let event = wait_for(&mut events, |e| matches!(e, RealtimeEvent::Message { .. })).await;
    let RealtimeEvent::Message { op, message } = event else {
        unreachable!()
    };
    assert_eq!(op, Operation::Add);
    assert_eq!(message.text.as_deref(), Some("hello"));

    let state = client.get_state().await.expect("state");
    assert_eq!(state.thread_messages("t1").len(), 1);
    assert!(client.open_gaps().await.expect("gaps").is_empty());
}

#[tokio::test]
async fn send_text_publishes_a_command_envelope() {
    let (client, mut brokers) = client(1, None).await;
    client.connect().await.expect("connect");
    for _ in 0..3 {
        brokers[0].next_publish().await;
    }

    let context = client.send_text("t1", "hi").await.expect("send");

    let publish = brokers[0].next_publish().await;
    assert_eq!(publish.topic, "132");
    let body = body(&publish);
    assert_eq!(body["action"], "send_item");
    assert_eq!(body["text"], "hi");
    assert_eq!(body["client_context"], context);
}

#[tokio::test]
async fn deliberate_disconnect_does_not_reconnect() {
    let (client, _brokers) = client(1, None).await;
    let mut events = client.events();
    client.connect().await.expect("connect");

    client.disconnect().await;

    let event = wait_for(&mut events, |e| matches!(e, RealtimeEvent::Disconnected { .. })).await;
    assert!(matches!(event, RealtimeEvent::Disconnected { deliberate: true, .. }));
    assert!(!client.reconnect_state().pending);
    assert!(!client.is_connected());
    client.disconnect().await;
}

#[tokio::test]
async fn unexpected_close_reconnects() {
    let (client, mut brokers) = client(2, None).await;
    let mut events = client.events();
    client.connect().await.expect("connect");
    wait_for(&mut events, |e| matches!(e, RealtimeEvent::Connected { .. })).await;

    brokers[0].hang_up();

    let event = wait_for(&mut events, |e| matches!(e, RealtimeEvent::Disconnected { .. })).await;
    assert!(matches!(event, RealtimeEvent::Disconnected { deliberate: false, .. }));
    let event = wait_for(&mut events, |e| matches!(e, RealtimeEvent::Reconnecting { .. })).await;
    assert!(matches!(event, RealtimeEvent::Reconnecting { attempt: 1, .. }));
    wait_for(&mut events, |e| matches!(e, RealtimeEvent::Connected { .. })).await;
    assert!(client.is_connected());
    assert_eq!(client.reconnect_state().attempt, 0);
}

#[tokio::test]
async fn session_state_is_persisted_and_resumed() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let (client, _brokers) = client(1, Some(PersistenceConfig::new(dir.path()))).await;
        client.connect().await.expect("connect");
        let record = client.session_record().expect("record");
        assert_eq!(
            record.seq_ids,
            Some(SeqIds {
                seq_id: 10,
                snapshot_at_ms: 1_700_000_000_000,
            })
        );
        assert!(record.mqtt.and_then(|m| m.mqtt_session_id).is_some());
        client.disconnect().await;
    }

    let (client, _brokers) = client(1, Some(PersistenceConfig::new(dir.path()))).await;
    let mut events = client.events();
    client.connect().await.expect("reconnect");
    let event = wait_for(&mut events, |e| matches!(e, RealtimeEvent::Connected { .. })).await;
    assert!(matches!(event, RealtimeEvent::Connected { resumed: true }));
    assert!(client.get_state().await.expect("state").thread("t1").is_none());
}

#[tokio::test]
async fn observers_see_applied_batches() {
    let (client, _brokers) = client(1, None).await;
    let seen = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&seen);
    let id = client
        .observe(move |batch, _| *counter.lock().expect("lock") += batch.len())
        .await
        .expect("observe");

    client.connect().await.expect("connect");
    client.stats().await.expect("stats");

    assert_eq!(*seen.lock().expect("lock"), 1);
    assert!(client.unobserve(id).await.expect("unobserve"));
}

#[tokio::test]
async fn users_are_resolved_through_the_collaborator() {
    let (client, _) = client(0, None).await;
    let user = client.resolve_user("5").await.expect("resolve");
    assert_eq!(user.username, "user5");
}
