//! In-memory broker and connector.
//!
//! [`MockConnector`] hands out one `tokio::io::duplex` stream per connect
//! attempt; the other end of each stream is served by a [`MockBroker`] task
//! speaking [`MqttCodec`].

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mqttot::{
    codec::{self, ConnAck, Connect, MqttCodec, Packet, Publish},
    topic::Qos,
    transport::{BoxedStream, Connector, TransportError},
};
use serde_json::Value;
use tokio::{io::DuplexStream, sync::mpsc};
use tokio_util::codec::Framed;

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// How a [`MockBroker`] answers CONNECT.
#[derive(Clone, Debug, Default)]
pub enum Handshake {
    /// Accept with a non-empty CONNACK payload.
    #[default]
    Accept,
    /// Refuse with the given return code.
    Refuse(u8),
    /// Never answer.
    Silent,
}

/// Connector handing out queued in-memory streams.
///
/// Clones share the queue, so a test can keep a handle and add brokers for
/// later reconnect attempts.
#[derive(Clone, Debug, Default)]
pub struct MockConnector {
    streams: Arc<Mutex<VecDeque<DuplexStream>>>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Connector with an empty queue; attempts fail with
    /// [`TransportError::Closed`] until a broker is queued.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Queue a broker answering CONNECT with `handshake`.
    #[must_use]
    pub fn push_broker(&self, handshake: Handshake) -> MockBroker {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        self.streams.lock().expect("connector lock").push_back(client);
        MockBroker::spawn(server, handshake)
    }

    /// Queue an accepting broker.
    #[must_use]
    pub fn accepting(&self) -> MockBroker { self.push_broker(Handshake::Accept) }

    /// Connect attempts seen so far.
    #[must_use]
    pub fn attempts(&self) -> usize { self.attempts.load(Ordering::SeqCst) }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let stream = self
            .streams
            .lock()
            .expect("connector lock")
            .pop_front()
            .ok_or(TransportError::Closed)?;
        Ok(Box::new(stream))
    }
}

/// Handle to a broker task.
///
/// The task records the CONNECT packet, acknowledges `QoS 1` publishes and
/// forwards every publish to [`MockBroker::next_publish`]. Dropping the
/// handle or calling [`MockBroker::hang_up`] closes the connection.
#[derive(Debug)]
pub struct MockBroker {
    connects: mpsc::UnboundedReceiver<Connect>,
    published: mpsc::UnboundedReceiver<Publish>,
    outbound: Option<mpsc::UnboundedSender<Packet>>,
}

impl MockBroker {
    fn spawn(stream: DuplexStream, handshake: Handshake) -> Self {
        let mut framed = Framed::new(stream, MqttCodec::default());
        let (connects_tx, connects) = mpsc::unbounded_channel();
        let (published_tx, published) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = framed.next() => match packet {
                        Some(Ok(Packet::Connect(connect))) => {
                            let _ = connects_tx.send(connect);
                            let return_code = match handshake {
                                Handshake::Accept => 0,
                                Handshake::Refuse(code) => code,
                                Handshake::Silent => continue,
                            };
                            let connack = ConnAck {
                                flags: 0,
                                return_code,
                                payload: Bytes::from_static(b"{\"ok\":true}"),
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
            connects,
            published,
            outbound: Some(outbound),
        }
    }

    /// Wait for the client's CONNECT packet.
    ///
    /// # Panics
    ///
    /// Panics if none arrives within five seconds.
    pub async fn connect_packet(&mut self) -> Connect {
        tokio::time::timeout(Duration::from_secs(5), self.connects.recv())
            .await
            .expect("CONNECT not received in time")
            .expect("broker stopped before CONNECT")
    }

    /// Wait for the next publish from the client.
    ///
    /// # Panics
    ///
    /// Panics if none arrives within five seconds.
    pub async fn next_publish(&mut self) -> Publish {
        tokio::time::timeout(Duration::from_secs(5), self.published.recv())
            .await
            .expect("PUBLISH not received in time")
            .expect("broker stopped before PUBLISH")
    }

    /// Wait for the next publish on `topic_id`, skipping others.
    ///
    /// # Panics
    ///
    /// As for [`MockBroker::next_publish`].
    pub async fn publish_on(&mut self, topic_id: u16) -> Publish {
        let topic = topic_id.to_string();
        loop {
            let publish = self.next_publish().await;
            if publish.topic == topic {
                return publish;
            }
        }
    }

    /// Send `packet` to the client.
    ///
    /// # Panics
    ///
    /// Panics after [`MockBroker::hang_up`].
    pub fn send(&self, packet: Packet) {
        self.outbound
            .as_ref()
            .expect("broker hung up")
            .send(packet)
            .expect("broker task stopped");
    }

    /// Publish `body` as compressed JSON on `topic_id`.
    ///
    /// # Panics
    ///
    /// As for [`MockBroker::send`].
    pub fn push_json(&self, topic_id: u16, body: &Value) {
        let payload = codec::compress(body.to_string().as_bytes()).expect("compress payload");
        self.send(Packet::Publish(Publish {
            topic: topic_id.to_string(),
            packet_id: None,
            qos: Qos::AtMostOnce,
            retain: false,
            dup: false,
            payload: Bytes::from(payload),
        }));
    }

    /// Close the connection from the broker side.
    pub fn hang_up(&mut self) { self.outbound = None; }
}

/// Decode a publish body as compressed (or plain) JSON.
///
/// # Panics
///
/// Panics if the payload is not JSON.
#[must_use]
pub fn publish_json(publish: &Publish) -> Value {
    let bytes = codec::decompress(publish.payload.clone()).bytes;
    serde_json::from_slice(&bytes).expect("publish body is JSON")
}
