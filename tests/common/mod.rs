//! Shared utilities for integration tests.
//!
//! Builds clients wired to a [`MockConnector`] and [`StubRest`], and waits
//! for events with a timeout.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{sync::Arc, time::Duration};

use mqttot::{
    InboxSnapshot,
    RealtimeClient,
    RealtimeEvent,
    connect::AuthSession,
    delta::ThreadDelta,
    reconnect::ReconnectConfig,
};
use mqttot_testing::{MockConnector, StubRest};
use tokio::sync::broadcast;

/// Snapshot holding thread `t1` at `seq_id`.
pub fn inbox(seq_id: i64) -> InboxSnapshot {
    InboxSnapshot {
        seq_id: Some(seq_id),
        snapshot_at_ms: Some(1_700_000_000_000),
        threads: vec![ThreadDelta {
            thread_id: "t1".into(),
            title: Some("Alice".into()),
            ..ThreadDelta::default()
        }],
        messages: Vec::new(),
    }
}

/// Client, its connector and REST stub.
pub struct Harness {
    pub client: RealtimeClient,
    pub connector: MockConnector,
    pub rest: Arc<StubRest>,
    pub events: broadcast::Receiver<RealtimeEvent>,
}

/// Build a client with a fast reconnect policy.
pub async fn harness(reconnect: ReconnectConfig) -> Harness {
    let connector = MockConnector::new();
    let rest = Arc::new(StubRest::with_snapshot(inbox(10)));
    let client = RealtimeClient::builder(AuthSession::new("42"), rest.clone())
        .connector(connector.clone())
        .reconnect(reconnect)
        .build()
        .await
        .expect("build client");
    let events = client.events();
    Harness {
        client,
        connector,
        rest,
        events,
    }
}

/// Reconnect policy with short delays.
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        ..ReconnectConfig::default()
    }
}

/// Wait up to five seconds for an event accepted by `wanted`.
pub async fn wait_for(
    events: &mut broadcast::Receiver<RealtimeEvent>,
    mut wanted: impl FnMut(&RealtimeEvent) -> bool,
) -> RealtimeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}
