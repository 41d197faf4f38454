//! Gap detection and backfill through the client.

mod common;

use common::{fast_reconnect, harness, inbox, wait_for};
use mqttot::{
    RealtimeEvent,
    delta::MessageDelta,
    gap::GapScope,
    topic::MESSAGE_SYNC,
};
use mqttot_testing::frames;

fn message(item_id: &str, text: &str) -> MessageDelta {
    MessageDelta {
        item_id: item_id.into(),
        text: Some(text.into()),
        ..MessageDelta::default()
    }
}

#[tokio::test]
async fn thread_gap_is_backfilled() {
    let mut h = harness(fast_reconnect()).await;
    let broker = h.connector.accepting();
    h.client.connect().await.expect("connect");
    h.rest.queue_messages("t1", vec![message("101", "missed"), message("102", "also missed")]);

    broker.push_json(
        MESSAGE_SYNC.id,
        &frames::message_sync(11, vec![frames::item("add", "t1", "100", "first")]),
    );
    broker.push_json(
        MESSAGE_SYNC.id,
        &frames::message_sync(12, vec![frames::item("add", "t1", "103", "fourth")]),
    );

    let event = wait_for(&mut h.events, |e| matches!(e, RealtimeEvent::Gap(_))).await;
    let RealtimeEvent::Gap(gap) = event else { unreachable!() };
    assert_eq!(gap.scope, GapScope::Thread("t1".into()));
    assert_eq!((gap.from.as_str(), gap.to.as_str()), ("100", "103"));

    let event = wait_for(&mut h.events, |e| matches!(e, RealtimeEvent::GapFilled { .. })).await;
    assert!(matches!(event, RealtimeEvent::GapFilled { recovered: 2, .. }));

    let state = h.client.get_state().await.expect("state");
    let ids: Vec<_> = state.thread_messages("t1").iter().map(|m| m.item_id.clone()).collect();
    assert_eq!(ids.len(), 4);
    assert!(ids.contains(&"101".to_owned()));
    assert!(h.client.open_gaps().await.expect("gaps").is_empty());
}

#[tokio::test]
async fn stream_gap_refetches_the_inbox() {
    let mut h = harness(fast_reconnect()).await;
    let broker = h.connector.accepting();
    h.client.connect().await.expect("connect");
    h.rest.queue_snapshot(inbox(20));

    broker.push_json(MESSAGE_SYNC.id, &frames::message_sync(15, vec![]));

    let event = wait_for(&mut h.events, |e| matches!(e, RealtimeEvent::Gap(_))).await;
    assert!(matches!(event, RealtimeEvent::Gap(gap) if gap.scope == GapScope::Stream));
    let event = wait_for(&mut h.events, |e| matches!(e, RealtimeEvent::GapFilled { .. })).await;
    assert!(matches!(event, RealtimeEvent::GapFilled { recovered: 1, .. }));
    assert_eq!(h.rest.snapshot_calls(), 2);
}

#[tokio::test]
async fn failed_backfill_stays_open_until_retried() {
    let mut h = harness(fast_reconnect()).await;
    let broker = h.connector.accepting();
    h.client.connect().await.expect("connect");
    h.rest.fail_messages("t1", 503);

    broker.push_json(
        MESSAGE_SYNC.id,
        &frames::message_sync(11, vec![frames::item("add", "t1", "5", "a"), frames::item("add", "t1", "9", "b")]),
    );

    let event = wait_for(&mut h.events, |e| matches!(e, RealtimeEvent::Warning { .. })).await;
    assert!(matches!(event, RealtimeEvent::Warning { context: "backfill", .. }));
    assert_eq!(h.client.open_gaps().await.expect("gaps").len(), 1);

    h.rest.queue_messages("t1", vec![message("6", "recovered")]);
    assert_eq!(h.client.retry_gaps().await.expect("retry"), 1);

    wait_for(&mut h.events, |e| matches!(e, RealtimeEvent::GapFilled { recovered: 1, .. })).await;
    assert!(h.client.open_gaps().await.expect("gaps").is_empty());
    assert_eq!(h.rest.thread_calls(), 2);
}

#[tokio::test]
async fn edits_of_older_items_do_not_open_gaps() {
    let mut h = harness(fast_reconnect()).await;
    let broker = h.connector.accepting();
    h.client.connect().await.expect("connect");

    let entries = [
        frames::item("add", "t1", "100", "first"),
        frames::item("add", "t1", "101", "second"),
        frames::item("replace", "t1", "90", "old, edited"),
        frames::item("add", "t1", "102", "third"),
    ];
    for (seq_id, entry) in (11..).zip(entries) {
        broker.push_json(MESSAGE_SYNC.id, &frames::message_sync(seq_id, vec![entry]));
    }

    let mut messages = 0;
    while messages < 4 {
        let event = wait_for(&mut h.events, |e| {
            matches!(e, RealtimeEvent::Message { .. } | RealtimeEvent::Gap(_))
        })
        .await;
        assert!(!matches!(event, RealtimeEvent::Gap(_)), "unexpected gap: {event:?}");
        messages += 1;
    }
    assert!(h.client.open_gaps().await.expect("gaps").is_empty());
    assert_eq!(h.rest.thread_calls(), 0);
}
