#![cfg(feature = "metrics")]
//! Tests for `mqttot` metrics helpers.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use mqttot::{
    delta::{DeltaBatch, DeltaItem, DeltaSyncEngine, MessageDelta, Operation},
    gap::GapDetector,
    metrics::{
        CONNECTIONS_ACTIVE,
        DELTA_OPERATIONS,
        Direction,
        FRAMES_PROCESSED,
        GAPS_DETECTED,
        RECONNECT_ATTEMPTS,
        dec_connections,
        inc_connections,
        inc_frames,
        inc_reconnects,
    },
};
use rstest::rstest;

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

/// Whether a counter named `name` carrying every label in `labels` was
/// incremented.
fn counter_recorded(snapshotter: &Snapshotter, name: &str, labels: &[(&str, &str)]) -> bool {
    snapshotter.snapshot().into_vec().iter().any(|(k, _, _, v)| {
        k.key().name() == name
            && labels
                .iter()
                .all(|(key, value)| k.key().labels().any(|l| l.key() == *key && l.value() == *value))
            && matches!(v, DebugValue::Counter(c) if *c > 0)
    })
}

#[rstest]
#[case(Direction::Inbound, "inbound")]
#[case(Direction::Outbound, "outbound")]
fn frame_metric_increments(#[case] direction: Direction, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || inc_frames(direction));

    assert!(
        counter_recorded(&snapshotter, FRAMES_PROCESSED, &[("direction", label)]),
        "{label} frames metric not recorded"
    );
}

#[test]
fn connection_gauge_tracks_open_connections() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        inc_connections();
        inc_connections();
        dec_connections();
    });

    let recorded = snapshotter.snapshot().into_vec();
    let found = recorded.iter().any(|(k, _, _, v)| {
        k.key().name() == CONNECTIONS_ACTIVE
            && matches!(v, DebugValue::Gauge(g) if (g.0 - 1.0).abs() < f64::EPSILON)
    });
    assert!(found, "connection gauge not recorded");
}

#[test]
fn applied_deltas_are_counted_by_kind_and_outcome() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        let mut engine = DeltaSyncEngine::new();
        engine.apply_batch(&DeltaBatch::new(vec![DeltaItem::message(
            Operation::Add,
            MessageDelta {
                item_id: "m1".into(),
                ..MessageDelta::default()
            },
        )]));
    });

    assert!(counter_recorded(
        &snapshotter,
        DELTA_OPERATIONS,
        &[("kind", "message")]
    ));
}

#[test]
fn gaps_are_counted_by_scope() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        let mut detector = GapDetector::with_baseline(Some(1));
        assert!(detector.observe_seq(5).is_some());
    });

    assert!(counter_recorded(&snapshotter, GAPS_DETECTED, &[("scope", "stream")]));
}

#[test]
fn reconnects_are_counted() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, inc_reconnects);

    assert!(counter_recorded(&snapshotter, RECONNECT_ATTEMPTS, &[]));
}
