//! Property tests for the delta engine.

use std::collections::BTreeMap;

use mqttot::delta::{DeltaBatch, DeltaItem, DeltaSyncEngine, MessageDelta, Operation};
use proptest::prelude::*;

fn op() -> impl Strategy<Value = Operation> {
    prop_oneof![Just(Operation::Add), Just(Operation::Update), Just(Operation::Delete)]
}

fn item() -> impl Strategy<Value = DeltaItem> {
    (op(), 0u8..6, proptest::option::of("[a-z]{0,8}")).prop_map(|(op, id, text)| {
        DeltaItem::message(
            op,
            MessageDelta {
                item_id: format!("m{id}"),
                thread_id: Some("t1".into()),
                text,
                ..MessageDelta::default()
            },
        )
    })
}

/// Expected text per live message after applying `items` in order.
fn model(items: &[DeltaItem]) -> BTreeMap<String, Option<String>> {
    let mut live = BTreeMap::new();
    for item in items {
        let mqttot::delta::DeltaRecord::Message(message) = &item.record else {
            continue;
        };
        match item.op {
            Operation::Add => {
                live.insert(message.item_id.clone(), message.text.clone());
            }
            Operation::Update => {
                let slot = live.entry(message.item_id.clone()).or_insert(None);
                if message.text.is_some() {
                    slot.clone_from(&message.text);
                }
            }
            Operation::Delete => {
                live.remove(&message.item_id);
            }
        }
    }
    live
}

proptest! {
    #[test]
    fn state_matches_sequential_model(items in proptest::collection::vec(item(), 0..40)) {
        let mut engine = DeltaSyncEngine::new();
        engine.apply_batch(&DeltaBatch::new(items.clone()));

        let state = engine.snapshot();
        let actual: BTreeMap<_, _> = state
            .messages
            .iter()
            .map(|(id, message)| (id.clone(), message.text.clone()))
            .collect();
        prop_assert_eq!(actual, model(&items));
    }

    #[test]
    fn batching_does_not_change_the_result(
        items in proptest::collection::vec(item(), 0..40),
        split in 0usize..40,
    ) {
        let split = split.min(items.len());
        let mut whole = DeltaSyncEngine::new();
        whole.apply_batch(&DeltaBatch::new(items.clone()));

        let mut parts = DeltaSyncEngine::new();
        parts.apply_batch(&DeltaBatch::new(items[..split].to_vec()));
        parts.apply_batch(&DeltaBatch::new(items[split..].to_vec()));

        prop_assert_eq!(whole.snapshot(), parts.snapshot());
    }

    #[test]
    fn reapplying_adds_is_idempotent(items in proptest::collection::vec(item(), 0..20)) {
        let adds: Vec<_> = items
            .into_iter()
            .map(|mut item| {
                item.op = Operation::Add;
                item
            })
            .collect();
        let mut engine = DeltaSyncEngine::new();
        engine.apply_batch(&DeltaBatch::new(adds.clone()));
        let once = engine.snapshot();
        engine.apply_batch(&DeltaBatch::new(adds));
        prop_assert_eq!(once, engine.snapshot());
    }
}
