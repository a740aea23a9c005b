//! Property-based tests for the message reconciler.
//!
//! Whatever mix and order of REST pages and push deliveries arrives, the
//! cache must hold each server message exactly once, in display order.

use std::collections::BTreeSet;

use lessonhub_chat::{ApplyOutcome, MessageKey, Reconciler};
use lessonhub_core::{Message, MessageDraft, MessageId};
use lessonhub_harness::message;
use proptest::prelude::*;

const CHAT: u64 = 7;

/// Same ID always yields the same record; timestamps collide often so the ID
/// tie-break is exercised.
fn record(id: MessageId) -> Message {
    message(CHAT, id, id % 3, &format!("m{id}"), (id * 7) % 20)
}

/// How a message reached the client.
#[derive(Debug, Clone)]
enum Delivery {
    Push(MessageId),
    Page(Vec<MessageId>),
}

fn delivery_strategy() -> impl Strategy<Value = Delivery> {
    prop_oneof![
        3 => (1u64..40).prop_map(Delivery::Push),
        1 => prop::collection::vec(1u64..40, 0..10).prop_map(Delivery::Page),
    ]
}

fn apply(reconciler: &mut Reconciler, delivery: &Delivery) {
    match delivery {
        Delivery::Push(id) => {
            reconciler.apply_incoming(CHAT, record(*id));
        },
        Delivery::Page(ids) => {
            reconciler.apply_history(CHAT, ids.iter().copied().map(record).collect());
        },
    }
}

fn delivered_ids(deliveries: &[Delivery]) -> BTreeSet<MessageId> {
    deliveries
        .iter()
        .flat_map(|d| match d {
            Delivery::Push(id) => vec![*id],
            Delivery::Page(ids) => ids.clone(),
        })
        .collect()
}

proptest! {
    /// Every delivered ID is cached exactly once.
    #[test]
    fn prop_each_message_cached_once(
        deliveries in prop::collection::vec(delivery_strategy(), 0..40)
    ) {
        let mut reconciler = Reconciler::new();
        for delivery in &deliveries {
            apply(&mut reconciler, delivery);
        }

        let cached: Vec<MessageId> = reconciler.messages(CHAT).iter().map(|m| m.id).collect();
        let unique: BTreeSet<MessageId> = cached.iter().copied().collect();
        prop_assert_eq!(cached.len(), unique.len());
        prop_assert_eq!(unique, delivered_ids(&deliveries));
    }

    /// Cached messages are ordered by creation time, then ID.
    #[test]
    fn prop_messages_in_display_order(
        deliveries in prop::collection::vec(delivery_strategy(), 0..40)
    ) {
        let mut reconciler = Reconciler::new();
        for delivery in &deliveries {
            apply(&mut reconciler, delivery);
        }

        let keys: Vec<_> = reconciler.messages(CHAT).iter().map(|m| m.sort_key()).collect();
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", keys);
    }

    /// Arrival order does not change the result.
    #[test]
    fn prop_arrival_order_irrelevant(
        (ids, shuffled) in prop::collection::vec(1u64..40, 0..30)
            .prop_flat_map(|ids| (Just(ids.clone()), Just(ids).prop_shuffle()))
    ) {
        let mut in_order = Reconciler::new();
        let mut reordered = Reconciler::new();
        for id in &ids {
            in_order.apply_incoming(CHAT, record(*id));
        }
        for id in &shuffled {
            reordered.apply_incoming(CHAT, record(*id));
        }

        prop_assert_eq!(in_order.messages(CHAT), reordered.messages(CHAT));
    }

    /// Applying a message a second time is a no-op.
    #[test]
    fn prop_reapply_is_duplicate(ids in prop::collection::vec(1u64..40, 1..20)) {
        let mut reconciler = Reconciler::new();
        for id in &ids {
            reconciler.apply_incoming(CHAT, record(*id));
        }
        let before: Vec<Message> = reconciler.messages(CHAT).into_iter().cloned().collect();

        for id in &ids {
            prop_assert_eq!(reconciler.apply_incoming(CHAT, record(*id)), ApplyOutcome::Duplicate);
        }
        let after: Vec<Message> = reconciler.messages(CHAT).into_iter().cloned().collect();
        prop_assert_eq!(before, after);
    }

    /// Pending entries never collide with confirmed ones and confirming
    /// removes exactly the confirmed entry.
    #[test]
    fn prop_confirm_replaces_pending(count in 1usize..10, confirmed in 0usize..10) {
        let mut reconciler = Reconciler::new();
        let sender = record(1).sender;
        let local_ids: Vec<_> = (0..count)
            .map(|i| {
                let draft = MessageDraft::text(format!("draft {i}"));
                reconciler.apply_optimistic(CHAT, sender.clone(), draft, 100 + i as u64)
            })
            .collect();

        let target = local_ids[confirmed % count];
        reconciler.confirm(CHAT, target, record(1_000));

        let keys: Vec<_> = reconciler.entries(CHAT).iter().map(|e| e.key()).collect();
        prop_assert_eq!(keys.len(), count);
        prop_assert!(keys.contains(&MessageKey::Confirmed(1_000)));
        prop_assert!(!keys.contains(&MessageKey::Pending(target)));
    }
}
