//! Randomized multi-replica histories.
//!
//! Three replicas edit independently and occasionally exchange what they
//! have seen. Every operation ever produced is then replayed onto fresh
//! replicas in shuffled order, with repeats, and the results compared.

use pairwise_core::{ApplyOutcome, Document, Operation, ReplicaId};
use proptest::prelude::*;
use std::collections::HashMap;

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Action {
    Insert { replica: usize, pos: usize, text: String },
    Delete { replica: usize, pos: usize },
    Sync { from: usize, to: usize },
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => (0..REPLICAS, any::<usize>(), "[a-z]{1,3}")
            .prop_map(|(replica, pos, text)| Action::Insert { replica, pos, text }),
        2 => (0..REPLICAS, any::<usize>())
            .prop_map(|(replica, pos)| Action::Delete { replica, pos }),
        1 => (0..REPLICAS, 0..REPLICAS).prop_map(|(from, to)| Action::Sync { from, to }),
    ]
}

/// Play a history. Returns the replicas, what each has seen (in the order
/// it saw it) and every operation produced.
fn play(actions: &[Action]) -> (Vec<Document>, Vec<Vec<Operation>>, Vec<Operation>) {
    let mut docs: Vec<Document> = (0..REPLICAS).map(|_| Document::new()).collect();
    let mut seen: Vec<Vec<Operation>> = vec![Vec::new(); REPLICAS];
    let mut produced = Vec::new();

    for action in actions {
        match action {
            Action::Insert { replica, pos, text } => {
                let doc = &mut docs[*replica];
                let pos = pos % (doc.len() + 1);
                let op = doc
                    .insert_at(ReplicaId(*replica as u64 + 1), pos, text)
                    .unwrap();
                seen[*replica].push(op.clone());
                produced.push(op);
            }
            Action::Delete { replica, pos } => {
                let doc = &mut docs[*replica];
                if doc.is_empty() {
                    continue;
                }
                let pos = pos % doc.len();
                if let Some(op) = doc.delete_at(ReplicaId(*replica as u64 + 1), pos).unwrap() {
                    seen[*replica].push(op.clone());
                    produced.push(op);
                }
            }
            Action::Sync { from, to } => {
                for op in seen[*from].clone() {
                    if docs[*to].apply(op.clone()).unwrap() != ApplyOutcome::Duplicate {
                        seen[*to].push(op);
                    }
                }
            }
        }
    }
    (docs, seen, produced)
}

fn history() -> impl Strategy<Value = (Vec<Operation>, Vec<Operation>)> {
    prop::collection::vec(action(), 1..48).prop_flat_map(|actions| {
        let (_, _, produced) = play(&actions);
        (Just(produced.clone()), Just(produced).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn prop_any_delivery_order_converges((ordered, shuffled) in history()) {
        let mut reference = Document::new();
        for op in &ordered {
            reference.apply(op.clone()).unwrap();
        }

        let mut replica = Document::new();
        let mut last_from: HashMap<ReplicaId, u64> = HashMap::new();
        for op in &shuffled {
            if let ApplyOutcome::Applied(order) = replica.apply(op.clone()).unwrap() {
                // one replica's operations take effect in the order it issued them
                for applied in order {
                    let id = applied.id();
                    let last = last_from.insert(id.replica, id.counter);
                    prop_assert!(last.map_or(true, |c| c < id.counter));
                }
            }
        }
        // Second delivery of everything changes nothing.
        let before = replica.snapshot();
        for op in shuffled.iter().rev() {
            prop_assert_eq!(replica.apply(op.clone()).unwrap(), ApplyOutcome::Duplicate);
        }
        prop_assert_eq!(replica.snapshot(), before);

        prop_assert_eq!(replica.text(), reference.text());
        prop_assert_eq!(replica.applied_ids(), reference.applied_ids());
        prop_assert_eq!(replica.pending_count(), 0);
    }

    #[test]
    fn prop_full_exchange_converges(actions in prop::collection::vec(action(), 1..48)) {
        let (mut docs, seen, _) = play(&actions);
        let everything: Vec<Operation> = seen.into_iter().flatten().collect();
        for doc in docs.iter_mut() {
            for op in &everything {
                doc.apply(op.clone()).unwrap();
            }
        }
        let text = docs[0].text();
        for doc in &docs[1..] {
            prop_assert_eq!(doc.text(), text.clone());
            prop_assert_eq!(doc.applied_ids(), docs[0].applied_ids());
        }
    }

    #[test]
    fn prop_snapshot_merge_matches_replay((ordered, shuffled) in history()) {
        let split = shuffled.len() / 2;
        let mut left = Document::new();
        let mut right = Document::new();
        for op in &shuffled[..split] {
            left.apply(op.clone()).unwrap();
        }
        for op in &shuffled[split..] {
            right.apply(op.clone()).unwrap();
        }
        left.merge_snapshot(&right.snapshot()).unwrap();

        let mut reference = Document::new();
        for op in &ordered {
            reference.apply(op.clone()).unwrap();
        }
        prop_assert_eq!(left.text(), reference.text());
        prop_assert_eq!(left.applied_ids(), reference.applied_ids());
    }
}

#[test]
fn test_dependent_operations_apply_in_origin_order() {
    let mut origin = Document::new();
    let r = ReplicaId(5);
    let first = origin.insert_at(r, 0, "ab").unwrap();
    let second = origin.insert_at(r, 2, "c").unwrap();
    let third = origin.delete_at(r, 0).unwrap().unwrap();

    let mut remote = Document::new();
    assert_eq!(remote.apply(third.clone()).unwrap(), ApplyOutcome::Buffered);
    assert_eq!(remote.apply(second.clone()).unwrap(), ApplyOutcome::Buffered);
    assert_eq!(
        remote.apply(first.clone()).unwrap(),
        ApplyOutcome::Applied(vec![first, second, third])
    );
    assert_eq!(remote.text(), origin.text());
    assert_eq!(remote.text(), "bc");
}

#[test]
fn test_independent_operations_from_one_replica_keep_issue_order() {
    let mut base = Document::new();
    base.insert_at(ReplicaId(1), 0, "xy").unwrap();

    // Neither edit references the other; only issue order links them.
    let mut origin = base.clone();
    let r = ReplicaId(2);
    let head = origin.insert_at(r, 0, "a").unwrap();
    let tail = origin.insert_at(r, 3, "b").unwrap();
    let drop_x = origin.delete_at(r, 1).unwrap().unwrap();
    let drop_y = origin.delete_at(r, 1).unwrap().unwrap();
    assert_eq!(origin.text(), "ab");

    let mut remote = base.clone();
    for late in [&drop_y, &drop_x, &tail] {
        assert_eq!(remote.apply(late.clone()).unwrap(), ApplyOutcome::Buffered);
        assert_eq!(remote.text(), "xy");
    }
    assert_eq!(
        remote.apply(head.clone()).unwrap(),
        ApplyOutcome::Applied(vec![head, tail, drop_x, drop_y])
    );
    assert_eq!(remote.text(), "ab");
    assert_eq!(remote.pending_count(), 0);
}
