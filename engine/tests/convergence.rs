//! Convergence tests for kenpos-engine
//!
//! Replicas that exchange revisions must end up with identical documents no
//! matter in which order the revisions arrive.

use kenpos_engine::{ConflictResolver, DocRevision, DocumentTree, Leaf, Merge};
use proptest::prelude::*;
use serde_json::{json, Value};

fn stamped(value: u32, millis: i64) -> Value {
    json!({ "value": value, "updatedAt": millis })
}

/// Merge a revision and immediately run resolution, like the store does.
fn deliver(tree: &mut DocumentTree, leaf: Leaf) -> Merge {
    let outcome = tree.merge(leaf).unwrap();
    ConflictResolver::default().resolve(tree);
    outcome
}

fn current(tree: &DocumentTree) -> Leaf {
    tree.current().cloned().unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn two_replicas_converge_on_latest_edit() {
    let mut a = DocumentTree::new("order_7");
    a.edit(stamped(0, 1_000), false, None).unwrap();
    let mut b = a.clone();

    a.edit(stamped(1, 2_000), false, None).unwrap();
    b.edit(stamped(2, 3_000), false, None).unwrap();

    let from_a = current(&a);
    let from_b = current(&b);
    assert_eq!(deliver(&mut a, from_b), Merge::Conflicted);
    assert_eq!(deliver(&mut b, from_a), Merge::Conflicted);

    assert_eq!(a, b);
    assert_eq!(a.document().unwrap().body["value"], 2);
}

#[test]
fn tombstone_propagates_to_stale_peer() {
    let mut origin = DocumentTree::new("order_9");
    origin.edit(stamped(1, 1_000), false, None).unwrap();
    let mut peer = origin.clone();

    let rev = origin.current().unwrap().rev.clone();
    origin
        .edit(json!({"deletedAt": 2_000}), true, Some(&rev))
        .unwrap();

    assert_eq!(deliver(&mut peer, current(&origin)), Merge::Updated);
    assert!(peer.document().is_none());
    assert_eq!(peer, origin);
}

#[test]
fn resolved_revision_supersedes_losers_on_peer() {
    // a and b diverge; a resolves locally and ships only the merged leaf.
    let mut a = DocumentTree::new("cart");
    a.edit(stamped(0, 1), false, None).unwrap();
    let mut b = a.clone();
    let mut hub = a.clone();

    a.edit(stamped(1, 10), false, None).unwrap();
    let b_leaf = b.edit(stamped(2, 20), false, None).unwrap().clone();

    deliver(&mut a, b_leaf.clone());
    deliver(&mut hub, b_leaf);

    // hub only knows b's edit; receiving a's merged leaf fast-forwards it
    assert_eq!(deliver(&mut hub, current(&a)), Merge::Updated);
    assert_eq!(hub, a);

    // b fast-forwards too, dropping its own leaf as an ancestor
    assert_eq!(deliver(&mut b, current(&a)), Merge::Updated);
    assert_eq!(b, a);
}

#[test]
fn replaying_a_batch_is_idempotent() {
    let mut source = DocumentTree::new("cart");
    let mut batch = Vec::new();
    for i in 0..5 {
        batch.push(source.edit(stamped(i, i as i64), false, None).unwrap().clone());
    }

    let mut target = DocumentTree::new("cart");
    for leaf in &batch {
        deliver(&mut target, leaf.clone());
    }
    let once = target.clone();

    for leaf in &batch {
        assert_eq!(deliver(&mut target, leaf.clone()), Merge::Known);
    }
    assert_eq!(target, once);
    assert_eq!(target, source);
}

#[test]
fn wire_roundtrip_preserves_merge_semantics() {
    let mut a = DocumentTree::new("cart");
    a.edit(stamped(0, 1), false, None).unwrap();
    let mut b = a.clone();
    a.edit(stamped(1, 2), false, None).unwrap();

    let json = serde_json::to_string(&DocRevision::new("cart", current(&a))).unwrap();
    let received: DocRevision = serde_json::from_str(&json).unwrap();

    assert_eq!(deliver(&mut b, received.leaf), Merge::Updated);
    assert_eq!(a, b);
}

// ============================================================================
// Properties
// ============================================================================

fn edits() -> impl Strategy<Value = Vec<(u32, i64)>> {
    prop::collection::vec((any::<u32>(), 0i64..10_000), 1..6)
}

proptest! {
    /// Two replicas exchanging their heads in either order agree on the
    /// document and on the revision that holds it.
    #[test]
    fn pairwise_exchange_converges(left in edits(), right in edits()) {
        let mut a = DocumentTree::new("doc");
        a.edit(stamped(0, -1), false, None).unwrap();
        let mut b = a.clone();

        for (value, ts) in &left {
            a.edit(stamped(*value, *ts), false, None).unwrap();
        }
        for (value, ts) in &right {
            b.edit(stamped(*value, *ts), false, None).unwrap();
        }

        let head_a = current(&a);
        let head_b = current(&b);
        deliver(&mut a, head_b);
        deliver(&mut b, head_a);

        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.leaves().len(), 1);
    }

    /// Terminals syncing through a hub in any order end up identical to it,
    /// holding the body with the latest timestamp.
    #[test]
    fn hub_replication_converges(
        terminals in prop::collection::vec(edits(), 2..5),
        order in any::<u64>(),
    ) {
        let mut base = DocumentTree::new("doc");
        base.edit(stamped(0, -1), false, None).unwrap();
        let mut hub = base.clone();

        let mut replicas: Vec<DocumentTree> = terminals
            .iter()
            .map(|edits| {
                let mut tree = base.clone();
                for (value, ts) in edits {
                    tree.edit(stamped(*value, *ts), false, None).unwrap();
                }
                tree
            })
            .collect();

        let resolver = ConflictResolver::default();
        let expected_ts = replicas
            .iter()
            .map(|r| resolver.timestamp(r.current().unwrap()))
            .max()
            .unwrap();

        let n = replicas.len();
        let start = (order as usize) % n;
        for step in 0..n {
            let replica = &mut replicas[(start + step) % n];
            deliver(&mut hub, current(replica));
            deliver(replica, current(&hub));
        }
        for replica in replicas.iter_mut() {
            deliver(replica, current(&hub));
        }

        for replica in &replicas {
            prop_assert_eq!(replica, &hub);
        }
        prop_assert_eq!(resolver.timestamp(hub.current().unwrap()), expected_ts);
    }
}
