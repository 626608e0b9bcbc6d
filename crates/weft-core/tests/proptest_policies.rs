use proptest::prelude::*;
use serde_json::{Value as Json, json};
use weft_core::TypePolicy;
use weft_core::crdt::{
    GCounterPolicy, GSetPolicy, LwwSetPolicy, OrSetPolicy, PnCounterPolicy, TwoPhaseSetPolicy,
};
use weft_core::entry::{Entry, EntryId};
use weft_core::log::{derive_frontier, topological_order};

fn element() -> impl Strategy<Value = String> {
    "[a-e]"
}

fn gcounter_op() -> impl Strategy<Value = Json> {
    ("[a-c]", 1u64..10).prop_map(|(replica, amount)| json!({"replica": replica, "amount": amount}))
}

fn pncounter_op() -> impl Strategy<Value = Json> {
    (any::<bool>(), "[a-c]", 1u64..10).prop_map(|(up, replica, amount)| {
        let direction = if up { "increment" } else { "decrement" };
        json!({ direction: {"replica": replica, "amount": amount} })
    })
}

fn gset_op() -> impl Strategy<Value = Json> {
    element().prop_map(|e| json!({ "add": e }))
}

fn twophase_op() -> impl Strategy<Value = Json> {
    (any::<bool>(), element()).prop_map(|(add, e)| {
        if add {
            json!({ "add": e })
        } else {
            json!({ "remove": e })
        }
    })
}

fn lww_op() -> impl Strategy<Value = Json> {
    (any::<bool>(), element(), 0i64..20).prop_map(|(add, e, at)| {
        let kind = if add { "add" } else { "remove" };
        json!({ kind: {"element": e, "at": at} })
    })
}

fn orset_op() -> impl Strategy<Value = Json> {
    prop_oneof![
        (element(), "[0-9]").prop_map(|(e, tag)| json!({"add": {"element": e, "tag": tag}})),
        (element(), prop::collection::vec("[0-9]", 0..3))
            .prop_map(|(e, tags)| json!({"remove": {"element": e, "tags": tags}})),
    ]
}

/// Fold `ops` in the given order and in a shuffled order; values must agree.
fn assert_order_independent(
    policy: &dyn TypePolicy,
    ops: &[Json],
    shuffled: &[Json],
) -> Result<(), TestCaseError> {
    let fold = |messages: &[Json]| {
        let mut acc = policy.first();
        for message in messages {
            policy.reduce(message, &mut acc).expect("reduce");
        }
        policy.value_of(&acc)
    };
    prop_assert_eq!(fold(ops), fold(shuffled));
    Ok(())
}

fn with_shuffle(
    op: impl Strategy<Value = Json>,
) -> impl Strategy<Value = (Vec<Json>, Vec<Json>)> {
    prop::collection::vec(op, 0..24)
        .prop_flat_map(|ops| (Just(ops.clone()), Just(ops).prop_shuffle()))
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(512))]

    #[test]
    fn gcounter_commutes((ops, shuffled) in with_shuffle(gcounter_op())) {
        assert_order_independent(&GCounterPolicy, &ops, &shuffled)?;
    }

    #[test]
    fn pncounter_commutes((ops, shuffled) in with_shuffle(pncounter_op())) {
        assert_order_independent(&PnCounterPolicy, &ops, &shuffled)?;
    }

    #[test]
    fn gset_commutes((ops, shuffled) in with_shuffle(gset_op())) {
        assert_order_independent(&GSetPolicy, &ops, &shuffled)?;
    }

    #[test]
    fn twophase_commutes((ops, shuffled) in with_shuffle(twophase_op())) {
        assert_order_independent(&TwoPhaseSetPolicy, &ops, &shuffled)?;
    }

    #[test]
    fn lww_commutes((ops, shuffled) in with_shuffle(lww_op())) {
        assert_order_independent(&LwwSetPolicy, &ops, &shuffled)?;
    }

    #[test]
    fn orset_commutes((ops, shuffled) in with_shuffle(orset_op())) {
        assert_order_independent(&OrSetPolicy, &ops, &shuffled)?;
    }

    /// Random DAGs: the derived frontier is exactly the set of entries no
    /// other entry names as a parent, and topological order puts every
    /// parent before its children.
    #[test]
    fn frontier_and_order_respect_the_dag(
        shape in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), 1..20),
        shuffle_seed in any::<prop::sample::Index>(),
    ) {
        let mut entries: Vec<Entry> = Vec::new();
        for (i, parents) in shape.iter().enumerate() {
            let parent_ids: Vec<EntryId> = if entries.is_empty() {
                Vec::new()
            } else {
                parents.iter().map(|ix| entries[ix.index(entries.len())].id.clone()).collect()
            };
            entries.push(Entry::new(json!({"n": i}), parent_ids, "p"));
        }
        let rotate = shuffle_seed.index(entries.len());
        entries.rotate_left(rotate);

        let referenced: std::collections::BTreeSet<_> =
            entries.iter().flat_map(|e| e.parents.iter().cloned()).collect();
        let expected: std::collections::BTreeSet<_> = entries
            .iter()
            .map(|e| e.id.clone())
            .filter(|id| !referenced.contains(id))
            .collect();
        prop_assert_eq!(derive_frontier(&entries), expected);

        let order = topological_order(&entries);
        prop_assert_eq!(order.len(), entries.len());
        let position: std::collections::HashMap<_, _> =
            order.iter().enumerate().map(|(i, e)| (e.id.clone(), i)).collect();
        for entry in &entries {
            for parent in &entry.parents {
                prop_assert!(position[parent] < position[&entry.id]);
            }
        }
    }
}
