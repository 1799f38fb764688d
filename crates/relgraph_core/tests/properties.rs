//! Property tests for batch reordering, lock propagation, the identity map and
//! the reverse-reference index.

use proptest::prelude::*;
use relgraph_core::{
    DependencyGraph, EntityId, LockPropagation, OperationGroup, OwnershipGraph, PersistRequest,
};
use relgraph_store::Value;
use relgraph_testkit::{
    cyclic_forest_strategy, dag_strategy, forest_strategy, value_strategy, GeneratedForest,
    PropTestConfig, TestStore,
};
use std::collections::HashSet;

fn shuffled(ids: &[EntityId], seed: u64) -> OperationGroup {
    let mut ids = ids.to_vec();
    let len = ids.len();
    let mut state = seed | 1;
    for i in (1..len).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        ids.swap(i, (state % (i as u64 + 1)) as usize);
    }
    ids.into_iter().collect()
}

/// Every edited entity plus its owners up to and including the first locked
/// one.
fn edit_chains(forest: &GeneratedForest) -> HashSet<EntityId> {
    let mut chains = HashSet::new();
    for edited in &forest.edited {
        let mut current = Some(*edited);
        while let Some(id) = current {
            chains.insert(id);
            current = if forest.has_lock(id) { None } else { forest.owner(id) };
        }
    }
    chains
}

proptest! {
    #![proptest_config(PropTestConfig::default().to_proptest_config())]

    #[test]
    fn insert_order_keeps_dependencies_first(dag in dag_strategy(32)) {
        let group: OperationGroup = dag.ids.iter().copied().collect();
        let optimized = group.optimized_for_insert(&dag, false);
        prop_assert_eq!(optimized.len(), group.len());
        prop_assert!(dag.respects_dependencies(optimized.as_slice()));
    }

    #[test]
    fn delete_order_keeps_dependents_first(dag in dag_strategy(32)) {
        let group: OperationGroup = dag.ids.iter().rev().copied().collect();
        let optimized = group.optimized_for_delete(&dag);
        let mut forward: Vec<EntityId> = optimized.as_slice().to_vec();
        forward.reverse();
        prop_assert!(dag.respects_dependencies(&forward));
    }

    #[test]
    fn reorder_keeps_every_entity(dag in dag_strategy(32), seed in any::<u64>()) {
        let group = shuffled(&dag.ids, seed);
        let optimized = group.optimized_for_update(&dag);
        let before: HashSet<EntityId> = group.iter().collect();
        let after: HashSet<EntityId> = optimized.iter().collect();
        prop_assert_eq!(before, after);
        for id in optimized.iter() {
            prop_assert!(dag.type_of(id).is_some());
        }
    }

    #[test]
    fn every_edit_reaches_its_lock_holder(forest in forest_strategy(32)) {
        let mut propagation = LockPropagation::new(&forest.edited);
        for id in &forest.edited {
            if let Some(holder) = forest.lock_holder(*id) {
                prop_assert!(propagation.is_required(&forest, holder));
            }
        }
    }

    #[test]
    fn required_entities_are_exactly_the_edit_chains(forest in forest_strategy(32)) {
        let chains = edit_chains(&forest);
        let mut propagation = LockPropagation::new(&forest.edited);
        for id in &forest.ids {
            prop_assert_eq!(propagation.is_required(&forest, *id), chains.contains(id));
        }
    }

    #[test]
    fn cyclic_ownership_answers_ignore_query_order(
        forest in cyclic_forest_strategy(32),
        seed in any::<u64>(),
    ) {
        let order = shuffled(&forest.ids, seed);
        let mut propagation = LockPropagation::new(&forest.edited);
        for id in order.iter() {
            prop_assert_eq!(propagation.is_required(&forest, id), forest.reaches_edit(id));
        }
    }

    #[test]
    fn required_unlocked_child_requires_its_owner(
        forest in cyclic_forest_strategy(32),
        seed in any::<u64>(),
    ) {
        let order = shuffled(&forest.ids, seed);
        let mut propagation = LockPropagation::new(&forest.edited);
        let required: HashSet<EntityId> = order
            .iter()
            .filter(|id| propagation.is_required(&forest, *id))
            .collect();
        for owner in &forest.ids {
            for child in forest.owned(*owner) {
                if !forest.has_lock(child) && required.contains(&child) {
                    prop_assert!(required.contains(owner));
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn identity_map_holds_one_entity_per_key(keys in prop::collection::vec(1i64..20, 1..40)) {
        let store = TestStore::new();
        let mut context = store.context();
        let mut seen = std::collections::HashMap::new();
        for key in keys {
            let id = context.get_or_create("Customer", Value::Integer(key)).unwrap();
            let first = *seen.entry(key).or_insert(id);
            prop_assert_eq!(first, id);
        }
        prop_assert_eq!(context.len(), seen.len());
    }

    #[test]
    fn reverse_index_matches_reference_keys(
        steps in prop::collection::vec((0usize..3, 0u8..4, 1i64..=3), 1..24),
    ) {
        let store = TestStore::new();
        for key in 1..=3 {
            store.seed_customer(key, "c", 1);
        }
        for key in 10..=12 {
            store.seed_order(key, None, 1);
        }
        let mut context = store.context();
        let orders: Vec<EntityId> = (10..=12)
            .map(|key| context.get_or_create("Order", Value::Integer(key)).unwrap())
            .collect();
        let customers: Vec<EntityId> = (1..=3)
            .map(|key| context.get_or_create("Customer", Value::Integer(key)).unwrap())
            .collect();

        for (order, action, key) in steps {
            let order = orders[order];
            let assigned = match action {
                0 => context.set_reference(order, "customer", Some(customers[key as usize - 1])),
                1 => context.set_reference_key(order, "customer", Some(Value::Integer(key))),
                2 => context.set_reference(order, "customer", None),
                _ => context.set_reference_key(order, "customer", None),
            };
            assigned.unwrap();
        }

        for order in &orders {
            let key = context.reference_key(*order, "customer").unwrap();
            for (i, customer) in customers.iter().enumerate() {
                let indexed = context
                    .references_to(*customer)
                    .iter()
                    .any(|r| r.source == *order && r.node == "customer");
                prop_assert_eq!(indexed, key == Some(Value::Integer(i as i64 + 1)));
            }
        }
    }

    #[test]
    fn saved_values_read_back(value in value_strategy()) {
        let store = TestStore::new();
        let mut context = store.context();
        let line = context.new_model("OrderLine").unwrap().id();
        context.set_value(line, "product", value.clone()).unwrap();
        context.persist(&PersistRequest::new().save(line)).unwrap();

        let key = context.key_of(line).unwrap().unwrap();
        let mut fresh = store.context();
        let reloaded = fresh.get_or_create("OrderLine", key).unwrap();
        prop_assert_eq!(fresh.get_value(reloaded, "product").unwrap(), value);
    }
}
