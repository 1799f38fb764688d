//! Benchmark utilities.

use rand::seq::SliceRandom;
use rand::Rng;
use relgraph_core::{DependencyGraph, EntityContext, EntityId, PersistRequest};
use relgraph_store::Value;
use relgraph_testkit::TestStore;
use std::collections::HashMap;

const TYPE_NAMES: [&str; 6] = ["Customer", "Order", "OrderLine", "Address", "Party", "Invoice"];

/// A random acyclic dependency graph in shuffled insert order.
pub struct RandomDag {
    /// Entities, dependencies first.
    pub ids: Vec<EntityId>,
    types: HashMap<EntityId, &'static str>,
    deps: HashMap<EntityId, Vec<EntityId>>,
}

impl RandomDag {
    /// Builds a graph of `size` entities with up to `fan_in` dependencies
    /// each.
    pub fn new(size: usize, fan_in: usize) -> Self {
        let mut rng = rand::thread_rng();
        let ids: Vec<EntityId> = (0..size).map(|_| EntityId::new()).collect();
        let mut types = HashMap::with_capacity(size);
        let mut deps = HashMap::with_capacity(size);
        for (i, id) in ids.iter().enumerate() {
            types.insert(*id, *TYPE_NAMES.choose(&mut rng).unwrap_or(&TYPE_NAMES[0]));
            let count = if i == 0 { 0 } else { rng.gen_range(0..=fan_in) };
            let own: Vec<EntityId> = (0..count).map(|_| ids[rng.gen_range(0..i)]).collect();
            deps.insert(*id, own);
        }
        Self { ids, types, deps }
    }
}

impl DependencyGraph for RandomDag {
    fn type_of(&self, id: EntityId) -> Option<&str> {
        self.types.get(&id).copied()
    }

    fn dependencies(&self, id: EntityId) -> Vec<EntityId> {
        self.deps.get(&id).cloned().unwrap_or_default()
    }
}

/// Builds `orders` new orders with `lines` lines each in a fresh context.
pub fn new_order_graph(store: &TestStore, orders: usize, lines: usize) -> (EntityContext, PersistRequest) {
    let mut context = store.context();
    let mut request = PersistRequest::new();
    for i in 0..orders {
        let order = context.new_model("Order").unwrap().id();
        context
            .set_value(order, "number", Value::Text(format!("B-{i}")))
            .unwrap();
        for quantity in 0..lines as i64 {
            let line = context.new_model("OrderLine").unwrap().id();
            context.set_value(line, "quantity", Value::Integer(quantity)).unwrap();
            context.collection_add(order, "lines", line).unwrap();
        }
        request = request.save(order);
    }
    (context, request)
}

/// Loads `count` seeded customers and renames each, returning the request
/// that saves them.
pub fn renamed_customers(store: &TestStore, count: i64, round: usize) -> (EntityContext, PersistRequest) {
    let mut context = store.context();
    let mut request = PersistRequest::new();
    for key in 1..=count {
        let customer = context.get_or_create("Customer", Value::Integer(key)).unwrap();
        context
            .set_value(customer, "name", Value::Text(format!("r{round}-{key}")))
            .unwrap();
        request = request.save(customer);
    }
    (context, request)
}
