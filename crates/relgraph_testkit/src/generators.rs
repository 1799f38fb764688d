//! Property-based test generators using proptest.
//!
//! Provides strategies for column values and for the two graph shapes the
//! persistence engine reasons about: dependency DAGs for batch reordering
//! and ownership forests for lock propagation.

use proptest::prelude::*;
use relgraph_core::{DependencyGraph, EntityId, OwnershipGraph};
use relgraph_store::Value;
use std::collections::{HashMap, HashSet};

const TYPE_NAMES: [&str; 4] = ["Alpha", "Beta", "Gamma", "Delta"];

/// Strategy for non-null column values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[a-zA-Z0-9 ]{0,24}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
    ]
}

/// Strategy for column values including null.
pub fn nullable_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![1 => Just(Value::Null), 4 => value_strategy()]
}

/// A generated acyclic dependency graph over typed entities.
///
/// `ids` is in dependency order: every entity depends only on entities
/// before it.
#[derive(Debug, Clone)]
pub struct GeneratedDag {
    /// Entities, dependencies first.
    pub ids: Vec<EntityId>,
    types: HashMap<EntityId, &'static str>,
    deps: HashMap<EntityId, Vec<EntityId>>,
}

impl GeneratedDag {
    fn build(nodes: Vec<(usize, Vec<prop::sample::Index>)>) -> Self {
        let ids: Vec<EntityId> = nodes.iter().map(|_| EntityId::new()).collect();
        let mut types = HashMap::new();
        let mut deps = HashMap::new();
        for (i, (ty, picks)) in nodes.into_iter().enumerate() {
            types.insert(ids[i], TYPE_NAMES[ty]);
            let mut own: Vec<EntityId> = if i == 0 {
                Vec::new()
            } else {
                picks.iter().map(|p| ids[p.index(i)]).collect()
            };
            own.sort();
            own.dedup();
            deps.insert(ids[i], own);
        }
        Self { ids, types, deps }
    }

    /// Returns true if every entity comes after all of its dependencies.
    pub fn respects_dependencies(&self, order: &[EntityId]) -> bool {
        let position: HashMap<EntityId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        order.iter().all(|id| {
            self.dependencies(*id)
                .iter()
                .all(|dep| position.get(dep).map_or(true, |p| *p < position[id]))
        })
    }
}

impl DependencyGraph for GeneratedDag {
    fn type_of(&self, id: EntityId) -> Option<&str> {
        self.types.get(&id).copied()
    }

    fn dependencies(&self, id: EntityId) -> Vec<EntityId> {
        self.deps.get(&id).cloned().unwrap_or_default()
    }
}

/// Strategy for dependency DAGs of up to `max_nodes` entities.
pub fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = GeneratedDag> {
    prop::collection::vec(
        (
            0..TYPE_NAMES.len(),
            prop::collection::vec(any::<prop::sample::Index>(), 0..3),
        ),
        1..max_nodes.max(2),
    )
    .prop_map(GeneratedDag::build)
}

/// A generated ownership forest with a lock flag per entity and a set of
/// directly edited entities.
///
/// A forest may also carry back-edges: an entity owning one of its own
/// ancestors, which closes an ownership cycle. [`GeneratedForest::owner`]
/// follows the tree edges only.
#[derive(Debug, Clone)]
pub struct GeneratedForest {
    /// Entities, owners before what they own.
    pub ids: Vec<EntityId>,
    /// Directly edited entities.
    pub edited: HashSet<EntityId>,
    owner: HashMap<EntityId, EntityId>,
    children: HashMap<EntityId, Vec<EntityId>>,
    locked: HashSet<EntityId>,
    back_edges: usize,
}

type ForestNode = (
    Option<prop::sample::Index>,
    Option<prop::sample::Index>,
    bool,
    bool,
);

impl GeneratedForest {
    fn build(nodes: Vec<ForestNode>) -> Self {
        let ids: Vec<EntityId> = nodes.iter().map(|_| EntityId::new()).collect();
        let mut forest = Self {
            ids: ids.clone(),
            edited: HashSet::new(),
            owner: HashMap::new(),
            children: HashMap::new(),
            locked: HashSet::new(),
            back_edges: 0,
        };
        for (i, (parent, back, locked, edited)) in nodes.into_iter().enumerate() {
            if let (Some(parent), true) = (parent, i > 0) {
                let parent = ids[parent.index(i)];
                forest.owner.insert(ids[i], parent);
                forest.children.entry(parent).or_default().push(ids[i]);
            }
            let ancestors = forest.ancestors(ids[i]);
            if let (Some(back), false) = (back, ancestors.is_empty()) {
                let ancestor = ancestors[back.index(ancestors.len())];
                forest.children.entry(ids[i]).or_default().push(ancestor);
                forest.back_edges += 1;
            }
            if locked {
                forest.locked.insert(ids[i]);
            }
            if edited {
                forest.edited.insert(ids[i]);
            }
        }
        forest
    }

    fn ancestors(&self, id: EntityId) -> Vec<EntityId> {
        let mut ancestors = Vec::new();
        let mut current = self.owner(id);
        while let Some(owner) = current {
            ancestors.push(owner);
            current = self.owner(owner);
        }
        ancestors
    }

    /// The owner of an entity, if it has one.
    pub fn owner(&self, id: EntityId) -> Option<EntityId> {
        self.owner.get(&id).copied()
    }

    /// Number of owning edges that close a cycle.
    pub fn back_edges(&self) -> usize {
        self.back_edges
    }

    /// The entity whose lock covers an edit of `id`: the entity itself if
    /// locked, otherwise the nearest locked owner.
    pub fn lock_holder(&self, id: EntityId) -> Option<EntityId> {
        let mut current = Some(id);
        while let Some(candidate) = current {
            if self.locked.contains(&candidate) {
                return Some(candidate);
            }
            current = self.owner(candidate);
        }
        None
    }

    /// Returns true if an edited entity is `id` itself or is reachable from
    /// it through owned entities without a lock. Searches from scratch on
    /// every call.
    pub fn reaches_edit(&self, id: EntityId) -> bool {
        let mut seen = HashSet::from([id]);
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            if self.edited.contains(&current) {
                return true;
            }
            for child in self.owned(current) {
                if !self.locked.contains(&child) && seen.insert(child) {
                    queue.push(child);
                }
            }
        }
        false
    }
}

impl OwnershipGraph for GeneratedForest {
    fn owned(&self, id: EntityId) -> Vec<EntityId> {
        self.children.get(&id).cloned().unwrap_or_default()
    }

    fn has_lock(&self, id: EntityId) -> bool {
        self.locked.contains(&id)
    }
}

fn ownership_strategy(
    max_nodes: usize,
    back_edge_weight: f64,
) -> impl Strategy<Value = GeneratedForest> {
    prop::collection::vec(
        (
            prop::option::weighted(0.8, any::<prop::sample::Index>()),
            prop::option::weighted(back_edge_weight, any::<prop::sample::Index>()),
            prop::bool::weighted(0.4),
            prop::bool::weighted(0.3),
        ),
        1..max_nodes.max(2),
    )
    .prop_map(GeneratedForest::build)
}

/// Strategy for ownership forests of up to `max_nodes` entities.
pub fn forest_strategy(max_nodes: usize) -> impl Strategy<Value = GeneratedForest> {
    ownership_strategy(max_nodes, 0.0)
}

/// Strategy for ownership forests with back-edges closing cycles.
pub fn cyclic_forest_strategy(max_nodes: usize) -> impl Strategy<Value = GeneratedForest> {
    ownership_strategy(max_nodes, 0.3)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
