//! Optimistic-lock propagation through ownership.
//!
//! An entity is update-required when it was edited directly, or when it owns
//! an unlocked entity that is update-required. Locked children absorb the
//! change themselves, so propagation stops at the first locked ancestor.

use crate::context::EntityContext;
use crate::entity::{EntityId, Node};
use crate::schema::NodeDef;
use relgraph_store::Value;
use std::collections::HashSet;

/// Ownership edges and lock presence.
pub trait OwnershipGraph {
    /// Entities owned by `id`.
    fn owned(&self, id: EntityId) -> Vec<EntityId>;

    /// Returns true if `id`'s type carries an optimistic lock.
    fn has_lock(&self, id: EntityId) -> bool;
}

impl OwnershipGraph for EntityContext {
    /// Current children plus those detached since the last persist, so that
    /// removing a child also counts as editing its owner.
    fn owned(&self, id: EntityId) -> Vec<EntityId> {
        let mut owned = self.owned_children(id);
        let Ok(entity) = self.get(id) else {
            return owned;
        };
        for (name, def) in &entity.entity_type().nodes {
            match (def, entity.node(name)) {
                (NodeDef::Collection { owning: true, .. }, Some(Node::Collection(collection))) => {
                    owned.extend(collection.removed_entities().iter().copied());
                }
                (
                    NodeDef::Reference {
                        owning: true,
                        target,
                        ..
                    },
                    Some(Node::Reference(reference)),
                ) => {
                    if let Some(key) = reference.removed_key() {
                        if let Ok(Some(old)) = self.get_by_key(target, key) {
                            owned.push(old);
                        }
                    }
                }
                _ => {}
            }
        }
        owned.sort_unstable();
        owned.dedup();
        owned
    }

    fn has_lock(&self, id: EntityId) -> bool {
        self.get(id)
            .map(|e| e.entity_type().has_lock())
            .unwrap_or(false)
    }
}

/// Memoized depth-first evaluation of update requirements.
///
/// A search from an entity follows owning edges into unlocked children until
/// it meets an edited or already required entity. On success every entity on
/// the path found is required. A search that exhausts its reach without
/// success decides every entity it visited as not required, so answers never
/// depend on query order, ownership cycles included.
#[derive(Debug)]
pub struct LockPropagation<'a> {
    edited: &'a HashSet<EntityId>,
    required: HashSet<EntityId>,
    not_required: HashSet<EntityId>,
}

impl<'a> LockPropagation<'a> {
    /// Starts an evaluation over the directly edited entities.
    #[must_use]
    pub fn new(edited: &'a HashSet<EntityId>) -> Self {
        Self {
            edited,
            required: HashSet::new(),
            not_required: HashSet::new(),
        }
    }

    /// Returns true if `id` must be written.
    pub fn is_required(&mut self, graph: &impl OwnershipGraph, id: EntityId) -> bool {
        if self.required.contains(&id) || self.edited.contains(&id) {
            self.required.insert(id);
            return true;
        }
        if self.not_required.contains(&id) {
            return false;
        }

        let mut visited = HashSet::from([id]);
        let mut path = vec![(id, graph.owned(id).into_iter())];
        while let Some((_, children)) = path.last_mut() {
            let Some(child) = children.next() else {
                path.pop();
                continue;
            };
            if graph.has_lock(child) || self.not_required.contains(&child) {
                continue;
            }
            if self.required.contains(&child) || self.edited.contains(&child) {
                self.required.insert(child);
                self.required.extend(path.iter().map(|(id, _)| *id));
                return true;
            }
            if visited.insert(child) {
                path.push((child, graph.owned(child).into_iter()));
            }
        }

        self.not_required.extend(visited);
        false
    }

    /// Number of entities decided so far.
    #[must_use]
    pub fn visited(&self) -> usize {
        self.required.len() + self.not_required.len()
    }
}

/// The lock token a row gets when it is written.
///
/// Integer tokens are incremented; a null token starts at `initial`.
#[must_use]
pub fn next_lock_value(current: Option<&Value>, initial: i64) -> Value {
    match current {
        Some(Value::Integer(n)) => Value::Integer(n.wrapping_add(1)),
        _ => Value::Integer(initial),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Graph {
        owned: HashMap<EntityId, Vec<EntityId>>,
        locked: HashSet<EntityId>,
    }

    impl Graph {
        fn entity(&mut self, locked: bool, children: &[EntityId]) -> EntityId {
            let id = EntityId::new();
            self.owned.insert(id, children.to_vec());
            if locked {
                self.locked.insert(id);
            }
            id
        }
    }

    impl OwnershipGraph for Graph {
        fn owned(&self, id: EntityId) -> Vec<EntityId> {
            self.owned.get(&id).cloned().unwrap_or_default()
        }

        fn has_lock(&self, id: EntityId) -> bool {
            self.locked.contains(&id)
        }
    }

    #[test]
    fn unlocked_child_requires_owner() {
        let mut graph = Graph::default();
        let line = graph.entity(false, &[]);
        let order = graph.entity(true, &[line]);
        let edited: HashSet<_> = [line].into_iter().collect();

        let mut propagation = LockPropagation::new(&edited);
        assert!(propagation.is_required(&graph, order));
    }

    #[test]
    fn locked_child_stops_propagation() {
        let mut graph = Graph::default();
        let child = graph.entity(true, &[]);
        let owner = graph.entity(true, &[child]);
        let edited: HashSet<_> = [child].into_iter().collect();

        let mut propagation = LockPropagation::new(&edited);
        assert!(propagation.is_required(&graph, child));
        assert!(!propagation.is_required(&graph, owner));
    }

    #[test]
    fn propagates_through_unlocked_chain() {
        let mut graph = Graph::default();
        let leaf = graph.entity(false, &[]);
        let middle = graph.entity(false, &[leaf]);
        let top = graph.entity(true, &[middle]);
        let above = graph.entity(true, &[top]);
        let edited: HashSet<_> = [leaf].into_iter().collect();

        let mut propagation = LockPropagation::new(&edited);
        assert!(propagation.is_required(&graph, top));
        assert!(propagation.is_required(&graph, middle));
        assert!(!propagation.is_required(&graph, above));
    }

    #[test]
    fn cycles_terminate() {
        let mut graph = Graph::default();
        let a = EntityId::new();
        let b = EntityId::new();
        graph.owned.insert(a, vec![b]);
        graph.owned.insert(b, vec![a]);
        let edited = HashSet::new();

        let mut propagation = LockPropagation::new(&edited);
        assert!(!propagation.is_required(&graph, a));
        assert_eq!(propagation.visited(), 2);
    }

    #[test]
    fn cycle_members_reach_an_edit_in_any_query_order() {
        let mut graph = Graph::default();
        let c = graph.entity(false, &[]);
        let a = EntityId::new();
        let b = EntityId::new();
        graph.owned.insert(a, vec![b]);
        graph.owned.insert(b, vec![a, c]);
        let z = graph.entity(true, &[a]);
        let edited: HashSet<_> = [c].into_iter().collect();

        let mut propagation = LockPropagation::new(&edited);
        assert!(propagation.is_required(&graph, b));
        assert!(propagation.is_required(&graph, a));
        assert!(propagation.is_required(&graph, z));

        for order in [[z, a, b], [a, z, b], [b, z, a]] {
            let mut propagation = LockPropagation::new(&edited);
            for id in order {
                assert!(propagation.is_required(&graph, id));
            }
        }
    }

    #[test]
    fn negative_answers_hold_after_a_positive_one() {
        let mut graph = Graph::default();
        let edited_leaf = graph.entity(false, &[]);
        let quiet_leaf = graph.entity(false, &[]);
        let a = EntityId::new();
        let b = EntityId::new();
        graph.owned.insert(a, vec![b, quiet_leaf, edited_leaf]);
        graph.owned.insert(b, vec![a]);
        let edited: HashSet<_> = [edited_leaf].into_iter().collect();

        let mut propagation = LockPropagation::new(&edited);
        assert!(propagation.is_required(&graph, b));
        assert!(!propagation.is_required(&graph, quiet_leaf));
        assert!(propagation.is_required(&graph, a));
    }

    #[test]
    fn lock_tokens_advance() {
        assert_eq!(
            next_lock_value(Some(&Value::Integer(4)), 1),
            Value::Integer(5)
        );
        assert_eq!(next_lock_value(Some(&Value::Null), 1), Value::Integer(1));
        assert_eq!(next_lock_value(None, 7), Value::Integer(7));
    }
}
