//! Ordered entity batches and their reordering for batching.

use crate::context::EntityContext;
use crate::entity::EntityId;
use std::collections::{HashMap, HashSet};

/// Type and foreign-key dependency information the reordering needs.
pub trait DependencyGraph {
    /// Type name of an entity.
    fn type_of(&self, id: EntityId) -> Option<&str>;

    /// Entities `id` holds a foreign key to.
    fn dependencies(&self, id: EntityId) -> Vec<EntityId>;
}

impl DependencyGraph for EntityContext {
    fn type_of(&self, id: EntityId) -> Option<&str> {
        self.get(id).ok().map(|e| e.type_name())
    }

    fn dependencies(&self, id: EntityId) -> Vec<EntityId> {
        self.get(id)
            .map(|entity| {
                entity
                    .nodes()
                    .filter_map(|(_, node)| node.as_reference().and_then(|r| r.target()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// An ordered, duplicate-free list of entities for one persist phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationGroup {
    entities: Vec<EntityId>,
    members: HashSet<EntityId>,
}

impl OperationGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entity unless it is already present.
    ///
    /// Returns true if it was added.
    pub fn push(&mut self, id: EntityId) -> bool {
        if self.members.insert(id) {
            self.entities.push(id);
            true
        } else {
            false
        }
    }

    /// Removes an entity.
    pub fn remove(&mut self, id: EntityId) -> bool {
        if self.members.remove(&id) {
            self.entities.retain(|e| *e != id);
            true
        } else {
            false
        }
    }

    /// Returns true if the entity is in the group.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if the group is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities in order.
    pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.iter().copied()
    }

    /// Entities in order, as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[EntityId] {
        &self.entities
    }

    /// The same entities in reverse order.
    #[must_use]
    pub fn reversed(&self) -> Self {
        self.entities.iter().rev().copied().collect()
    }

    /// Appends the entities of `others` not already present, in order.
    pub fn merge<'a>(&mut self, others: impl IntoIterator<Item = &'a OperationGroup>) {
        for other in others {
            for id in other.iter() {
                self.push(id);
            }
        }
    }

    /// Reorders for insert batching.
    ///
    /// Each entity moves up to sit right after the nearest earlier entity of
    /// the same type, unless one of the entities it would jump over is
    /// something it transitively depends on. A forced pass ignores
    /// dependencies.
    #[must_use]
    pub fn optimized_for_insert(&self, graph: &impl DependencyGraph, force: bool) -> Self {
        let mut ordered: Vec<EntityId> = Vec::with_capacity(self.entities.len());
        let mut closures = DependencyClosures::new(graph);
        for &id in &self.entities {
            let ty = graph.type_of(id);
            let anchor = ordered
                .iter()
                .rposition(|other| graph.type_of(*other) == ty);
            match anchor {
                Some(pos) if pos + 1 < ordered.len() => {
                    let blocked = !force && {
                        let deps = closures.of(id);
                        ordered[pos + 1..].iter().any(|other| deps.contains(other))
                    };
                    if blocked {
                        ordered.push(id);
                    } else {
                        ordered.insert(pos + 1, id);
                    }
                }
                _ => ordered.push(id),
            }
        }
        ordered.into_iter().collect()
    }

    /// Reorders for update batching; updates carry no ordering constraints.
    #[must_use]
    pub fn optimized_for_update(&self, graph: &impl DependencyGraph) -> Self {
        self.optimized_for_insert(graph, true)
    }

    /// Reorders for delete batching, keeping dependents ahead of what they
    /// depend on.
    #[must_use]
    pub fn optimized_for_delete(&self, graph: &impl DependencyGraph) -> Self {
        self.reversed()
            .optimized_for_insert(graph, false)
            .reversed()
    }

    /// Number of maximal same-type runs.
    #[must_use]
    pub fn runs(&self, graph: &impl DependencyGraph) -> usize {
        let mut runs = 0;
        let mut previous = None;
        for &id in &self.entities {
            let ty = graph.type_of(id);
            if runs == 0 || ty != previous {
                runs += 1;
            }
            previous = ty;
        }
        runs
    }
}

impl FromIterator<EntityId> for OperationGroup {
    fn from_iter<I: IntoIterator<Item = EntityId>>(iter: I) -> Self {
        let mut group = Self::new();
        for id in iter {
            group.push(id);
        }
        group
    }
}

/// Transitive dependencies, memoized for one reordering pass.
///
/// A search that reaches an entity whose closure is already known takes that
/// closure whole instead of walking past it.
struct DependencyClosures<'g, G> {
    graph: &'g G,
    known: HashMap<EntityId, HashSet<EntityId>>,
}

impl<'g, G: DependencyGraph> DependencyClosures<'g, G> {
    fn new(graph: &'g G) -> Self {
        Self {
            graph,
            known: HashMap::new(),
        }
    }

    /// Everything `id` depends on, directly or not, excluding `id`.
    fn of(&mut self, id: EntityId) -> &HashSet<EntityId> {
        if !self.known.contains_key(&id) {
            let mut seen = HashSet::new();
            let mut stack = self.graph.dependencies(id);
            while let Some(next) = stack.pop() {
                if next == id || !seen.insert(next) {
                    continue;
                }
                match self.known.get(&next) {
                    Some(closure) => seen.extend(closure.iter().copied()),
                    None => stack.extend(self.graph.dependencies(next)),
                }
            }
            seen.remove(&id);
            self.known.insert(id, seen);
        }
        &self.known[&id]
    }
}

/// The four groups an analyser produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationGroups {
    /// Entities to insert, dependencies first.
    pub create: OperationGroup,
    /// Entities whose rows may need updating.
    pub update: OperationGroup,
    /// Entities to delete, dependents first.
    pub delete: OperationGroup,
    /// Entities that must exist and keep their lock for the persist to be
    /// valid, without being written unless lock propagation requires it.
    pub depends_on: OperationGroup,
}

impl OperationGroups {
    /// Returns true if no group has entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.update.is_empty()
            && self.delete.is_empty()
            && self.depends_on.is_empty()
    }

    /// Update, delete and depends-on entities: everything that must already
    /// exist in the database.
    #[must_use]
    pub fn existing(&self) -> OperationGroup {
        let mut all = self.update.clone();
        all.merge([&self.delete, &self.depends_on]);
        all
    }
}
