//! Typed slots inside an entity.

use super::EntityId;
use crate::schema::NodeDef;
use relgraph_store::Value;
use std::collections::HashSet;

/// Load state of a scalar slot.
///
/// `NotLoaded` is distinct from a loaded `Null`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Slot {
    /// Not read from the database yet.
    #[default]
    NotLoaded,
    /// Loaded or assigned.
    Loaded(Value),
}

/// A scalar node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueNode {
    slot: Slot,
}

impl ValueNode {
    /// A node that has not been loaded.
    #[must_use]
    pub fn not_loaded() -> Self {
        Self::default()
    }

    /// A node holding `value`.
    #[must_use]
    pub fn loaded(value: Value) -> Self {
        Self {
            slot: Slot::Loaded(value),
        }
    }

    /// The value, or `None` when not loaded.
    #[must_use]
    pub fn get(&self) -> Option<&Value> {
        match &self.slot {
            Slot::Loaded(value) => Some(value),
            Slot::NotLoaded => None,
        }
    }

    /// Returns true if the slot holds a value.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self.slot, Slot::Loaded(_))
    }

    /// The raw slot.
    #[must_use]
    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    pub(crate) fn set(&mut self, value: Value) {
        self.slot = Slot::Loaded(value);
    }

    pub(crate) fn set_slot(&mut self, slot: Slot) {
        self.slot = slot;
    }

    pub(crate) fn unload(&mut self) {
        self.slot = Slot::NotLoaded;
    }
}

/// A foreign-key node resolved to an entity of the same context.
///
/// While the user edits the reference, the key it held when editing began
/// is kept as the *removed key*. Restoring that key clears the tracking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferenceNode {
    loaded: bool,
    key: Option<Value>,
    target: Option<EntityId>,
    modified: bool,
    removed_key: Option<Value>,
}

impl ReferenceNode {
    /// A reference whose foreign key has not been loaded.
    #[must_use]
    pub fn not_loaded() -> Self {
        Self::default()
    }

    /// A loaded reference.
    #[must_use]
    pub fn loaded(key: Option<Value>, target: Option<EntityId>) -> Self {
        Self {
            loaded: true,
            key,
            target,
            modified: false,
            removed_key: None,
        }
    }

    /// Returns true if the foreign key is known.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Foreign-key value; `None` is a null key.
    #[must_use]
    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// The resolved target.
    ///
    /// Set whenever `key` is set, and also for unsaved targets that have no
    /// key yet.
    #[must_use]
    pub fn target(&self) -> Option<EntityId> {
        self.target
    }

    /// The key held before the user started editing, if it was not null.
    #[must_use]
    pub fn removed_key(&self) -> Option<&Value> {
        self.removed_key.as_ref()
    }

    /// Returns true while a user edit is outstanding.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Value written to the foreign-key column.
    #[must_use]
    pub fn column_value(&self) -> Value {
        self.key.clone().unwrap_or(Value::Null)
    }

    /// Assigns without touching edit tracking.
    pub(crate) fn assign(&mut self, key: Option<Value>, target: Option<EntityId>) {
        self.loaded = true;
        self.key = key;
        self.target = target;
    }

    /// Assigns as a user edit.
    pub(crate) fn assign_tracked(&mut self, key: Option<Value>, target: Option<EntityId>) {
        if !self.modified {
            self.modified = true;
            self.removed_key = self.key.clone();
        } else if key == self.removed_key && (key.is_some() || target.is_none()) {
            self.modified = false;
            self.removed_key = None;
        }
        self.assign(key, target);
    }

    pub(crate) fn set_tracking(&mut self, modified: bool, removed_key: Option<Value>) {
        self.modified = modified;
        self.removed_key = if modified { removed_key } else { None };
    }

    pub(crate) fn clear_tracking(&mut self) {
        self.set_tracking(false, None);
    }

    pub(crate) fn unload(&mut self) {
        *self = Self::not_loaded();
    }
}

/// The members of a one-to-many relationship.
///
/// `entities` holds keyed members in key order, `new_entities` unsaved
/// members in insertion order, `removed_entities` keyed members taken out
/// of the collection since the last persist.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionNode {
    entities: Vec<EntityId>,
    new_entities: Vec<EntityId>,
    removed_entities: Vec<EntityId>,
    fetched: bool,
}

impl CollectionNode {
    /// A collection that has not been fetched.
    #[must_use]
    pub fn not_fetched() -> Self {
        Self::default()
    }

    /// An empty collection that needs no fetch.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            fetched: true,
            ..Self::default()
        }
    }

    /// Keyed members in key order.
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Unsaved members in insertion order.
    #[must_use]
    pub fn new_entities(&self) -> &[EntityId] {
        &self.new_entities
    }

    /// Keyed members removed since the last persist.
    #[must_use]
    pub fn removed_entities(&self) -> &[EntityId] {
        &self.removed_entities
    }

    /// All current members: keyed first, then unsaved.
    pub fn members(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.iter().chain(&self.new_entities).copied()
    }

    /// Returns true if `id` is a current member.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains(&id) || self.new_entities.contains(&id)
    }

    /// Returns true once members have been loaded.
    #[must_use]
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    /// Replaces the member lists if the member sets differ.
    ///
    /// Returns true if anything changed.
    pub(crate) fn replace(&mut self, keyed: Vec<EntityId>, unkeyed: Vec<EntityId>) -> bool {
        let same = |a: &[EntityId], b: &[EntityId]| {
            a.len() == b.len() && a.iter().collect::<HashSet<_>>() == b.iter().collect()
        };
        if same(&self.entities, &keyed) && same(&self.new_entities, &unkeyed) {
            return false;
        }
        self.removed_entities
            .retain(|id| !keyed.contains(id) && !unkeyed.contains(id));
        self.entities = keyed;
        self.new_entities = unkeyed;
        true
    }

    pub(crate) fn mark_removed(&mut self, id: EntityId) {
        if !self.removed_entities.contains(&id) {
            self.removed_entities.push(id);
        }
    }

    pub(crate) fn forget(&mut self, id: EntityId) {
        self.entities.retain(|e| *e != id);
        self.new_entities.retain(|e| *e != id);
        self.removed_entities.retain(|e| *e != id);
    }

    pub(crate) fn clear_removed(&mut self) {
        self.removed_entities.clear();
    }

    pub(crate) fn set_fetched(&mut self, fetched: bool) {
        self.fetched = fetched;
    }

    pub(crate) fn set_lists(
        &mut self,
        entities: Vec<EntityId>,
        new_entities: Vec<EntityId>,
        removed_entities: Vec<EntityId>,
    ) {
        self.entities = entities;
        self.new_entities = new_entities;
        self.removed_entities = removed_entities;
    }

    pub(crate) fn unload(&mut self) {
        self.entities.clear();
        self.fetched = false;
    }
}

/// A node of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Scalar.
    Value(ValueNode),
    /// Foreign key.
    Reference(ReferenceNode),
    /// One-to-many members.
    Collection(CollectionNode),
}

impl Node {
    /// Builds the initial node for `def`.
    ///
    /// Nodes of new entities start loaded and empty; nodes of entities that
    /// exist in the database start not loaded.
    #[must_use]
    pub fn for_def(def: &NodeDef, new: bool) -> Self {
        match (def, new) {
            (NodeDef::Attribute { .. }, true) => Self::Value(ValueNode::loaded(Value::Null)),
            (NodeDef::Attribute { .. }, false) => Self::Value(ValueNode::not_loaded()),
            (NodeDef::Reference { .. }, true) => Self::Reference(ReferenceNode::loaded(None, None)),
            (NodeDef::Reference { .. }, false) => Self::Reference(ReferenceNode::not_loaded()),
            (NodeDef::Collection { .. }, true) => Self::Collection(CollectionNode::empty()),
            (NodeDef::Collection { .. }, false) => Self::Collection(CollectionNode::not_fetched()),
        }
    }

    /// Returns the value node, if this is one.
    #[must_use]
    pub fn as_value(&self) -> Option<&ValueNode> {
        match self {
            Self::Value(node) => Some(node),
            _ => None,
        }
    }

    /// Returns the reference node, if this is one.
    #[must_use]
    pub fn as_reference(&self) -> Option<&ReferenceNode> {
        match self {
            Self::Reference(node) => Some(node),
            _ => None,
        }
    }

    /// Returns the collection node, if this is one.
    #[must_use]
    pub fn as_collection(&self) -> Option<&CollectionNode> {
        match self {
            Self::Collection(node) => Some(node),
            _ => None,
        }
    }

    pub(crate) fn as_value_mut(&mut self) -> Option<&mut ValueNode> {
        match self {
            Self::Value(node) => Some(node),
            _ => None,
        }
    }

    pub(crate) fn as_reference_mut(&mut self) -> Option<&mut ReferenceNode> {
        match self {
            Self::Reference(node) => Some(node),
            _ => None,
        }
    }

    pub(crate) fn as_collection_mut(&mut self) -> Option<&mut CollectionNode> {
        match self {
            Self::Collection(node) => Some(node),
            _ => None,
        }
    }

    /// The value persisted for this node, if it is loaded and persistent.
    #[must_use]
    pub fn persistent_value(&self) -> Option<Value> {
        match self {
            Self::Value(node) => node.get().cloned(),
            Self::Reference(node) if node.is_loaded() => Some(node.column_value()),
            Self::Reference(_) | Self::Collection(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_loaded_is_not_null() {
        let node = ValueNode::not_loaded();
        assert_eq!(node.get(), None);
        let node = ValueNode::loaded(Value::Null);
        assert_eq!(node.get(), Some(&Value::Null));
    }

    #[test]
    fn reference_tracks_original_key() {
        let a = EntityId::new();
        let b = EntityId::new();
        let mut node = ReferenceNode::loaded(Some(Value::Integer(1)), Some(a));

        node.assign_tracked(Some(Value::Integer(2)), Some(b));
        assert!(node.is_modified());
        assert_eq!(node.removed_key(), Some(&Value::Integer(1)));

        node.assign_tracked(None, None);
        assert_eq!(node.removed_key(), Some(&Value::Integer(1)));

        node.assign_tracked(Some(Value::Integer(1)), Some(a));
        assert!(!node.is_modified());
        assert_eq!(node.removed_key(), None);
    }

    #[test]
    fn restoring_null_clears_modification() {
        let mut node = ReferenceNode::loaded(None, None);
        node.assign_tracked(None, Some(EntityId::new()));
        assert!(node.is_modified());
        assert_eq!(node.removed_key(), None);

        node.assign_tracked(None, None);
        assert!(!node.is_modified());
    }

    #[test]
    fn internal_assign_keeps_tracking() {
        let mut node = ReferenceNode::loaded(Some(Value::Integer(1)), None);
        node.assign_tracked(Some(Value::Integer(2)), None);
        node.assign(Some(Value::Integer(3)), None);
        assert!(node.is_modified());
        assert_eq!(node.removed_key(), Some(&Value::Integer(1)));
    }

    #[test]
    fn collection_replace_detects_changes() {
        let a = EntityId::new();
        let b = EntityId::new();
        let mut node = CollectionNode::empty();

        assert!(node.replace(vec![a, b], vec![]));
        assert!(!node.replace(vec![b, a], vec![]));
        assert_eq!(node.entities(), &[a, b]);

        node.mark_removed(a);
        assert!(node.replace(vec![b], vec![]));
        assert_eq!(node.removed_entities(), &[a]);

        assert!(node.replace(vec![a, b], vec![]));
        assert!(node.removed_entities().is_empty());
    }

    #[test]
    fn nodes_for_new_entities_are_loaded() {
        let def = NodeDef::Collection {
            target: "OrderLine".into(),
            foreign_node: "order".into(),
            owning: true,
        };
        let node = Node::for_def(&def, true);
        assert!(node.as_collection().unwrap().is_fetched());
        let node = Node::for_def(&def, false);
        assert!(!node.as_collection().unwrap().is_fetched());
    }
}
