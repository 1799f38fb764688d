//! Entities and their nodes.

mod id;
mod node;

pub use id::EntityId;
pub use node::{CollectionNode, Node, ReferenceNode, Slot, ValueNode};

use crate::error::{CoreError, CoreResult};
use crate::schema::{EntityType, NodeDef};
use relgraph_store::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Created in memory, not yet persisted.
    New,
    /// A fetch is in progress.
    Loading,
    /// Values reflect a database row.
    Loaded,
    /// Only the key is known.
    NotLoaded,
}

/// A typed bag of nodes with identity and lifecycle state.
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    entity_type: Arc<EntityType>,
    state: EntityState,
    nodes: BTreeMap<String, Node>,
}

impl Entity {
    /// Creates an entity with one node per definition of its type.
    #[must_use]
    pub fn new(id: EntityId, entity_type: Arc<EntityType>, state: EntityState) -> Self {
        let fresh = state == EntityState::New;
        let nodes = entity_type
            .nodes
            .iter()
            .map(|(name, def)| (name.clone(), Node::for_def(def, fresh)))
            .collect();
        Self {
            id,
            entity_type,
            state,
            nodes,
        }
    }

    /// Creates a not-loaded placeholder that only knows its key.
    #[must_use]
    pub fn placeholder(id: EntityId, entity_type: Arc<EntityType>, key: Value) -> Self {
        let key_node = entity_type.key_node.clone();
        let mut entity = Self::new(id, entity_type, EntityState::NotLoaded);
        if let Some(node) = entity.nodes.get_mut(&key_node).and_then(Node::as_value_mut) {
            node.set(key);
        }
        entity
    }

    /// Process-local identity.
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The entity's type.
    #[must_use]
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    /// Type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.entity_type.name
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Primary key, if assigned.
    #[must_use]
    pub fn key(&self) -> Option<&Value> {
        self.value(&self.entity_type.key_node)
            .filter(|v| !v.is_null())
    }

    /// Lock token, if the type is locked and the value loaded.
    #[must_use]
    pub fn lock_value(&self) -> Option<&Value> {
        self.entity_type
            .lock_node
            .as_deref()
            .and_then(|n| self.value(n))
    }

    /// Loaded value of a value node.
    #[must_use]
    pub fn value(&self, node: &str) -> Option<&Value> {
        self.nodes
            .get(node)
            .and_then(Node::as_value)
            .and_then(ValueNode::get)
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Looks up a value node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownNode`] or [`CoreError::NodeKind`].
    pub fn value_node(&self, name: &str) -> CoreResult<&ValueNode> {
        self.node_checked(name)?
            .as_value()
            .ok_or_else(|| CoreError::node_kind(self.type_name(), name, "value"))
    }

    /// Looks up a reference node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownNode`] or [`CoreError::NodeKind`].
    pub fn reference(&self, name: &str) -> CoreResult<&ReferenceNode> {
        self.node_checked(name)?
            .as_reference()
            .ok_or_else(|| CoreError::node_kind(self.type_name(), name, "reference"))
    }

    /// Looks up a collection node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownNode`] or [`CoreError::NodeKind`].
    pub fn collection(&self, name: &str) -> CoreResult<&CollectionNode> {
        self.node_checked(name)?
            .as_collection()
            .ok_or_else(|| CoreError::node_kind(self.type_name(), name, "collection"))
    }

    /// Captures the persistent values that are loaded.
    #[must_use]
    pub fn snapshot(&self) -> EntitySnapshot {
        let values = self
            .nodes
            .iter()
            .filter_map(|(name, node)| node.persistent_value().map(|v| (name.clone(), v)))
            .collect();
        EntitySnapshot {
            entity_type: self.entity_type.name.clone(),
            key: self.key().cloned().unwrap_or(Value::Null),
            values,
        }
    }

    fn node_checked(&self, name: &str) -> CoreResult<&Node> {
        self.nodes
            .get(name)
            .ok_or_else(|| CoreError::unknown_node(self.type_name(), name))
    }

    pub(crate) fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    pub(crate) fn node_mut(&mut self, name: &str) -> CoreResult<&mut Node> {
        let type_name = &self.entity_type.name;
        self.nodes
            .get_mut(name)
            .ok_or_else(|| CoreError::unknown_node(type_name, name))
    }

    pub(crate) fn value_mut(&mut self, name: &str) -> CoreResult<&mut ValueNode> {
        let type_name = self.entity_type.name.clone();
        self.node_mut(name)?
            .as_value_mut()
            .ok_or_else(|| CoreError::node_kind(type_name, name, "value"))
    }

    pub(crate) fn reference_mut(&mut self, name: &str) -> CoreResult<&mut ReferenceNode> {
        let type_name = self.entity_type.name.clone();
        self.node_mut(name)?
            .as_reference_mut()
            .ok_or_else(|| CoreError::node_kind(type_name, name, "reference"))
    }

    pub(crate) fn collection_mut(&mut self, name: &str) -> CoreResult<&mut CollectionNode> {
        let type_name = self.entity_type.name.clone();
        self.node_mut(name)?
            .as_collection_mut()
            .ok_or_else(|| CoreError::node_kind(type_name, name, "collection"))
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = (&String, &mut Node)> {
        self.nodes.iter_mut()
    }

    /// Switches to a subtype, returning the value nodes that became
    /// references together with the value they held.
    pub(crate) fn retype(&mut self, subtype: Arc<EntityType>) -> Vec<(String, Option<Value>)> {
        let fresh = self.state == EntityState::New;
        let mut converted = Vec::new();
        for (name, def) in &subtype.nodes {
            match (self.nodes.get(name), def) {
                (Some(Node::Value(value)), NodeDef::Reference { .. }) => {
                    converted.push((name.clone(), value.get().cloned()));
                    self.nodes.insert(
                        name.clone(),
                        Node::Reference(ReferenceNode::not_loaded()),
                    );
                }
                (Some(_), _) => {}
                (None, def) => {
                    self.nodes.insert(name.clone(), Node::for_def(def, fresh));
                }
            }
        }
        self.entity_type = subtype;
        converted
    }
}

/// Persistent values of an entity or a database row, by node name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity type name.
    pub entity_type: String,
    /// Primary key.
    pub key: Value,
    /// Values by node name; reference nodes hold their foreign key.
    pub values: BTreeMap<String, Value>,
}

impl EntitySnapshot {
    /// Builds a snapshot from a row of `entity_type`'s table.
    #[must_use]
    pub fn from_row(entity_type: &EntityType, row: &Row) -> Self {
        let values = entity_type
            .persistent_nodes()
            .map(|(node, column)| {
                (
                    node.to_string(),
                    row.get(column).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();
        Self {
            entity_type: entity_type.name.clone(),
            key: row
                .get(entity_type.key_column())
                .cloned()
                .unwrap_or(Value::Null),
            values,
        }
    }

    /// Value of a node.
    #[must_use]
    pub fn value(&self, node: &str) -> Option<&Value> {
        self.values.get(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityTypeDef, Schema};

    fn order_type() -> Arc<EntityType> {
        let schema = Schema::builder()
            .entity(EntityTypeDef::new("Customer", "customers"))
            .entity(
                EntityTypeDef::new("Order", "orders")
                    .lock("version")
                    .attribute("number")
                    .reference("customer", "Customer"),
            )
            .build()
            .unwrap();
        schema.entity_type("Order").unwrap().clone()
    }

    #[test]
    fn new_entities_start_loaded_and_unkeyed() {
        let entity = Entity::new(EntityId::new(), order_type(), EntityState::New);
        assert_eq!(entity.key(), None);
        assert_eq!(entity.value("number"), Some(&Value::Null));
        assert!(entity.reference("customer").unwrap().is_loaded());
    }

    #[test]
    fn placeholder_knows_only_its_key() {
        let entity = Entity::placeholder(EntityId::new(), order_type(), Value::Integer(4));
        assert_eq!(entity.state(), EntityState::NotLoaded);
        assert_eq!(entity.key(), Some(&Value::Integer(4)));
        assert_eq!(entity.value("number"), None);
        assert_eq!(entity.lock_value(), None);
    }

    #[test]
    fn snapshot_from_row_uses_node_names() {
        let ty = order_type();
        let row = Row::new()
            .with("id", 3)
            .with("number", "A-3")
            .with("version", 2)
            .with("customer_id", 9);
        let snapshot = EntitySnapshot::from_row(&ty, &row);
        assert_eq!(snapshot.key, Value::Integer(3));
        assert_eq!(snapshot.value("customer"), Some(&Value::Integer(9)));
        assert_eq!(snapshot.value("version"), Some(&Value::Integer(2)));
    }

    #[test]
    fn node_kind_errors() {
        let entity = Entity::new(EntityId::new(), order_type(), EntityState::New);
        assert!(matches!(
            entity.reference("number"),
            Err(CoreError::NodeKind { .. })
        ));
        assert!(matches!(
            entity.collection("missing"),
            Err(CoreError::UnknownNode { .. })
        ));
    }
}
