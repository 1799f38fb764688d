//! Removing, unloading and clearing entities.

use super::{ContextEvent, EntityContext};
use crate::entity::{Entity, EntityId, EntityState, Node};
use crate::error::{CoreError, CoreResult};
use relgraph_store::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Outcome of [`EntityContext::remove`].
#[derive(Debug)]
pub enum Removal {
    /// The entity left the context; its key has been nulled.
    Removed(Entity),
    /// References from outside the removed set still point at the entity,
    /// so it was unloaded and stays addressable by key.
    Unloaded,
}

impl EntityContext {
    /// Removes an entity after its row was deleted.
    ///
    /// `removed_together` names the entities deleted in the same unit of
    /// work; references held by those do not keep the entity alive.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotInContext`] for unknown ids.
    pub fn remove(
        &mut self,
        id: EntityId,
        removed_together: &HashSet<EntityId>,
    ) -> CoreResult<Removal> {
        let entity_type = Arc::clone(self.get(id)?.entity_type());
        let referrers = self.references_to(id);
        let outside = referrers.iter().any(|r| {
            r.source != id
                && !removed_together.contains(&r.source)
                && self.entities.contains_key(&r.source)
        });
        if outside {
            debug!(%id, entity_type = %entity_type.name, "still referenced, unloading instead of removing");
            self.unload(id)?;
            return Ok(Removal::Unloaded);
        }

        self.detach_outgoing(id)?;
        for referrer in referrers {
            if let Some(source) = self.entities.get_mut(&referrer.source) {
                source.reference_mut(&referrer.node)?.assign(None, None);
            }
        }
        self.reverse.remove(&id);

        let Some(mut entity) = self.entities.remove(&id) else {
            return Err(CoreError::EntityNotInContext { id });
        };
        if let Some(key) = entity.key().cloned() {
            let index_key = (entity_type.root.clone(), key);
            if self.by_key.get(&index_key) == Some(&id) {
                self.by_key.remove(&index_key);
            }
        }
        entity.value_mut(&entity_type.key_node)?.set(Value::Null);
        self.proxies.release(id);
        self.emit(ContextEvent::Removed { id });
        Ok(Removal::Removed(entity))
    }

    /// Drops an entity's loaded data, keeping only its key.
    ///
    /// References held by the entity leave the reverse index; references
    /// pointing at it are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for new entities, which have
    /// no row to reload from.
    pub fn unload(&mut self, id: EntityId) -> CoreResult<()> {
        let entity = self.get(id)?;
        if entity.state() == EntityState::New {
            return Err(CoreError::invalid_operation(format!(
                "cannot unload unsaved {} {id}",
                entity.type_name()
            )));
        }
        let key_node = entity.entity_type().key_node.clone();

        self.detach_outgoing(id)?;
        let entity = self.entity_mut(id)?;
        for (name, node) in entity.nodes_mut() {
            match node {
                Node::Value(value) if *name != key_node => value.unload(),
                Node::Value(_) => {}
                Node::Reference(reference) => reference.unload(),
                Node::Collection(collection) => collection.unload(),
            }
        }
        entity.set_state(EntityState::NotLoaded);
        self.emit(ContextEvent::Unloaded { id });
        Ok(())
    }

    /// Removes every entity, index entry and cached handle.
    pub fn clear(&mut self) {
        debug!(entities = self.entities.len(), "clearing context");
        self.entities.clear();
        self.by_key.clear();
        self.reverse.clear();
        self.proxies.clear();
    }

    /// Takes the entity's own references out of the reverse index and out of
    /// the collections they fed.
    fn detach_outgoing(&mut self, id: EntityId) -> CoreResult<()> {
        let links: Vec<(String, EntityId)> = self
            .get(id)?
            .nodes()
            .filter_map(|(name, node)| {
                node.as_reference()
                    .and_then(|r| r.target())
                    .map(|t| (name.to_string(), t))
            })
            .collect();
        for (node, target) in links {
            self.unindex_reference(id, &node, target);
            self.refresh_inverse(id, &node, target)?;
            if let Some(owner) = self.entities.get_mut(&target) {
                for (_, owner_node) in owner.nodes_mut() {
                    if let Node::Collection(collection) = owner_node {
                        collection.forget(id);
                    }
                }
            }
        }
        Ok(())
    }
}
