//! Copying entities between contexts.

use super::{reference_target, EntityContext};
use crate::entity::{Entity, EntityId, EntityState, Node};
use crate::error::CoreResult;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

impl EntityContext {
    /// Merges entities of this context into `dest`.
    ///
    /// Each entity is matched in `dest` by identifier, then by `(type, key)`;
    /// unmatched entities are created with the same identifier. Loaded
    /// values, reference keys with their edit tracking, and collection lists
    /// are copied as they are: nothing is fetched on either side. Returns the
    /// identifier each copied entity has in `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::EntityNotInContext`] for unknown ids and
    /// [`crate::CoreError::DuplicateEntity`] if a copied key collides with a
    /// different entity in `dest`.
    pub fn copy_into(
        &self,
        dest: &mut EntityContext,
        ids: &[EntityId],
    ) -> CoreResult<HashMap<EntityId, EntityId>> {
        let mut dest = dest.internal();
        let mut mapping = HashMap::with_capacity(ids.len());

        for &id in ids {
            let source = self.get(id)?;
            let matched = if dest.contains(id) {
                Some(id)
            } else {
                match source.key() {
                    Some(key) => dest.get_by_key(source.type_name(), key)?,
                    None => None,
                }
            };
            let target = match matched {
                Some(target) => {
                    let current = dest.get(target)?.entity_type();
                    if current.name != source.type_name()
                        && source.entity_type().is_a(&current.name)
                    {
                        dest.downcast(target, source.type_name())?;
                    }
                    target
                }
                None => {
                    let fresh = Entity::new(id, Arc::clone(source.entity_type()), source.state());
                    dest.entities.insert(id, fresh);
                    id
                }
            };
            copy_values(source, &mut *dest, target)?;
            mapping.insert(id, target);
        }

        for &id in ids {
            let source = self.get(id)?;
            let target = mapping[&id];
            for (name, node) in source.nodes() {
                match node {
                    Node::Reference(reference) if reference.is_loaded() => {
                        let mapped = match (reference.target(), reference.key()) {
                            (Some(t), _) if mapping.contains_key(&t) => Some(mapping[&t]),
                            (_, Some(key)) => {
                                let target_type = reference_target(source.entity_type(), name)?;
                                Some(dest.get_or_create(&target_type, key.clone())?)
                            }
                            _ => None,
                        };
                        let key = mapped.and(reference.key().cloned());
                        dest.link(target, name, key, mapped, false)?;
                        dest.entity_mut(target)?
                            .reference_mut(name)?
                            .set_tracking(reference.is_modified(), reference.removed_key().cloned());
                    }
                    Node::Collection(collection) => {
                        let map_list = |list: &[EntityId], dest: &mut EntityContext| {
                            let mut out = Vec::with_capacity(list.len());
                            for member in list {
                                if let Some(mapped) = mapping.get(member) {
                                    out.push(*mapped);
                                } else if let Some(entity) = self.entities.get(member) {
                                    if let Some(key) = entity.key() {
                                        out.push(dest.get_or_create(entity.type_name(), key.clone())?);
                                    }
                                }
                            }
                            CoreResult::Ok(out)
                        };
                        let entities = map_list(collection.entities(), &mut *dest)?;
                        let new_entities = map_list(collection.new_entities(), &mut *dest)?;
                        let removed = map_list(collection.removed_entities(), &mut *dest)?;
                        let node = dest.entity_mut(target)?.collection_mut(name)?;
                        node.set_lists(entities, new_entities, removed);
                        node.set_fetched(collection.is_fetched());
                    }
                    _ => {}
                }
            }
        }

        trace!(copied = ids.len(), "copied entities between contexts");
        Ok(mapping)
    }
}

fn copy_values(source: &Entity, dest: &mut EntityContext, target: EntityId) -> CoreResult<()> {
    let key_node = &source.entity_type().key_node;
    for (name, node) in source.nodes() {
        let Node::Value(value) = node else {
            continue;
        };
        let Some(value) = value.get() else {
            continue;
        };
        if name == key_node {
            dest.assign_value(target, name, value.clone())?;
        } else {
            dest.entity_mut(target)?.value_mut(name)?.set(value.clone());
        }
    }

    let entity = dest.entity_mut(target)?;
    let keep_loaded =
        source.state() == EntityState::NotLoaded && entity.state() == EntityState::Loaded;
    if !keep_loaded {
        entity.set_state(source.state());
    }
    Ok(())
}
