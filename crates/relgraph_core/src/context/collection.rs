//! Collection operations.

use super::{collection_def, ContextEvent, EntityContext, Mode};
use crate::entity::{EntityId, EntityState};
use crate::error::{CoreError, CoreResult};
use crate::schema::NodeDef;
use relgraph_store::Value;
use std::sync::Arc;
use tracing::trace;

impl EntityContext {
    /// Current members of a collection, fetching it first if needed.
    ///
    /// # Errors
    ///
    /// Returns node lookup errors and store failures.
    pub fn collection_members(&mut self, id: EntityId, node: &str) -> CoreResult<Vec<EntityId>> {
        self.ensure_collection_fetched(id, node)?;
        self.refresh_collection(id, node)?;
        Ok(self.get(id)?.collection(node)?.members().collect())
    }

    fn ensure_collection_fetched(&mut self, id: EntityId, node: &str) -> CoreResult<()> {
        let entity = self.get(id)?;
        let fetched = entity.collection(node)?.is_fetched();
        if !fetched && self.mode == Mode::User && entity.state() != EntityState::New {
            self.fetch_collection(id, node)?;
        }
        Ok(())
    }

    /// Loads the rows whose foreign key points at the owner and marks the
    /// collection fetched.
    ///
    /// Members already loaded in the context keep their in-memory values.
    ///
    /// # Errors
    ///
    /// Returns node lookup errors and store failures.
    pub fn fetch_collection(&mut self, id: EntityId, node: &str) -> CoreResult<()> {
        let entity = self.get(id)?;
        let (member_type, foreign_node) = collection_def(entity.entity_type(), node)?;
        let owner_key = match entity.state() {
            EntityState::New => None,
            _ => entity.key().cloned(),
        };

        if let Some(owner_key) = owner_key {
            let base = Arc::clone(self.schema.entity_type(&member_type)?);
            let column = base
                .column_of(&foreign_node)
                .ok_or_else(|| CoreError::node_kind(&base.name, &foreign_node, "reference"))?
                .to_string();
            let rows = self
                .connection
                .load_by_column(&base.table, &column, &owner_key)?;
            trace!(%id, node, rows = rows.len(), "fetched collection");

            for row in rows {
                let Some(actual) = self.row_type(&base, &row)? else {
                    continue;
                };
                let Some(key) = row
                    .get(actual.key_column())
                    .cloned()
                    .and_then(Value::into_option)
                else {
                    continue;
                };
                let member = self.get_or_create(&actual.name, key)?;
                if self.get(member)?.state() == EntityState::NotLoaded {
                    self.internal().load_row(member, &row)?;
                    self.entity_mut(member)?.set_state(EntityState::Loaded);
                }
            }
        }

        self.entity_mut(id)?
            .collection_mut(node)?
            .set_fetched(true);
        self.refresh_collection(id, node)?;
        Ok(())
    }

    /// Recomputes a collection from the reverse index.
    ///
    /// Keyed members are ordered by key; unsaved members keep their order.
    /// The lists are only replaced if the member set changed, and the return
    /// value says whether it did.
    ///
    /// # Errors
    ///
    /// Returns node lookup errors.
    pub fn refresh_collection(&mut self, id: EntityId, node: &str) -> CoreResult<bool> {
        let entity = self.get(id)?;
        let (member_type, foreign_node) = collection_def(entity.entity_type(), node)?;
        let previous_new = entity.collection(node)?.new_entities().to_vec();

        let mut keyed: Vec<(Value, EntityId)> = Vec::new();
        let mut unkeyed: Vec<EntityId> = Vec::new();
        for member in self.inverse_members(id, &member_type, &foreign_node) {
            match self.get(member)?.key() {
                Some(key) => keyed.push((key.clone(), member)),
                None => unkeyed.push(member),
            }
        }
        keyed.sort();

        let mut ordered_new: Vec<EntityId> = previous_new
            .into_iter()
            .filter(|m| unkeyed.contains(m))
            .collect();
        for member in unkeyed {
            if !ordered_new.contains(&member) {
                ordered_new.push(member);
            }
        }

        let changed = self
            .entity_mut(id)?
            .collection_mut(node)?
            .replace(keyed.into_iter().map(|(_, m)| m).collect(), ordered_new);
        if changed {
            self.emit(ContextEvent::CollectionChanged {
                id,
                node: node.to_string(),
            });
        }
        Ok(changed)
    }

    /// Adds `member` to a collection by pointing its foreign node at the
    /// owner.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the member has the wrong
    /// type, and lookup errors.
    pub fn collection_add(&mut self, id: EntityId, node: &str, member: EntityId) -> CoreResult<()> {
        let (member_type, foreign_node) = collection_def(self.get(id)?.entity_type(), node)?;
        let candidate = self.get(member)?;
        if !candidate.entity_type().is_a(&member_type) {
            return Err(CoreError::invalid_operation(format!(
                "{node} holds {member_type}, got {}",
                candidate.type_name()
            )));
        }
        self.ensure_collection_fetched(id, node)?;
        self.set_reference(member, &foreign_node, Some(id))?;
        self.refresh_collection(id, node)?;
        Ok(())
    }

    /// Removes `member` from a collection by clearing its foreign node.
    ///
    /// Keyed members are remembered as removed until the next persist.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `member` is not in the
    /// collection, and lookup errors.
    pub fn collection_remove(
        &mut self,
        id: EntityId,
        node: &str,
        member: EntityId,
    ) -> CoreResult<()> {
        let (_, foreign_node) = collection_def(self.get(id)?.entity_type(), node)?;
        self.ensure_collection_fetched(id, node)?;
        self.refresh_collection(id, node)?;
        if !self.get(id)?.collection(node)?.contains(member) {
            return Err(CoreError::invalid_operation(format!(
                "{member} is not a member of {node}"
            )));
        }
        let keyed = self.get(member)?.key().is_some();
        self.set_reference(member, &foreign_node, None)?;
        if keyed {
            self.entity_mut(id)?
                .collection_mut(node)?
                .mark_removed(member);
        }
        self.refresh_collection(id, node)?;
        Ok(())
    }

    /// Drops a collection's loaded members; the next read fetches again.
    ///
    /// # Errors
    ///
    /// Returns node lookup errors.
    pub fn unload_collection(&mut self, id: EntityId, node: &str) -> CoreResult<()> {
        self.entity_mut(id)?.collection_mut(node)?.unload();
        self.emit(ContextEvent::CollectionChanged {
            id,
            node: node.to_string(),
        });
        Ok(())
    }

    /// Refreshes the fetched collections of `target` that are fed by
    /// `source`'s reference node.
    pub(crate) fn refresh_inverse(
        &mut self,
        source: EntityId,
        node: &str,
        target: EntityId,
    ) -> CoreResult<()> {
        let (Some(source), Some(owner)) = (self.entities.get(&source), self.entities.get(&target))
        else {
            return Ok(());
        };
        let source_type = source.entity_type();
        let names: Vec<String> = owner
            .entity_type()
            .collections()
            .filter(|(_, def)| {
                matches!(def, NodeDef::Collection { target, foreign_node, .. }
                    if foreign_node == node && source_type.is_a(target))
            })
            .filter(|(name, _)| {
                owner
                    .node(name)
                    .and_then(|n| n.as_collection())
                    .is_some_and(|c| c.is_fetched())
            })
            .map(|(name, _)| name.to_string())
            .collect();
        for name in names {
            self.refresh_collection(target, &name)?;
        }
        Ok(())
    }

    /// Refreshes every fetched collection `id` is a member of.
    pub(crate) fn refresh_owner_collections(&mut self, id: EntityId) -> CoreResult<()> {
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
            self.refresh_inverse(id, &node, target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::context::ContextEvent;
    use crate::error::CoreError;
    use crate::test_support::{context, context_with_store};
    use relgraph_store::{Row, Value};

    #[test]
    fn members_follow_references() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let line = ctx.new_model("OrderLine").unwrap().id();

        ctx.set_reference(line, "order", Some(order)).unwrap();
        assert_eq!(ctx.collection_members(order, "lines").unwrap(), vec![line]);

        ctx.set_reference(line, "order", None).unwrap();
        assert!(ctx.collection_members(order, "lines").unwrap().is_empty());
    }

    #[test]
    fn refresh_is_idempotent() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let line = ctx.new_model("OrderLine").unwrap().id();
        ctx.collection_add(order, "lines", line).unwrap();

        assert!(!ctx.refresh_collection(order, "lines").unwrap());
        assert!(!ctx.refresh_collection(order, "lines").unwrap());
    }

    #[test]
    fn keyed_members_sorted_and_new_members_kept() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let late = ctx.get_or_create("OrderLine", Value::Integer(9)).unwrap();
        let early = ctx.get_or_create("OrderLine", Value::Integer(2)).unwrap();
        let fresh_a = ctx.new_model("OrderLine").unwrap().id();
        let fresh_b = ctx.new_model("OrderLine").unwrap().id();

        let mut internal = ctx.internal();
        for line in [fresh_a, late, fresh_b, early] {
            internal.collection_add(order, "lines", line).unwrap();
        }
        drop(internal);

        let collection = ctx.get(order).unwrap().collection("lines").unwrap();
        assert_eq!(collection.entities(), &[early, late]);
        assert_eq!(collection.new_entities(), &[fresh_a, fresh_b]);
    }

    #[test]
    fn remove_tracks_keyed_members() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let keyed = ctx.get_or_create("OrderLine", Value::Integer(1)).unwrap();
        let fresh = ctx.new_model("OrderLine").unwrap().id();
        ctx.internal().collection_add(order, "lines", keyed).unwrap();
        ctx.collection_add(order, "lines", fresh).unwrap();

        ctx.collection_remove(order, "lines", keyed).unwrap();
        ctx.collection_remove(order, "lines", fresh).unwrap();

        let collection = ctx.get(order).unwrap().collection("lines").unwrap();
        assert_eq!(collection.removed_entities(), &[keyed]);
        assert_eq!(collection.members().count(), 0);
        assert!(matches!(
            ctx.collection_remove(order, "lines", keyed),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn fetch_loads_members_from_store() {
        let (store, mut ctx) = context_with_store();
        for (id, product) in [(2, "nut"), (1, "bolt")] {
            store
                .seed(
                    "order_lines",
                    Row::new()
                        .with("id", id)
                        .with("product", product)
                        .with("quantity", 1)
                        .with("order_id", 10),
                )
                .unwrap();
        }
        let order = ctx.get_or_create("Order", Value::Integer(10)).unwrap();

        let members = ctx.collection_members(order, "lines").unwrap();

        let keys: Vec<_> = members
            .iter()
            .map(|m| ctx.key_of(*m).unwrap().unwrap())
            .collect();
        assert_eq!(keys, vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(ctx.get_value(members[0], "product").unwrap(), Value::from("bolt"));
    }

    #[test]
    fn unload_collection_refetches() {
        let (store, mut ctx) = context_with_store();
        let order = ctx.get_or_create("Order", Value::Integer(10)).unwrap();
        assert!(ctx.collection_members(order, "lines").unwrap().is_empty());

        store
            .seed(
                "order_lines",
                Row::new().with("id", 5).with("product", "gear").with("order_id", 10),
            )
            .unwrap();
        assert!(ctx.collection_members(order, "lines").unwrap().is_empty());

        ctx.unload_collection(order, "lines").unwrap();
        assert_eq!(ctx.collection_members(order, "lines").unwrap().len(), 1);
    }

    #[test]
    fn change_emits_collection_event() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let line = ctx.new_model("OrderLine").unwrap().id();
        let events = ctx.subscribe();

        ctx.collection_add(order, "lines", line).unwrap();

        let received: Vec<_> = events.try_iter().collect();
        assert!(received.contains(&ContextEvent::CollectionChanged {
            id: order,
            node: "lines".into()
        }));
    }
}
