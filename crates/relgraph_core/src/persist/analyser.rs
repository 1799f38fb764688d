//! Classifying a persist request into operation groups.

use super::group::{DependencyGraph, OperationGroup, OperationGroups};
use super::PersistRequest;
use crate::context::EntityContext;
use crate::entity::{EntityId, EntityState};
use crate::error::{CoreError, CoreResult};
use crate::schema::NodeDef;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Turns a persist request into the entities to create, update, delete and
/// depend on.
pub trait PersistAnalyser: Send + Sync {
    /// Classifies the graph reachable from `request`.
    ///
    /// The analyser may fetch through `context` to discover owned entities.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalPersistState`] for requests that cannot be
    /// persisted and [`CoreError::EntityNotInContext`] for unknown entities.
    fn analyse(
        &self,
        context: &mut EntityContext,
        request: &PersistRequest,
    ) -> CoreResult<OperationGroups>;
}

/// Walks ownership and references from the requested entities.
///
/// Saved entities and everything they own are created when new and updated
/// otherwise. Non-owning references to new entities are created as well;
/// existing targets become depends-on. Deleted entities take what they own
/// with them, as do entities detached from an owning node. Unlocked saved or
/// deleted entities pull their owners into depends-on up to the first locked
/// one.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphAnalyser;

/// A pending step of the walk over owned entities.
#[derive(Debug, Clone, Copy)]
enum Visit {
    Save(EntityId),
    Delete(EntityId),
}

#[derive(Default)]
struct Walk {
    create: Vec<EntityId>,
    update: Vec<EntityId>,
    depends_on: Vec<EntityId>,
    delete: Vec<EntityId>,
    saved: HashSet<EntityId>,
    deleted: HashSet<EntityId>,
}

impl PersistAnalyser for GraphAnalyser {
    fn analyse(
        &self,
        context: &mut EntityContext,
        request: &PersistRequest,
    ) -> CoreResult<OperationGroups> {
        if request.is_empty() {
            return Err(CoreError::illegal_persist_state("nothing to persist"));
        }
        for &id in request.save.iter().chain(&request.delete) {
            context.get(id)?;
        }

        let mut walk = Walk::default();
        for &id in &request.delete {
            walk.collect(context, Visit::Delete(id))?;
        }
        for &id in &request.save {
            walk.collect(context, Visit::Save(id))?;
        }
        let touched: Vec<EntityId> = walk
            .create
            .iter()
            .chain(&walk.update)
            .chain(&walk.delete)
            .copied()
            .collect();
        for id in touched {
            walk.collect_owners(context, id);
        }

        let groups = walk.into_groups(context)?;
        debug!(
            create = groups.create.len(),
            update = groups.update.len(),
            delete = groups.delete.len(),
            depends_on = groups.depends_on.len(),
            "persist request analysed"
        );
        Ok(groups)
    }
}

impl Walk {
    /// Visits `start` and everything it reaches, in depth-first order.
    fn collect(&mut self, context: &mut EntityContext, start: Visit) -> CoreResult<()> {
        let mut stack = vec![start];
        while let Some(visit) = stack.pop() {
            let mut next = match visit {
                Visit::Save(id) => self.visit_save(context, id)?,
                Visit::Delete(id) => self.visit_delete(context, id)?,
            };
            next.reverse();
            stack.extend(next);
        }
        Ok(())
    }

    fn visit_save(&mut self, context: &mut EntityContext, id: EntityId) -> CoreResult<Vec<Visit>> {
        let mut next = Vec::new();
        if !self.saved.insert(id) {
            return Ok(next);
        }
        let entity = context.get(id)?;
        if entity.state() == EntityState::New {
            self.create.push(id);
        } else {
            self.update.push(id);
        }

        let entity_type = Arc::clone(entity.entity_type());
        for (name, def) in &entity_type.nodes {
            match def {
                NodeDef::Reference { owning, target, .. } => {
                    let entity = context.get(id)?;
                    let reference = entity.reference(name)?;
                    if !reference.is_loaded() {
                        continue;
                    }
                    let current = reference.target();
                    let detached = match (owning, reference.removed_key()) {
                        (true, Some(key)) => context
                            .get_by_key(target, key)?
                            .filter(|old| Some(*old) != current),
                        _ => None,
                    };
                    if let Some(old) = detached {
                        trace!(%id, node = %name, %old, "owned reference replaced");
                        next.push(Visit::Delete(old));
                    }
                    let Some(current) = current else {
                        continue;
                    };
                    if *owning || context.get(current)?.state() == EntityState::New {
                        next.push(Visit::Save(current));
                    } else {
                        self.depends_on.push(current);
                    }
                }
                NodeDef::Collection {
                    target,
                    foreign_node,
                    owning: true,
                } => {
                    let collection = context.get(id)?.collection(name)?;
                    let mut members: Vec<EntityId> = collection.members().collect();
                    let removed = collection.removed_entities().to_vec();
                    for member in context.inverse_members(id, target, foreign_node) {
                        if !members.contains(&member) {
                            members.push(member);
                        }
                    }
                    next.extend(members.into_iter().map(Visit::Save));
                    for member in removed {
                        if context.contains(member) {
                            trace!(%id, node = %name, %member, "owned member removed");
                            next.push(Visit::Delete(member));
                        }
                    }
                }
                NodeDef::Collection { .. } | NodeDef::Attribute { .. } => {}
            }
        }
        Ok(next)
    }

    fn visit_delete(&mut self, context: &mut EntityContext, id: EntityId) -> CoreResult<Vec<Visit>> {
        let mut next = Vec::new();
        if !self.deleted.insert(id) {
            return Ok(next);
        }
        self.delete.push(id);

        context.fetch(id, false)?;
        let entity = context.get(id)?;
        if !matches!(entity.state(), EntityState::Loaded | EntityState::New) {
            return Ok(next);
        }
        let entity_type = Arc::clone(entity.entity_type());
        for (name, def) in &entity_type.nodes {
            match def {
                NodeDef::Reference { owning: true, .. } => {
                    let target = context.get(id)?.reference(name)?.target();
                    next.extend(target.map(Visit::Delete));
                }
                NodeDef::Collection { owning: true, .. } => {
                    let mut members = context.collection_members(id, name)?;
                    members.extend(context.get(id)?.collection(name)?.removed_entities());
                    next.extend(members.into_iter().map(Visit::Delete));
                }
                _ => {}
            }
        }
        Ok(next)
    }

    /// Adds the owners of an unlocked saved or deleted entity to depends-on,
    /// walking up until an owner carries its own lock.
    fn collect_owners(&mut self, context: &EntityContext, id: EntityId) {
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            let locked = context
                .get(current)
                .is_ok_and(|e| e.entity_type().has_lock());
            if locked || !seen.insert(current) {
                continue;
            }
            for owner in context.owners_of(current) {
                let new = context
                    .get(owner)
                    .is_ok_and(|e| e.state() == EntityState::New);
                if !new && !self.saved.contains(&owner) && !self.deleted.contains(&owner) {
                    self.depends_on.push(owner);
                }
                stack.push(owner);
            }
        }
    }

    fn into_groups(self, context: &EntityContext) -> CoreResult<OperationGroups> {
        let is_new = |id: &EntityId| {
            context
                .get(*id)
                .is_ok_and(|e| e.state() == EntityState::New)
        };
        let delete: Vec<EntityId> = self
            .delete
            .iter()
            .copied()
            .filter(|id| {
                let keep = !is_new(id);
                if !keep {
                    trace!(%id, "unsaved entity deleted, nothing to write");
                }
                keep
            })
            .collect();

        let create: Vec<EntityId> = self
            .create
            .iter()
            .copied()
            .filter(|id| !self.deleted.contains(id))
            .collect();
        let create = topological(context, &create, true)?;
        let delete = topological(context, &delete, false)?.reversed();

        let update: OperationGroup = self
            .update
            .iter()
            .copied()
            .filter(|id| !self.deleted.contains(id))
            .collect();
        let depends_on: OperationGroup = self
            .depends_on
            .iter()
            .copied()
            .filter(|id| {
                !self.deleted.contains(id)
                    && !create.contains(*id)
                    && !update.contains(*id)
                    && !is_new(id)
            })
            .collect();

        Ok(OperationGroups {
            create,
            update,
            delete,
            depends_on,
        })
    }
}

/// Orders `ids` so that every entity follows the members of `ids` it
/// references, keeping the input order otherwise.
///
/// A reference cycle is an error when `strict`; otherwise the cycle is cut
/// where it was entered.
fn topological(
    graph: &impl DependencyGraph,
    ids: &[EntityId],
    strict: bool,
) -> CoreResult<OperationGroup> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    let members: HashSet<EntityId> = ids.iter().copied().collect();
    let mut marks = HashMap::with_capacity(ids.len());
    let mut out = OperationGroup::new();
    for &root in ids {
        if marks.contains_key(&root) {
            continue;
        }
        marks.insert(root, Mark::Visiting);
        let mut path = vec![(root, graph.dependencies(root).into_iter())];
        while let Some((id, dependencies)) = path.last_mut() {
            let id = *id;
            let Some(dependency) = dependencies.next() else {
                path.pop();
                marks.insert(id, Mark::Done);
                out.push(id);
                continue;
            };
            if dependency == id || !members.contains(&dependency) {
                continue;
            }
            match marks.get(&dependency) {
                Some(Mark::Done) => {}
                Some(Mark::Visiting) if strict => {
                    return Err(CoreError::illegal_persist_state(format!(
                        "reference cycle among created entities at {dependency}"
                    )))
                }
                Some(Mark::Visiting) => {}
                None => {
                    marks.insert(dependency, Mark::Visiting);
                    path.push((dependency, graph.dependencies(dependency).into_iter()));
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::schema::{EntityTypeDef, Schema};
    use crate::test_support::{context, context_with_store, store};
    use relgraph_store::{Connection, Row, Value};

    #[test]
    fn empty_request_is_illegal() {
        let mut ctx = context();
        assert!(matches!(
            GraphAnalyser.analyse(&mut ctx, &PersistRequest::new()),
            Err(CoreError::IllegalPersistState { .. })
        ));
    }

    #[test]
    fn unknown_entity_is_rejected() {
        let mut ctx = context();
        let request = PersistRequest::new().save(EntityId::new());
        assert!(matches!(
            GraphAnalyser.analyse(&mut ctx, &request),
            Err(CoreError::EntityNotInContext { .. })
        ));
    }

    #[test]
    fn new_graph_is_created_dependencies_first() {
        let mut ctx = context();
        let line = ctx.new_model("OrderLine").unwrap().id();
        let order = ctx.new_model("Order").unwrap().id();
        let address = ctx.new_model("Address").unwrap().id();
        let customer = ctx.new_model("Customer").unwrap().id();
        ctx.set_reference(line, "order", Some(order)).unwrap();
        ctx.set_reference(order, "shipping", Some(address)).unwrap();
        ctx.set_reference(order, "customer", Some(customer)).unwrap();

        let groups = GraphAnalyser
            .analyse(&mut ctx, &PersistRequest::new().save(order))
            .unwrap();

        let created = groups.create.as_slice();
        assert_eq!(created.len(), 4);
        let pos = |id| created.iter().position(|x| *x == id).unwrap();
        assert!(pos(customer) < pos(order));
        assert!(pos(address) < pos(order));
        assert!(pos(order) < pos(line));
        assert!(groups.update.is_empty());
    }

    #[test]
    fn existing_reference_is_depends_on() {
        let (store, mut ctx) = context_with_store();
        store
            .seed("customers", Row::new().with("id", 1).with("name", "Ada").with("version", 1))
            .unwrap();
        let customer = ctx.get_or_create("Customer", Value::Integer(1)).unwrap();
        let order = ctx.new_model("Order").unwrap().id();
        ctx.set_reference(order, "customer", Some(customer)).unwrap();

        let groups = GraphAnalyser
            .analyse(&mut ctx, &PersistRequest::new().save(order))
            .unwrap();
        assert_eq!(groups.create.as_slice(), &[order]);
        assert_eq!(groups.depends_on.as_slice(), &[customer]);
    }

    #[test]
    fn unlocked_child_pulls_owner_into_depends_on() {
        let (store, mut ctx) = context_with_store();
        store
            .seed(
                "orders",
                Row::new()
                    .with("id", 10)
                    .with("number", "A-10")
                    .with("status", "open")
                    .with("version", 1),
            )
            .unwrap();
        store
            .seed(
                "order_lines",
                Row::new()
                    .with("id", 100)
                    .with("product", "bolt")
                    .with("quantity", 1)
                    .with("order_id", 10),
            )
            .unwrap();
        let line = ctx.get_or_create("OrderLine", Value::Integer(100)).unwrap();
        ctx.set_value(line, "quantity", Value::Integer(2)).unwrap();
        let order = ctx.reference(line, "order").unwrap().unwrap();

        let groups = GraphAnalyser
            .analyse(&mut ctx, &PersistRequest::new().save(line))
            .unwrap();
        assert_eq!(groups.update.as_slice(), &[line]);
        assert_eq!(groups.depends_on.as_slice(), &[order]);
    }

    #[test]
    fn delete_takes_owned_entities_dependents_first() {
        let (store, mut ctx) = context_with_store();
        store
            .seed(
                "addresses",
                Row::new().with("id", 5).with("street", "Main").with("city", "Oslo"),
            )
            .unwrap();
        store
            .seed(
                "orders",
                Row::new()
                    .with("id", 10)
                    .with("number", "A-10")
                    .with("status", "open")
                    .with("version", 1)
                    .with("shipping_id", 5),
            )
            .unwrap();
        for id in [100, 101] {
            store
                .seed(
                    "order_lines",
                    Row::new()
                        .with("id", id)
                        .with("product", "bolt")
                        .with("quantity", 1)
                        .with("order_id", 10),
                )
                .unwrap();
        }
        let order = ctx.get_or_create("Order", Value::Integer(10)).unwrap();

        let groups = GraphAnalyser
            .analyse(&mut ctx, &PersistRequest::new().delete(order))
            .unwrap();

        let deleted = groups.delete.as_slice();
        assert_eq!(deleted.len(), 4);
        let address = ctx.get_by_key("Address", &Value::Integer(5)).unwrap().unwrap();
        let pos = |id| deleted.iter().position(|x| *x == id).unwrap();
        for key in [100, 101] {
            let line = ctx.get_by_key("OrderLine", &Value::Integer(key)).unwrap().unwrap();
            assert!(pos(line) < pos(order));
        }
        assert!(pos(order) < pos(address));
    }

    #[test]
    fn delete_wins_over_save() {
        let (store, mut ctx) = context_with_store();
        store
            .seed(
                "orders",
                Row::new()
                    .with("id", 10)
                    .with("number", "A-10")
                    .with("status", "open")
                    .with("version", 1),
            )
            .unwrap();
        let order = ctx.get_or_create("Order", Value::Integer(10)).unwrap();
        let request = PersistRequest::new().save(order).delete(order);
        let groups = GraphAnalyser.analyse(&mut ctx, &request).unwrap();
        assert_eq!(groups.delete.as_slice(), &[order]);
        assert!(groups.update.is_empty());
    }

    #[test]
    fn separate_saves_share_one_create_group() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let company = ctx.new_model("Company").unwrap().id();
        let registration = ctx.new_model("Registration").unwrap().id();
        ctx.set_reference(company, "registration", Some(registration)).unwrap();

        let groups = GraphAnalyser
            .analyse(&mut ctx, &PersistRequest::new().save(company).save(order))
            .unwrap();
        assert_eq!(groups.create.as_slice(), &[registration, company, order]);
    }

    struct Cycle(EntityId, EntityId);

    impl DependencyGraph for Cycle {
        fn type_of(&self, _id: EntityId) -> Option<&str> {
            Some("Node")
        }

        fn dependencies(&self, id: EntityId) -> Vec<EntityId> {
            vec![if id == self.0 { self.1 } else { self.0 }]
        }
    }

    #[test]
    fn reference_cycle_is_illegal_for_creates_only() {
        let a = EntityId::new();
        let b = EntityId::new();
        let graph = Cycle(a, b);
        assert!(matches!(
            topological(&graph, &[a, b], true),
            Err(CoreError::IllegalPersistState { .. })
        ));
        assert_eq!(topological(&graph, &[a, b], false).unwrap().len(), 2);
    }

    #[test]
    fn deep_ownership_chain_is_walked_without_recursion() {
        let schema = Arc::new(
            Schema::builder()
                .entity(
                    EntityTypeDef::new("Folder", "folders")
                        .lock("version")
                        .attribute("name")
                        .owning_reference("child", "Folder"),
                )
                .build()
                .unwrap(),
        );
        let store = store(&schema);
        let connection: Arc<dyn Connection> = Arc::new(store.connect());
        let mut ctx = EntityContext::new(schema, connection, Config::default());

        let folders: Vec<EntityId> = (0..50_000)
            .map(|_| ctx.new_model("Folder").unwrap().id())
            .collect();
        for pair in folders.windows(2) {
            ctx.set_reference(pair[0], "child", Some(pair[1])).unwrap();
        }

        let groups = GraphAnalyser
            .analyse(&mut ctx, &PersistRequest::new().save(folders[0]))
            .unwrap();
        let created = groups.create.as_slice();
        assert_eq!(created.len(), folders.len());
        assert_eq!(created.first(), folders.last());
        assert_eq!(created.last(), folders.first());

        let groups = GraphAnalyser
            .analyse(&mut ctx, &PersistRequest::new().delete(folders[0]))
            .unwrap();
        assert!(groups.delete.is_empty());
    }
}
