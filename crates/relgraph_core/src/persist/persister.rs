//! The persist state machine.

use super::analyser::{GraphAnalyser, PersistAnalyser};
use super::audit::{AuditInformation, AuditSink, NoAuditSink};
use super::batch::{BatchExecuter, PendingRow};
use super::dataset::DatabaseDataSet;
use super::group::{OperationGroup, OperationGroups};
use super::locks::{next_lock_value, LockPropagation};
use super::sequence::{SequenceGenerator, StoreSequenceGenerator};
use super::{
    AccessController, AllowAll, Operation, PersistObserver, PersistReport, PersistRequest, Stage,
};
use crate::context::{EntityContext, Removal};
use crate::entity::{Entity, EntityId, EntitySnapshot, EntityState, Node};
use crate::error::{CoreError, CoreResult};
use relgraph_store::{Connection, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Writes the changes of an entity context to its store.
///
/// A persist call:
/// - works on a private copy of the caller's graph, so a failure leaves the
///   caller's context exactly as it was
/// - validates every existing row against a fresh read before writing
/// - advances the optimistic lock of each written locked row, and of the
///   first locked owner of every written unlocked row
/// - runs all statements in one transaction that is rolled back on failure
///
/// The collaborators (analyser, key generator, audit sink, access
/// controller, observer) are replaceable through the `with_*` methods.
#[derive(Clone)]
pub struct Persister {
    analyser: Arc<dyn PersistAnalyser>,
    sequences: Arc<dyn SequenceGenerator>,
    audit_sink: Arc<dyn AuditSink>,
    access: Arc<dyn AccessController>,
    observer: Option<Arc<dyn PersistObserver>>,
}

impl fmt::Debug for Persister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persister")
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Persister {
    fn default() -> Self {
        Self {
            analyser: Arc::new(GraphAnalyser),
            sequences: Arc::new(StoreSequenceGenerator),
            audit_sink: Arc::new(NoAuditSink),
            access: Arc::new(AllowAll),
            observer: None,
        }
    }
}

impl Persister {
    /// Creates a persister with the default collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the request analyser.
    #[must_use]
    pub fn with_analyser(mut self, analyser: impl PersistAnalyser + 'static) -> Self {
        self.analyser = Arc::new(analyser);
        self
    }

    /// Replaces the key generator.
    #[must_use]
    pub fn with_sequences(mut self, sequences: impl SequenceGenerator + 'static) -> Self {
        self.sequences = Arc::new(sequences);
        self
    }

    /// Replaces the audit sink.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: impl AuditSink + 'static) -> Self {
        self.audit_sink = Arc::new(sink);
        self
    }

    /// Replaces the access controller.
    #[must_use]
    pub fn with_access_controller(mut self, access: impl AccessController + 'static) -> Self {
        self.access = Arc::new(access);
        self
    }

    /// Installs an observer called before every stage and after the write
    /// stages.
    #[must_use]
    pub fn with_observer(mut self, observer: impl PersistObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Persists the entities named by `request`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::IllegalPersistState`] for an empty request or an
    ///   unpersistable graph
    /// - [`CoreError::EntityMissing`] if a row to update, delete or depend on
    ///   is gone
    /// - [`CoreError::OptimisticLockMismatch`] if a row changed since it was
    ///   read
    /// - [`CoreError::PrimaryKeyExists`] if an insert collides
    /// - [`CoreError::AccessDenied`], [`CoreError::PreparingStatement`] and
    ///   store failures
    ///
    /// On any error nothing is committed and `context` is unchanged.
    pub fn persist(
        &self,
        context: &mut EntityContext,
        request: &PersistRequest,
    ) -> CoreResult<PersistReport> {
        let mut working = context.fork();
        let ids = context.ids();
        context.copy_into(&mut working, &ids)?;

        let groups = self.analyser.analyse(&mut working, request)?;
        let discarded: Vec<EntityId> = request
            .delete
            .iter()
            .copied()
            .filter(|id| {
                working
                    .get(*id)
                    .is_ok_and(|e| e.state() == EntityState::New)
                    && !groups.create.contains(*id)
            })
            .collect();

        let connection = Arc::clone(working.connection());
        let scope = TransactionScope::begin(connection.as_ref())?;
        let outcome = self.write(&mut working, connection.as_ref(), &groups)?;
        scope.commit()?;

        self.enter(Stage::AdvanceOptimisticLocks);
        {
            let mut internal = working.internal();
            for (&id, lock) in &outcome.new_locks {
                let lock_node = internal.get(id)?.entity_type().lock_node.clone();
                if let Some(lock_node) = lock_node {
                    internal.assign_value(id, &lock_node, lock.clone())?;
                }
            }
        }

        self.enter(Stage::Reconcile);
        reconcile(context, &mut working, &outcome, &discarded)?;

        let report = PersistReport {
            created: outcome.create.as_slice().to_vec(),
            updated: outcome.update.as_slice().to_vec(),
            deleted: outcome.delete.as_slice().to_vec(),
            lock_advanced: outcome
                .update
                .iter()
                .filter(|id| outcome.new_locks.contains_key(id))
                .collect(),
            audit: outcome.audit,
            batches: outcome.batches,
        };
        debug!(
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            batches = report.batches,
            "persist complete"
        );
        Ok(report)
    }

    /// Every stage up to and including the audit write.
    fn write(
        &self,
        working: &mut EntityContext,
        connection: &dyn Connection,
        groups: &OperationGroups,
    ) -> CoreResult<Outcome> {
        let config = working.config().clone();

        self.enter(Stage::LoadAndValidate);
        let existing = groups.existing();
        let mut dataset = DatabaseDataSet::new(working);
        dataset.load(working, existing.as_slice())?;
        for id in existing.iter() {
            let entity = working.get(id)?;
            let Some(database) = dataset.snapshot(id) else {
                return Err(CoreError::entity_missing(
                    entity.type_name(),
                    entity.key().cloned().unwrap_or(Value::Null),
                ));
            };
            if !config.validate_locks_before_write {
                continue;
            }
            if let (Some(lock_node), Some(local)) =
                (&entity.entity_type().lock_node, entity.lock_value())
            {
                if database.value(lock_node) != Some(local) {
                    return Err(CoreError::lock_mismatch(
                        entity.snapshot(),
                        database.clone(),
                        lock_node,
                    ));
                }
            }
        }

        self.enter(Stage::Audit);
        let checked: Vec<EntityId> = groups
            .update
            .iter()
            .chain(groups.depends_on.iter())
            .collect();
        let audit = AuditInformation::compute(
            working,
            groups.create.as_slice(),
            &checked,
            groups.delete.as_slice(),
            |id| dataset.snapshot(id).cloned(),
        )?;

        self.enter(Stage::ComputeRequiredUpdates);
        let edited: HashSet<EntityId> = groups
            .create
            .iter()
            .chain(groups.delete.iter())
            .chain(checked.iter().copied().filter(|id| audit.has_changes(*id)))
            .collect();
        let mut propagation = LockPropagation::new(&edited);
        let mut writes = OperationGroup::new();
        let mut new_locks = HashMap::new();
        for &id in &checked {
            if !propagation.is_required(&*working, id) {
                continue;
            }
            let entity = working.get(id)?;
            let entity_type = entity.entity_type();
            if !audit.has_changes(id) && !entity_type.has_lock() {
                continue;
            }
            writes.push(id);
            if let Some(lock_node) = &entity_type.lock_node {
                let current = expected_lock(entity, dataset.snapshot(id), lock_node);
                new_locks.insert(
                    id,
                    next_lock_value(current.as_ref(), config.initial_lock_value),
                );
            }
        }
        debug!(
            checked = checked.len(),
            edited = edited.len(),
            writes = writes.len(),
            visited = propagation.visited(),
            "required updates computed"
        );

        self.enter(Stage::SetKeys);
        {
            let mut internal = working.internal();
            for id in groups.create.iter() {
                let entity = internal.get(id)?;
                let entity_type = Arc::clone(entity.entity_type());
                if entity.key().is_none() {
                    let key = self.sequences.next_key(connection, &entity_type)?;
                    trace!(%id, entity_type = %entity_type.name, %key, "key assigned");
                    internal.assign_value(id, &entity_type.key_node, key)?;
                }
                if let Some(lock_node) = &entity_type.lock_node {
                    let unset = internal
                        .get(id)?
                        .value(lock_node)
                        .map_or(true, Value::is_null);
                    if unset {
                        new_locks.insert(id, Value::Integer(config.initial_lock_value));
                    }
                }
            }
        }

        self.enter(Stage::ReorderForBatching);
        let create = groups.create.optimized_for_insert(&*working, false);
        let update = writes.optimized_for_update(&*working);
        let delete = groups.delete.optimized_for_delete(&*working);
        debug!(
            create_runs = create.runs(&*working),
            update_runs = update.runs(&*working),
            delete_runs = delete.runs(&*working),
            "reordered for batching"
        );

        self.enter(Stage::VerifyAccess);
        for (operation, group) in [
            (Operation::Create, &create),
            (Operation::Update, &update),
            (Operation::Delete, &delete),
        ] {
            for id in group.iter() {
                let entity = working.get(id)?;
                self.access
                    .verify(operation, entity)
                    .map_err(|reason| CoreError::AccessDenied {
                        entity_type: entity.type_name().to_string(),
                        key: entity.key().cloned().unwrap_or(Value::Null),
                        operation: operation.to_string(),
                        reason,
                    })?;
            }
        }

        let mut executer = BatchExecuter::new(connection, config.max_batch_size);
        'stages: for (stage, operation, group) in [
            (Stage::Insert, Operation::Create, &create),
            (Stage::Update, Operation::Update, &update),
            (Stage::Delete, Operation::Delete, &delete),
        ] {
            self.enter(stage);
            for id in group.iter() {
                let row = pending_row(working, &dataset, &new_locks, &mut executer, operation, id)?;
                executer.push(operation, row)?;
                if executer.has_failures() {
                    break 'stages;
                }
            }
            executer.flush()?;
            if executer.has_failures() {
                break;
            }
        }
        let rows = executer.finish()?;
        if let Some(observer) = &self.observer {
            observer.after_batches(&rows);
        }
        if !rows.is_clean() {
            warn!(
                executed = rows.executed.len(),
                failed = rows.failures.len(),
                "rows failed, aborting persist"
            );
        }
        let batches = rows.batches;
        rows.into_result()?;

        self.enter(Stage::WriteAudit);
        let records = audit.finalized(|id| working.get(id).ok().map(Entity::snapshot));
        if config.audit_enabled {
            self.audit_sink.write(connection, &records)?;
        }

        Ok(Outcome {
            create,
            update,
            delete,
            new_locks,
            audit: records,
            batches,
        })
    }

    fn enter(&self, stage: Stage) {
        debug!(%stage, "persist stage");
        if let Some(observer) = &self.observer {
            observer.before_stage(stage);
        }
    }
}

/// What the write stages decided and did.
struct Outcome {
    create: OperationGroup,
    update: OperationGroup,
    delete: OperationGroup,
    new_locks: HashMap<EntityId, Value>,
    audit: Vec<super::AuditRecord>,
    batches: usize,
}

/// The lock value the database is expected to hold for an entity.
fn expected_lock(
    entity: &Entity,
    database: Option<&EntitySnapshot>,
    lock_node: &str,
) -> Option<Value> {
    entity
        .value(lock_node)
        .cloned()
        .or_else(|| database.and_then(|d| d.value(lock_node).cloned()))
}

fn pending_row(
    working: &EntityContext,
    dataset: &DatabaseDataSet,
    new_locks: &HashMap<EntityId, Value>,
    executer: &mut BatchExecuter<'_>,
    operation: Operation,
    id: EntityId,
) -> CoreResult<PendingRow> {
    let entity = working.get(id)?;
    let entity_type = Arc::clone(entity.entity_type());
    let key = entity.key().cloned().ok_or_else(|| {
        CoreError::illegal_persist_state(format!("{} {id} has no key", entity_type.name))
    })?;
    let database = dataset.snapshot(id);
    let lock_node = entity_type.lock_node.as_deref();
    let expected = lock_node.and_then(|node| expected_lock(entity, database, node));

    let value_of = |node: &str| {
        if Some(node) == lock_node {
            if let Some(lock) = new_locks.get(&id) {
                return lock.clone();
            }
        }
        entity
            .node(node)
            .and_then(Node::persistent_value)
            .or_else(|| database.and_then(|d| d.value(node).cloned()))
            .unwrap_or(Value::Null)
    };
    let mut params = executer
        .statement(&entity_type, operation)?
        .bind(&entity_type, value_of);
    if operation != Operation::Create {
        params.push(key.clone());
        if lock_node.is_some() {
            params.push(expected.clone().unwrap_or(Value::Null));
        }
    }

    let mut local = entity.snapshot();
    if let (Some(node), Some(expected)) = (lock_node, expected) {
        local.values.insert(node.to_string(), expected);
    }
    Ok(PendingRow {
        id,
        entity_type,
        key,
        local,
        params,
    })
}

/// Brings the caller's context in line with what was committed.
fn reconcile(
    context: &mut EntityContext,
    working: &mut EntityContext,
    outcome: &Outcome,
    discarded: &[EntityId],
) -> CoreResult<()> {
    for id in outcome.create.iter() {
        let entity = working.entity_mut(id)?;
        entity.set_state(EntityState::Loaded);
        for (_, node) in entity.nodes_mut() {
            match node {
                Node::Reference(reference) => reference.clear_tracking(),
                Node::Collection(collection) => {
                    collection.set_fetched(true);
                    collection.clear_removed();
                }
                Node::Value(_) => {}
            }
        }
    }
    for id in outcome.update.iter() {
        let entity = working.entity_mut(id)?;
        for (_, node) in entity.nodes_mut() {
            match node {
                Node::Reference(reference) => reference.clear_tracking(),
                Node::Collection(collection) => collection.clear_removed(),
                Node::Value(_) => {}
            }
        }
    }

    let removed: HashSet<EntityId> = outcome
        .delete
        .iter()
        .chain(discarded.iter().copied())
        .collect();
    let kept: Vec<EntityId> = working
        .ids()
        .into_iter()
        .filter(|id| !removed.contains(id))
        .collect();
    working.copy_into(context, &kept)?;

    for id in outcome.delete.iter().chain(discarded.iter().copied()) {
        if !context.contains(id) {
            continue;
        }
        match context.remove(id, &removed)? {
            Removal::Removed(_) => trace!(%id, "removed after delete"),
            Removal::Unloaded => debug!(%id, "deleted entity still referenced, unloaded"),
        }
    }
    trace!(kept = kept.len(), removed = removed.len(), "context reconciled");
    Ok(())
}

/// The transaction a persist call writes in.
///
/// If the connection already has a transaction the scope joins it and leaves
/// commit and rollback to its owner. Otherwise it begins one, and rolls it
/// back when dropped without [`TransactionScope::commit`].
pub struct TransactionScope<'c> {
    connection: &'c dyn Connection,
    owned: bool,
    committed: bool,
}

impl<'c> TransactionScope<'c> {
    /// Joins or begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns store failures from `begin`.
    pub fn begin(connection: &'c dyn Connection) -> CoreResult<Self> {
        let owned = !connection.in_transaction();
        if owned {
            connection.begin()?;
        }
        trace!(owned, "transaction scope opened");
        Ok(Self {
            connection,
            owned,
            committed: false,
        })
    }

    /// Returns true if this scope began the transaction.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Commits the transaction if this scope began it.
    ///
    /// # Errors
    ///
    /// Returns store failures from `commit`.
    pub fn commit(mut self) -> CoreResult<()> {
        if self.owned {
            self.connection.commit()?;
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.owned || self.committed {
            return;
        }
        match self.connection.rollback() {
            Ok(()) => debug!("persist transaction rolled back"),
            Err(err) => warn!(error = %err, "failed to roll back persist transaction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{AsEntityId, CollectingAuditSink};
    use crate::test_support::context_with_store;
    use parking_lot::Mutex;
    use relgraph_store::Row;

    fn seed_order(store: &relgraph_store::InMemoryStore) {
        store
            .seed("customers", Row::new().with("id", 1).with("name", "Ada").with("version", 1))
            .unwrap();
        store
            .seed(
                "orders",
                Row::new()
                    .with("id", 10)
                    .with("number", "A-10")
                    .with("status", "open")
                    .with("version", 3)
                    .with("customer_id", 1),
            )
            .unwrap();
    }

    #[test]
    fn creates_graph_with_keys_and_locks() {
        let (store, mut ctx) = context_with_store();
        let customer = ctx.new_model("Customer").unwrap();
        let order = ctx.new_model("Order").unwrap();
        ctx.set_value(customer.id(), "name", Value::from("Ada")).unwrap();
        ctx.set_value(order.id(), "number", Value::from("A-1")).unwrap();
        ctx.set_reference(order.id(), "customer", Some(customer.id()))
            .unwrap();

        let report = ctx
            .persist(&PersistRequest::new().save(&order))
            .unwrap();

        assert_eq!(report.created, vec![customer.id(), order.id()]);
        let customer_key = ctx.key_of(customer.id()).unwrap().unwrap();
        let row = store.row("orders", &ctx.key_of(order.id()).unwrap().unwrap()).unwrap();
        assert_eq!(row.get("customer_id"), Some(&customer_key));
        assert_eq!(row.get("version"), Some(&Value::Integer(1)));
        let entity = ctx.get(order.entity_id()).unwrap();
        assert_eq!(entity.state(), EntityState::Loaded);
        assert_eq!(entity.lock_value(), Some(&Value::Integer(1)));
    }

    #[test]
    fn unchanged_entity_is_not_written() {
        let (store, mut ctx) = context_with_store();
        seed_order(&store);
        let customer = ctx.get_or_create("Customer", Value::Integer(1)).unwrap();
        ctx.fetch(customer, false).unwrap();

        let report = ctx.persist(&PersistRequest::new().save(customer)).unwrap();

        assert!(report.updated.is_empty());
        assert_eq!(report.batches, 0);
        assert_eq!(
            store.row("customers", &Value::Integer(1)).unwrap().get("version"),
            Some(&Value::Integer(1))
        );
    }

    #[test]
    fn update_advances_lock_and_audits() {
        let (store, mut ctx) = context_with_store();
        seed_order(&store);
        let order = ctx.get_or_create("Order", Value::Integer(10)).unwrap();
        ctx.set_value(order, "status", Value::from("shipped")).unwrap();

        let sink = CollectingAuditSink::new();
        let report = Persister::new()
            .with_audit_sink(sink.clone())
            .persist(&mut ctx, &PersistRequest::new().save(order))
            .unwrap();

        assert_eq!(report.lock_advanced, vec![order]);
        let row = store.row("orders", &Value::Integer(10)).unwrap();
        assert_eq!(row.get("status"), Some(&Value::from("shipped")));
        assert_eq!(row.get("version"), Some(&Value::Integer(4)));
        assert_eq!(ctx.get(order).unwrap().lock_value(), Some(&Value::Integer(4)));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, Operation::Update);
        assert_eq!(records[0].changes[0].node, "status");
    }

    #[test]
    fn stages_run_in_order() {
        let (store, mut ctx) = context_with_store();
        seed_order(&store);
        let order = ctx.get_or_create("Order", Value::Integer(10)).unwrap();
        ctx.set_value(order, "status", Value::from("closed")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        Persister::new()
            .with_observer(move |stage: Stage| recorder.lock().push(stage))
            .persist(&mut ctx, &PersistRequest::new().save(order))
            .unwrap();

        let seen = seen.lock().clone();
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn failure_rolls_back_and_leaves_context_untouched() {
        let (store, mut ctx) = context_with_store();
        seed_order(&store);
        let order = ctx.get_or_create("Order", Value::Integer(10)).unwrap();
        ctx.set_value(order, "status", Value::from("shipped")).unwrap();
        let fresh = ctx.new_model("Customer").unwrap();

        struct DenyCustomers;
        impl AccessController for DenyCustomers {
            fn verify(&self, _operation: Operation, entity: &Entity) -> Result<(), String> {
                if entity.type_name() == "Customer" {
                    Err("read only".into())
                } else {
                    Ok(())
                }
            }
        }

        let err = Persister::new()
            .with_access_controller(DenyCustomers)
            .persist(
                &mut ctx,
                &PersistRequest::new().save(order).save(&fresh),
            )
            .unwrap_err();

        assert!(matches!(err, CoreError::AccessDenied { .. }));
        assert_eq!(ctx.get(fresh.id()).unwrap().state(), EntityState::New);
        assert_eq!(ctx.key_of(fresh.id()).unwrap(), None);
        assert_eq!(ctx.get(order).unwrap().lock_value(), Some(&Value::Integer(3)));
        assert_eq!(
            store.row("orders", &Value::Integer(10)).unwrap().get("status"),
            Some(&Value::from("open"))
        );
        assert!(!ctx.connection().in_transaction());
        assert_eq!(ctx.connection().open_statements(), 0);
    }

    #[test]
    fn scope_joins_an_open_transaction() {
        let (_store, ctx) = context_with_store();
        let connection = ctx.connection();
        connection.begin().unwrap();
        {
            let scope = TransactionScope::begin(connection.as_ref()).unwrap();
            assert!(!scope.is_owned());
        }
        assert!(connection.in_transaction());
        connection.rollback().unwrap();
    }
}
