//! The persistence engine.
//!
//! A persist call takes a [`PersistRequest`] naming entities to save and
//! delete, asks a [`PersistAnalyser`] to classify the affected graph into
//! [`OperationGroups`], and runs the stages of [`Stage`] in order against one
//! transaction. Success reconciles the caller's context; any failure rolls
//! the transaction back and leaves the context as it was.

mod analyser;
mod audit;
mod batch;
mod dataset;
mod group;
mod locks;
mod persister;
mod sequence;
mod statements;

pub use analyser::{GraphAnalyser, PersistAnalyser};
pub use audit::{
    AuditInformation, AuditRecord, AuditSink, Change, CollectingAuditSink, NoAuditSink,
    TableAuditSink,
};
pub use batch::{BatchExecuter, BatchOutcome, PendingRow};
pub use dataset::DatabaseDataSet;
pub use group::{DependencyGraph, OperationGroup, OperationGroups};
pub use locks::{next_lock_value, LockPropagation, OwnershipGraph};
pub use persister::{Persister, TransactionScope};
pub use sequence::{SequenceGenerator, StoreSequenceGenerator};
pub use statements::{ColumnSource, PreparedStatement, PreparedStatementCache};

use crate::context::{EntityContext, EntityHandle};
use crate::entity::{Entity, EntityId};
use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a statement does to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Insert a new row.
    Create,
    /// Update an existing row.
    Update,
    /// Delete an existing row.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Stages of a persist call, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Load the database state of existing entities and check it.
    LoadAndValidate,
    /// Diff the graph against the database.
    Audit,
    /// Decide which existing rows are written, including lock propagation.
    ComputeRequiredUpdates,
    /// Assign keys to created entities.
    SetKeys,
    /// Group same-type rows.
    ReorderForBatching,
    /// Consult the access controller.
    VerifyAccess,
    /// Insert created rows.
    Insert,
    /// Update rows.
    Update,
    /// Delete rows.
    Delete,
    /// Hand the audit records to the sink.
    WriteAudit,
    /// Store the new lock tokens in the graph.
    AdvanceOptimisticLocks,
    /// Bring the caller's context up to date.
    Reconcile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Anything that names an entity.
pub trait AsEntityId {
    /// The entity's identifier.
    fn entity_id(&self) -> EntityId;
}

impl AsEntityId for EntityId {
    fn entity_id(&self) -> EntityId {
        *self
    }
}

impl AsEntityId for EntityHandle {
    fn entity_id(&self) -> EntityId {
        self.id()
    }
}

impl<T: AsEntityId + ?Sized> AsEntityId for &T {
    fn entity_id(&self) -> EntityId {
        (**self).entity_id()
    }
}

/// The entities a persist call saves and deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistRequest {
    /// Entities to insert or update.
    pub save: Vec<EntityId>,
    /// Entities to delete.
    pub delete: Vec<EntityId>,
}

impl PersistRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity to save.
    #[must_use]
    pub fn save(mut self, entity: impl AsEntityId) -> Self {
        self.save.push(entity.entity_id());
        self
    }

    /// Adds an entity to delete.
    #[must_use]
    pub fn delete(mut self, entity: impl AsEntityId) -> Self {
        self.delete.push(entity.entity_id());
        self
    }

    /// Returns true if nothing is named.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.save.is_empty() && self.delete.is_empty()
    }
}

/// Outcome of a successful persist call.
#[derive(Debug, Clone, Default)]
pub struct PersistReport {
    /// Inserted entities, in insert order.
    pub created: Vec<EntityId>,
    /// Updated entities, in update order.
    pub updated: Vec<EntityId>,
    /// Deleted entities, in delete order.
    pub deleted: Vec<EntityId>,
    /// Entities whose lock token was advanced.
    pub lock_advanced: Vec<EntityId>,
    /// Audit records as handed to the sink.
    pub audit: Vec<AuditRecord>,
    /// Physical batches executed.
    pub batches: usize,
}

/// Decides whether an operation on an entity is allowed.
pub trait AccessController: Send + Sync {
    /// Returns `Err(reason)` to refuse.
    ///
    /// # Errors
    ///
    /// The reason is reported as [`crate::CoreError::AccessDenied`].
    fn verify(&self, operation: Operation, entity: &Entity) -> Result<(), String>;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessController for AllowAll {
    fn verify(&self, _operation: Operation, _entity: &Entity) -> Result<(), String> {
        Ok(())
    }
}

/// Notified as a persist call moves through its stages.
pub trait PersistObserver: Send + Sync {
    /// Called before `stage` runs.
    fn before_stage(&self, stage: Stage);

    /// Called with the row outcome of the write stages, before the
    /// transaction commits or rolls back.
    fn after_batches(&self, _outcome: &BatchOutcome) {}
}

impl<F> PersistObserver for F
where
    F: Fn(Stage) + Send + Sync,
{
    fn before_stage(&self, stage: Stage) {
        self(stage);
    }
}

impl EntityContext {
    /// Persists with the default [`Persister`].
    ///
    /// # Errors
    ///
    /// See [`Persister::persist`].
    pub fn persist(&mut self, request: &PersistRequest) -> CoreResult<PersistReport> {
        Persister::new().persist(self, request)
    }
}
