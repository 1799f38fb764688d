//! Error types for relgraph core.

use crate::entity::{EntityId, EntitySnapshot};
use relgraph_store::{StoreError, Value};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// The failure type returned by a persist call.
pub type PersistFailure = CoreError;

/// Errors that can occur in relgraph core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Failure reported by the store, wrapped without interpretation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An expected row is absent from the database.
    #[error("entity {entity_type} with key {key} does not exist in the database")]
    EntityMissing {
        /// Entity type name.
        entity_type: String,
        /// Primary key that was looked up.
        key: Value,
    },

    /// The optimistic-lock token in memory disagrees with the database.
    #[error(
        "optimistic lock mismatch on {entity_type} {key}: local {local_lock}, database {database_lock}"
    )]
    OptimisticLockMismatch {
        /// Entity type name.
        entity_type: String,
        /// Primary key.
        key: Value,
        /// Lock value held by the caller.
        local_lock: Value,
        /// Lock value currently in the database.
        database_lock: Value,
        /// The caller's entity as submitted.
        local: Box<EntitySnapshot>,
        /// The database's current row.
        database: Box<EntitySnapshot>,
    },

    /// An insert collided with an existing primary key.
    #[error("entity {entity_type} with key {key} already exists")]
    PrimaryKeyExists {
        /// Entity type name.
        entity_type: String,
        /// The colliding key.
        key: Value,
    },

    /// The persist request or graph is not in a persistable state.
    #[error("illegal persist state: {message}")]
    IllegalPersistState {
        /// Description of the problem.
        message: String,
    },

    /// Preparing a statement failed.
    #[error("failed to prepare statement for {entity_type}: {source}")]
    PreparingStatement {
        /// Entity type the statement was for.
        entity_type: String,
        /// The store failure.
        #[source]
        source: StoreError,
    },

    /// The access controller refused an operation.
    #[error("access denied: {operation} on {entity_type} {key}: {reason}")]
    AccessDenied {
        /// Entity type name.
        entity_type: String,
        /// Primary key, `null` for unsaved entities.
        key: Value,
        /// Refused operation.
        operation: String,
        /// Reason given by the controller.
        reason: String,
    },

    /// No entity type with this name is defined.
    #[error("unknown entity type: {name}")]
    UnknownEntityType {
        /// The requested type name.
        name: String,
    },

    /// The entity type has no node with this name.
    #[error("entity type {entity_type} has no node {node}")]
    UnknownNode {
        /// Entity type name.
        entity_type: String,
        /// Node name.
        node: String,
    },

    /// The node exists but is of a different kind.
    #[error("node {node} of {entity_type} is not a {expected} node")]
    NodeKind {
        /// Entity type name.
        entity_type: String,
        /// Node name.
        node: String,
        /// The kind the operation needed.
        expected: &'static str,
    },

    /// A value was read that is not loaded and could not be fetched.
    #[error("node {node} of {entity_type} is not loaded")]
    NodeNotLoaded {
        /// Entity type name.
        entity_type: String,
        /// Node name.
        node: String,
    },

    /// The entity does not belong to this context.
    #[error("entity {id} is not in this context")]
    EntityNotInContext {
        /// Entity identifier.
        id: EntityId,
    },

    /// An entity with the same identifier or key is already in the context.
    #[error("duplicate entity {entity_type} ({detail})")]
    DuplicateEntity {
        /// Entity type name.
        entity_type: String,
        /// What collided.
        detail: String,
    },

    /// The schema definition is inconsistent.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Encoding an audit record failed.
    #[error("audit encoding failed: {message}")]
    AuditEncoding {
        /// Encoder message.
        message: String,
    },
}

impl CoreError {
    /// Creates an entity-missing error.
    pub fn entity_missing(entity_type: impl Into<String>, key: Value) -> Self {
        Self::EntityMissing {
            entity_type: entity_type.into(),
            key,
        }
    }

    /// Creates a lock-mismatch error from both sides of the conflict.
    pub fn lock_mismatch(local: EntitySnapshot, database: EntitySnapshot, lock_node: &str) -> Self {
        Self::OptimisticLockMismatch {
            entity_type: local.entity_type.clone(),
            key: local.key.clone(),
            local_lock: local.value(lock_node).cloned().unwrap_or(Value::Null),
            database_lock: database.value(lock_node).cloned().unwrap_or(Value::Null),
            local: Box::new(local),
            database: Box::new(database),
        }
    }

    /// Creates an illegal-persist-state error.
    pub fn illegal_persist_state(message: impl Into<String>) -> Self {
        Self::IllegalPersistState {
            message: message.into(),
        }
    }

    /// Creates an unknown-entity-type error.
    pub fn unknown_entity_type(name: impl Into<String>) -> Self {
        Self::UnknownEntityType { name: name.into() }
    }

    /// Creates an unknown-node error.
    pub fn unknown_node(entity_type: impl Into<String>, node: impl Into<String>) -> Self {
        Self::UnknownNode {
            entity_type: entity_type.into(),
            node: node.into(),
        }
    }

    /// Creates a node-kind error.
    pub fn node_kind(
        entity_type: impl Into<String>,
        node: impl Into<String>,
        expected: &'static str,
    ) -> Self {
        Self::NodeKind {
            entity_type: entity_type.into(),
            node: node.into(),
            expected,
        }
    }

    /// Creates an invalid-schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for failures caused by another session's concurrent work.
    ///
    /// Callers typically re-fetch and retry on these.
    #[must_use]
    pub fn is_concurrency_conflict(&self) -> bool {
        match self {
            Self::OptimisticLockMismatch { .. } | Self::EntityMissing { .. } => true,
            Self::Store(err) => err.is_lock_conflict(),
            _ => false,
        }
    }
}
