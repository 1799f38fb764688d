//! Error types for store operations.

use crate::value::Value;
use crate::RowCount;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to a relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named table does not exist.
    #[error("unknown table: {table}")]
    UnknownTable {
        /// Table name.
        table: String,
    },

    /// A column is not part of the table definition.
    #[error("unknown column {column} in table {table}")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A table with the same name already exists.
    #[error("table already exists: {table}")]
    TableExists {
        /// Table name.
        table: String,
    },

    /// An insert collided with an existing primary key.
    #[error("unique constraint violated in {table} for key {key}")]
    UniqueViolation {
        /// Table name.
        table: String,
        /// The colliding key.
        key: Value,
    },

    /// A batch failed part-way through.
    ///
    /// `counts` holds the results of the rows that executed before `index`.
    #[error("batch failed at row {index}: {source}")]
    BatchFailed {
        /// Index of the failing row in the batch.
        index: usize,
        /// Counts of the rows that completed before the failure.
        counts: Vec<RowCount>,
        /// The underlying failure.
        #[source]
        source: Box<StoreError>,
    },

    /// A row is locked by another connection.
    #[error("row {key} in {table} is locked by another connection")]
    RowLocked {
        /// Table name.
        table: String,
        /// Locked key.
        key: Value,
    },

    /// Waiting for a row lock timed out.
    #[error("timed out waiting for lock on {key} in {table}")]
    LockTimeout {
        /// Table name.
        table: String,
        /// Locked key.
        key: Value,
    },

    /// The requested feature is not supported by this store.
    #[error("unsupported operation: {message}")]
    Unsupported {
        /// What was requested.
        message: String,
    },

    /// The statement handle is not open on this connection.
    #[error("unknown statement handle: {0}")]
    UnknownStatement(u64),

    /// A parameter row does not match the statement shape.
    #[error("statement expects {expected} parameters, got {actual}")]
    ParameterCount {
        /// Parameters the statement expects.
        expected: usize,
        /// Parameters supplied.
        actual: usize,
    },

    /// A transaction is required but none is active.
    #[error("no active transaction")]
    NoTransaction,

    /// A transaction is already active on this connection.
    #[error("transaction already active")]
    TransactionActive,

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,
}

impl StoreError {
    /// Creates an unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Returns the failure behind a [`StoreError::BatchFailed`], or `self`.
    #[must_use]
    pub fn root_cause(&self) -> &StoreError {
        match self {
            Self::BatchFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns true if this error (or its batch cause) is a unique violation.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self.root_cause(), Self::UniqueViolation { .. })
    }

    /// Returns true if another session holds the row.
    #[must_use]
    pub fn is_lock_conflict(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::RowLocked { .. } | Self::LockTimeout { .. }
        )
    }
}
