//! The connection trait consumed by the persistence engine.

use crate::capabilities::Capabilities;
use crate::error::StoreResult;
use crate::row::Row;
use crate::statement::{RowCount, RowLock, Statement, StatementHandle};
use crate::value::Value;

/// A connection to a relational store.
///
/// A connection carries at most one transaction. Reads issued while a
/// transaction is active observe that transaction's own uncommitted writes,
/// so a secondary context sharing the connection shares the transaction.
///
/// # Invariants
///
/// - `execute_batch` returns exactly one [`RowCount`] per parameter row, or
///   fails with [`crate::StoreError::BatchFailed`] naming the failing row
/// - prepared statements stay open until `close_statement`
/// - `rollback` discards every write since `begin` and releases row locks
pub trait Connection: Send + Sync {
    /// Returns the engine's capability descriptor.
    fn capabilities(&self) -> Capabilities;

    /// Loads a single row by primary key.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is unknown, or if a requested row lock
    /// cannot be acquired.
    fn load_by_key(&self, table: &str, key: &Value, lock: RowLock) -> StoreResult<Option<Row>>;

    /// Loads every row whose `column` equals `value`, ordered by primary key.
    ///
    /// # Errors
    ///
    /// Returns an error if the table or column is unknown.
    fn load_by_column(&self, table: &str, column: &str, value: &Value) -> StoreResult<Vec<Row>>;

    /// Prepares a statement for batch execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement references unknown tables or columns.
    fn prepare(&self, statement: &Statement) -> StoreResult<StatementHandle>;

    /// Executes a prepared statement once per parameter row.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::BatchFailed`] if a row fails; rows before
    /// the failing index have been applied.
    fn execute_batch(
        &self,
        handle: StatementHandle,
        params: &[Vec<Value>],
    ) -> StoreResult<Vec<RowCount>>;

    /// Releases a prepared statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not open.
    fn close_statement(&self, handle: StatementHandle) -> StoreResult<()>;

    /// Number of statements currently prepared and not closed.
    fn open_statements(&self) -> usize;

    /// Returns the next value of a named sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    fn next_sequence_value(&self, sequence: &str) -> StoreResult<i64>;

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::TransactionActive`] if one is already open.
    fn begin(&self) -> StoreResult<()>;

    /// Commits the active transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::NoTransaction`] if none is open.
    fn commit(&self) -> StoreResult<()>;

    /// Rolls back the active transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::NoTransaction`] if none is open.
    fn rollback(&self) -> StoreResult<()>;

    /// Returns true if a transaction is active.
    fn in_transaction(&self) -> bool;
}
