//! Structural write statements.
//!
//! The store never sees statement text. A statement names the table and the
//! columns it binds, and each parameter row supplies values in that order.

use std::fmt;
use std::time::Duration;

/// A parameterized write statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Statement {
    /// Inserts one row per parameter row. Parameters follow `columns`.
    Insert {
        /// Target table.
        table: String,
        /// Bound columns, including the key column.
        columns: Vec<String>,
    },
    /// Updates the row matching the key (and lock, when present).
    ///
    /// Parameters: one value per entry of `columns`, then the key, then the
    /// expected lock value if `lock_column` is set.
    Update {
        /// Target table.
        table: String,
        /// Columns to assign.
        columns: Vec<String>,
        /// Primary-key column used to match the row.
        key_column: String,
        /// Optimistic-lock column that must match the expected value.
        lock_column: Option<String>,
    },
    /// Deletes the row matching the key (and lock, when present).
    ///
    /// Parameters: the key, then the expected lock value if `lock_column` is set.
    Delete {
        /// Target table.
        table: String,
        /// Primary-key column used to match the row.
        key_column: String,
        /// Optimistic-lock column that must match the expected value.
        lock_column: Option<String>,
    },
}

impl Statement {
    /// Returns the table the statement writes to.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    /// Number of parameters each row must supply.
    #[must_use]
    pub fn param_count(&self) -> usize {
        match self {
            Statement::Insert { columns, .. } => columns.len(),
            Statement::Update {
                columns,
                lock_column,
                ..
            } => columns.len() + 1 + usize::from(lock_column.is_some()),
            Statement::Delete { lock_column, .. } => 1 + usize::from(lock_column.is_some()),
        }
    }
}

/// Opaque handle to a statement prepared on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementHandle(pub u64);

impl fmt::Display for StatementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt:{}", self.0)
    }
}

/// Per-row result of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCount {
    /// The number of rows the statement affected.
    Affected(u64),
    /// The store executed the row but does not report counts.
    Unknown,
}

impl RowCount {
    /// Returns true if the row is known to have affected nothing.
    #[must_use]
    pub fn is_noop(self) -> bool {
        matches!(self, RowCount::Affected(0))
    }
}

/// Row locking requested while reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowLock {
    /// Plain read.
    #[default]
    None,
    /// `SELECT ... FOR UPDATE`, optionally waiting up to `wait` for the lock.
    ///
    /// Without a wait the read fails immediately if another connection holds
    /// the lock.
    ForUpdate {
        /// Maximum time to wait for a conflicting lock.
        wait: Option<Duration>,
    },
}
