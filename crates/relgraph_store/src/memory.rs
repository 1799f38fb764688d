//! In-memory relational store for testing.

use crate::capabilities::Capabilities;
use crate::connection::Connection;
use crate::error::{StoreError, StoreResult};
use crate::row::{Row, TableDef};
use crate::statement::{RowCount, RowLock, Statement, StatementHandle};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type RowId = (String, Value);

#[derive(Debug)]
struct Table {
    def: TableDef,
    rows: BTreeMap<Value, Row>,
}

#[derive(Debug)]
struct StoreInner {
    capabilities: Capabilities,
    tables: RwLock<HashMap<String, Table>>,
    /// Row locks: row -> owning connection id.
    locks: Mutex<HashMap<RowId, u64>>,
    sequences: Mutex<HashMap<String, i64>>,
    next_connection: AtomicU64,
}

/// An in-memory relational store.
///
/// The store holds committed rows shared by every connection. Each
/// [`MemoryConnection`] keeps its own transaction overlay, so two connections
/// behave like two independent database sessions: the source of the
/// optimistic-lock conflicts the persistence engine detects.
///
/// # Example
///
/// ```rust
/// use relgraph_store::{Connection, InMemoryStore, Row, RowLock, TableDef, Value};
///
/// let store = InMemoryStore::new();
/// store.create_table(TableDef::new("items", "id").column("name")).unwrap();
/// store.seed("items", Row::new().with("id", 1).with("name", "bolt")).unwrap();
///
/// let conn = store.connect();
/// let row = conn.load_by_key("items", &Value::Integer(1), RowLock::None).unwrap();
/// assert_eq!(row.unwrap().get("name"), Some(&Value::from("bolt")));
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store with default capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    /// Creates an empty store reporting the given capabilities.
    #[must_use]
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                capabilities,
                tables: RwLock::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                sequences: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the capabilities connections report.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    /// Creates a table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableExists`] if the name is taken.
    pub fn create_table(&self, def: TableDef) -> StoreResult<()> {
        let mut tables = self.inner.tables.write();
        if tables.contains_key(&def.name) {
            return Err(StoreError::TableExists { table: def.name });
        }
        tables.insert(
            def.name.clone(),
            Table {
                def,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Opens a new connection.
    #[must_use]
    pub fn connect(&self) -> MemoryConnection {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        MemoryConnection {
            id,
            store: Arc::clone(&self.inner),
            state: Mutex::new(ConnectionState::default()),
        }
    }

    /// Inserts or replaces a committed row directly, bypassing transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is unknown, a column is undeclared, or
    /// the key column is missing.
    pub fn seed(&self, table: &str, row: Row) -> StoreResult<()> {
        let mut tables = self.inner.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
        check_columns(&t.def, row.iter().map(|(c, _)| c))?;
        let key = row
            .get(&t.def.key_column)
            .cloned()
            .ok_or_else(|| StoreError::UnknownColumn {
                table: table.to_string(),
                column: t.def.key_column.clone(),
            })?;
        t.rows.insert(key, row);
        Ok(())
    }

    /// Returns the committed row for `key`.
    #[must_use]
    pub fn row(&self, table: &str, key: &Value) -> Option<Row> {
        self.inner
            .tables
            .read()
            .get(table)
            .and_then(|t| t.rows.get(key).cloned())
    }

    /// Number of committed rows in a table.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .read()
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Number of row locks currently held by any connection.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.inner.locks.lock().len()
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Put(Row),
    Delete,
}

#[derive(Debug, Default)]
struct Overlay {
    writes: HashMap<RowId, PendingWrite>,
}

#[derive(Debug, Default)]
struct ConnectionState {
    txn: Option<Overlay>,
    statements: HashMap<u64, Statement>,
    next_statement: u64,
    closed: bool,
}

/// A session on an [`InMemoryStore`].
///
/// Without an active transaction every batch commits as soon as it runs.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    store: Arc<StoreInner>,
    state: Mutex<ConnectionState>,
}

impl MemoryConnection {
    /// Returns this connection's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Closes the connection, rolling back any open transaction.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.txn.take().is_some() {
            self.release_locks();
        }
        state.statements.clear();
        state.closed = true;
    }

    fn release_locks(&self) {
        self.store.locks.lock().retain(|_, owner| *owner != self.id);
    }

    fn effective_row(
        &self,
        overlay: Option<&Overlay>,
        tables: &HashMap<String, Table>,
        table: &str,
        key: &Value,
    ) -> StoreResult<Option<Row>> {
        let t = tables.get(table).ok_or_else(|| unknown_table(table))?;
        if let Some(write) = overlay.and_then(|o| o.writes.get(&(table.to_string(), key.clone())))
        {
            return Ok(match write {
                PendingWrite::Put(row) => Some(row.clone()),
                PendingWrite::Delete => None,
            });
        }
        Ok(t.rows.get(key).cloned())
    }

    fn acquire_lock(&self, table: &str, key: &Value, wait: Option<Duration>) -> StoreResult<()> {
        let row_id = (table.to_string(), key.clone());
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            {
                let mut locks = self.store.locks.lock();
                let held_elsewhere = matches!(locks.get(&row_id), Some(owner) if *owner != self.id);
                if !held_elsewhere {
                    locks.insert(row_id, self.id);
                    return Ok(());
                }
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Some(_) => {
                    return Err(StoreError::LockTimeout {
                        table: table.to_string(),
                        key: key.clone(),
                    })
                }
                None => {
                    return Err(StoreError::RowLocked {
                        table: table.to_string(),
                        key: key.clone(),
                    })
                }
            }
        }
    }

    fn check_not_locked(&self, table: &str, key: &Value) -> StoreResult<()> {
        let locks = self.store.locks.lock();
        match locks.get(&(table.to_string(), key.clone())) {
            Some(owner) if *owner != self.id => Err(StoreError::RowLocked {
                table: table.to_string(),
                key: key.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn claim_row(&self, table: &str, key: &Value, in_transaction: bool) -> StoreResult<()> {
        if in_transaction {
            self.acquire_lock(table, key, None)
        } else {
            self.check_not_locked(table, key)
        }
    }

    /// Executes a single parameter row against the overlay.
    ///
    /// Inside a transaction each written row is locked until commit or
    /// rollback, so a second session writing the same row fails with
    /// [`StoreError::RowLocked`].
    fn execute_row(
        &self,
        statement: &Statement,
        params: &[Value],
        overlay: &mut Overlay,
        tables: &HashMap<String, Table>,
        in_transaction: bool,
    ) -> StoreResult<u64> {
        if params.len() != statement.param_count() {
            return Err(StoreError::ParameterCount {
                expected: statement.param_count(),
                actual: params.len(),
            });
        }
        let table = statement.table();
        let def = &tables.get(table).ok_or_else(|| unknown_table(table))?.def;

        match statement {
            Statement::Insert { columns, .. } => {
                let row: Row = columns
                    .iter()
                    .cloned()
                    .zip(params.iter().cloned())
                    .collect();
                let key = row.get(&def.key_column).cloned().unwrap_or(Value::Null);
                if self
                    .effective_row(Some(overlay), tables, table, &key)?
                    .is_some()
                {
                    return Err(StoreError::UniqueViolation {
                        table: table.to_string(),
                        key,
                    });
                }
                self.claim_row(table, &key, in_transaction)?;
                overlay
                    .writes
                    .insert((table.to_string(), key), PendingWrite::Put(row));
                Ok(1)
            }
            Statement::Update {
                columns,
                lock_column,
                ..
            } => {
                let key = &params[columns.len()];
                let expected_lock = lock_column.as_ref().map(|_| &params[columns.len() + 1]);
                let Some(mut row) = self.effective_row(Some(&*overlay), tables, table, key)? else {
                    return Ok(0);
                };
                if let (Some(column), Some(expected)) = (lock_column, expected_lock) {
                    if row.get(column) != Some(expected) {
                        return Ok(0);
                    }
                }
                self.claim_row(table, key, in_transaction)?;
                for (column, value) in columns.iter().zip(params.iter()) {
                    row.set(column.clone(), value.clone());
                }
                overlay
                    .writes
                    .insert((table.to_string(), key.clone()), PendingWrite::Put(row));
                Ok(1)
            }
            Statement::Delete { lock_column, .. } => {
                let key = &params[0];
                let Some(row) = self.effective_row(Some(&*overlay), tables, table, key)? else {
                    return Ok(0);
                };
                if let Some(column) = lock_column {
                    if row.get(column) != Some(&params[1]) {
                        return Ok(0);
                    }
                }
                self.claim_row(table, key, in_transaction)?;
                overlay
                    .writes
                    .insert((table.to_string(), key.clone()), PendingWrite::Delete);
                Ok(1)
            }
        }
    }

    fn apply(&self, overlay: Overlay) {
        let mut tables = self.store.tables.write();
        for ((table, key), write) in overlay.writes {
            if let Some(t) = tables.get_mut(&table) {
                match write {
                    PendingWrite::Put(row) => {
                        t.rows.insert(key, row);
                    }
                    PendingWrite::Delete => {
                        t.rows.remove(&key);
                    }
                }
            }
        }
    }
}

impl Connection for MemoryConnection {
    fn capabilities(&self) -> Capabilities {
        self.store.capabilities
    }

    fn load_by_key(&self, table: &str, key: &Value, lock: RowLock) -> StoreResult<Option<Row>> {
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        if let RowLock::ForUpdate { wait } = lock {
            if !self.store.capabilities.supports_select_for_update {
                return Err(StoreError::unsupported("SELECT FOR UPDATE"));
            }
            if wait.is_some() && !self.store.capabilities.supports_select_for_update_wait {
                return Err(StoreError::unsupported("SELECT FOR UPDATE WAIT"));
            }
            if state.txn.is_none() {
                return Err(StoreError::NoTransaction);
            }
            self.acquire_lock(table, key, wait)?;
        }
        let tables = self.store.tables.read();
        self.effective_row(state.txn.as_ref(), &tables, table, key)
    }

    fn load_by_column(&self, table: &str, column: &str, value: &Value) -> StoreResult<Vec<Row>> {
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        let tables = self.store.tables.read();
        let t = tables.get(table).ok_or_else(|| unknown_table(table))?;
        check_columns(&t.def, std::iter::once(column))?;

        let mut rows: BTreeMap<Value, Row> = t
            .rows
            .iter()
            .filter(|(_, row)| row.get(column) == Some(value))
            .map(|(k, row)| (k.clone(), row.clone()))
            .collect();
        if let Some(overlay) = &state.txn {
            for ((written_table, key), write) in &overlay.writes {
                if written_table != table {
                    continue;
                }
                match write {
                    PendingWrite::Put(row) if row.get(column) == Some(value) => {
                        rows.insert(key.clone(), row.clone());
                    }
                    _ => {
                        rows.remove(key);
                    }
                }
            }
        }
        Ok(rows.into_values().collect())
    }

    fn prepare(&self, statement: &Statement) -> StoreResult<StatementHandle> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        {
            let tables = self.store.tables.read();
            let table = statement.table();
            let def = &tables.get(table).ok_or_else(|| unknown_table(table))?.def;
            match statement {
                Statement::Insert { columns, .. } => check_columns(def, columns.iter())?,
                Statement::Update {
                    columns,
                    key_column,
                    lock_column,
                    ..
                } => check_columns(
                    def,
                    columns
                        .iter()
                        .chain(std::iter::once(key_column))
                        .chain(lock_column.iter()),
                )?,
                Statement::Delete {
                    key_column,
                    lock_column,
                    ..
                } => check_columns(def, std::iter::once(key_column).chain(lock_column.iter()))?,
            }
        }
        state.next_statement += 1;
        let handle = StatementHandle(state.next_statement);
        state.statements.insert(handle.0, statement.clone());
        tracing::trace!(connection = self.id, %handle, table = statement.table(), "prepared statement");
        Ok(handle)
    }

    fn execute_batch(
        &self,
        handle: StatementHandle,
        params: &[Vec<Value>],
    ) -> StoreResult<Vec<RowCount>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        let statement = state
            .statements
            .get(&handle.0)
            .cloned()
            .ok_or(StoreError::UnknownStatement(handle.0))?;
        let report_counts = self.store.capabilities.supports_batch_update_counts;

        let autocommit = state.txn.is_none();
        let mut scratch = Overlay::default();
        let mut counts = Vec::with_capacity(params.len());
        let mut failure = None;
        {
            let tables = self.store.tables.read();
            let overlay = match state.txn.as_mut() {
                Some(overlay) => overlay,
                None => &mut scratch,
            };
            for (index, row) in params.iter().enumerate() {
                match self.execute_row(&statement, row, overlay, &tables, !autocommit) {
                    Ok(n) => counts.push(if report_counts {
                        RowCount::Affected(n)
                    } else {
                        RowCount::Unknown
                    }),
                    Err(e) => {
                        failure = Some((index, e));
                        break;
                    }
                }
            }
        }
        if autocommit {
            self.apply(scratch);
        }
        match failure {
            Some((index, source)) => Err(StoreError::BatchFailed {
                index,
                counts,
                source: Box::new(source),
            }),
            None => Ok(counts),
        }
    }

    fn close_statement(&self, handle: StatementHandle) -> StoreResult<()> {
        let mut state = self.state.lock();
        state
            .statements
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(StoreError::UnknownStatement(handle.0))
    }

    fn open_statements(&self) -> usize {
        self.state.lock().statements.len()
    }

    fn next_sequence_value(&self, sequence: &str) -> StoreResult<i64> {
        if self.state.lock().closed {
            return Err(StoreError::Closed);
        }
        let mut sequences = self.store.sequences.lock();
        let next = sequences.entry(sequence.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    fn begin(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        if state.txn.is_some() {
            return Err(StoreError::TransactionActive);
        }
        state.txn = Some(Overlay::default());
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        let overlay = state.txn.take().ok_or(StoreError::NoTransaction)?;
        self.apply(overlay);
        self.release_locks();
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.txn.take().ok_or(StoreError::NoTransaction)?;
        self.release_locks();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.state.lock().txn.is_some()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release_locks();
    }
}

fn unknown_table(table: &str) -> StoreError {
    StoreError::UnknownTable {
        table: table.to_string(),
    }
}

fn check_columns<S: AsRef<str>>(
    def: &TableDef,
    columns: impl Iterator<Item = S>,
) -> StoreResult<()> {
    for column in columns {
        if !def.has_column(column.as_ref()) {
            return Err(StoreError::UnknownColumn {
                table: def.name.clone(),
                column: column.as_ref().to_string(),
            });
        }
    }
    Ok(())
}
