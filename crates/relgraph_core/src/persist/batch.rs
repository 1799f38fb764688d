//! Batched statement execution with per-row failure classification.

use super::statements::{PreparedStatement, PreparedStatementCache};
use super::Operation;
use crate::entity::{EntityId, EntitySnapshot};
use crate::error::{CoreError, CoreResult};
use crate::schema::EntityType;
use relgraph_store::{Connection, RowCount, RowLock, StoreError, Value};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One row waiting to be executed.
#[derive(Debug, Clone)]
pub struct PendingRow {
    /// Entity the row belongs to.
    pub id: EntityId,
    /// Concrete entity type.
    pub entity_type: Arc<EntityType>,
    /// Primary key of the row.
    pub key: Value,
    /// The caller's entity, with the lock value the statement expects.
    pub local: EntitySnapshot,
    /// Statement parameters.
    pub params: Vec<Value>,
}

/// What the executed batches did, row by row.
///
/// Every row that affected nothing is classified on its own, so one stale
/// row never hides the outcome of the rows batched with it.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Physical batches executed.
    pub batches: usize,
    /// Rows that affected the database, in execution order.
    pub executed: Vec<EntityId>,
    /// Rows that affected nothing, with the reason found on reload.
    pub failures: Vec<(EntityId, CoreError)>,
}

impl BatchOutcome {
    /// Returns true if no row failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Rows sent to the store, executed or failed.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.executed.len() + self.failures.len()
    }

    /// The executed rows, or the first failure.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failed row.
    pub fn into_result(self) -> CoreResult<Vec<EntityId>> {
        match self.failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.executed),
        }
    }
}

/// Groups adjacent rows of the same type and operation into batches.
///
/// A change of type or operation, or reaching the batch size limit, flushes
/// the pending rows. A row that affects nothing is reloaded to tell a
/// missing row from a stale lock, and recorded as a failure in the
/// [`BatchOutcome`].
pub struct BatchExecuter<'c> {
    connection: &'c dyn Connection,
    statements: PreparedStatementCache<'c>,
    max_batch_size: usize,
    pending: Vec<PendingRow>,
    pending_kind: Option<(String, Operation)>,
    outcome: BatchOutcome,
}

impl<'c> BatchExecuter<'c> {
    /// Creates an executer with its own statement cache.
    #[must_use]
    pub fn new(connection: &'c dyn Connection, max_batch_size: usize) -> Self {
        Self {
            connection,
            statements: PreparedStatementCache::new(connection),
            max_batch_size: max_batch_size.max(1),
            pending: Vec::new(),
            pending_kind: None,
            outcome: BatchOutcome::default(),
        }
    }

    /// The statement rows of `entity_type` are bound against.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PreparingStatement`] if preparing fails.
    pub fn statement(
        &mut self,
        entity_type: &EntityType,
        operation: Operation,
    ) -> CoreResult<&PreparedStatement> {
        self.statements.get_or_prepare(entity_type, operation)
    }

    /// Queues a row, flushing first if it starts a new batch.
    ///
    /// # Errors
    ///
    /// Returns the store failure of a flushed batch.
    pub fn push(&mut self, operation: Operation, row: PendingRow) -> CoreResult<()> {
        let kind = (row.entity_type.name.clone(), operation);
        if self.pending_kind.as_ref() != Some(&kind) || self.pending.len() >= self.max_batch_size
        {
            self.flush()?;
            self.pending_kind = Some(kind);
        }
        self.pending.push(row);
        Ok(())
    }

    /// Executes the pending rows as one batch.
    ///
    /// Rows that affected nothing are classified as
    /// [`CoreError::EntityMissing`] or [`CoreError::OptimisticLockMismatch`]
    /// and recorded in the outcome; the other rows of the batch count as
    /// executed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PrimaryKeyExists`] for a colliding insert, and
    /// store failures of the batch or of a reload.
    pub fn flush(&mut self) -> CoreResult<()> {
        let Some((_, operation)) = self.pending_kind.clone() else {
            return Ok(());
        };
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.pending);
        let entity_type = Arc::clone(&rows[0].entity_type);
        let handle = self.statements.get_or_prepare(&entity_type, operation)?.handle;
        let params: Vec<Vec<Value>> = rows.iter().map(|r| r.params.clone()).collect();

        debug!(
            entity_type = %entity_type.name,
            %operation,
            rows = rows.len(),
            "executing batch"
        );
        self.outcome.batches += 1;

        let counts = match self.connection.execute_batch(handle, &params) {
            Ok(counts) => counts,
            Err(err) => return Err(self.classify_failure(operation, &rows, err)),
        };
        for (row, count) in rows.iter().zip(counts) {
            if count.is_noop() {
                let reason = self.classify_noop(row)?;
                warn!(id = %row.id, entity_type = %entity_type.name, key = %row.key, %reason, "row failed");
                self.outcome.failures.push((row.id, reason));
                continue;
            }
            if count == RowCount::Unknown {
                trace!(id = %row.id, "row count not reported");
            }
            self.outcome.executed.push(row.id);
        }
        Ok(())
    }

    /// Returns true once a flushed row has failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.outcome.is_clean()
    }

    /// Flushes the remaining rows and closes every statement.
    ///
    /// Rows still pending after a failure are dropped unexecuted.
    ///
    /// # Errors
    ///
    /// Same as [`BatchExecuter::flush`], plus statement close failures.
    pub fn finish(mut self) -> CoreResult<BatchOutcome> {
        if self.has_failures() {
            self.pending.clear();
        } else {
            self.flush()?;
        }
        self.statements.close_all()?;
        Ok(std::mem::take(&mut self.outcome))
    }

    /// Outcome of the batches flushed so far.
    #[must_use]
    pub fn outcome(&self) -> &BatchOutcome {
        &self.outcome
    }

    /// Explains a row that matched nothing by reading it again.
    fn classify_noop(&self, row: &PendingRow) -> CoreResult<CoreError> {
        let entity_type = &row.entity_type;
        debug!(id = %row.id, entity_type = %entity_type.name, key = %row.key, "row affected nothing, reloading");
        let current = self
            .connection
            .load_by_key(&entity_type.table, &row.key, RowLock::None)?;
        let Some(current) = current else {
            return Ok(CoreError::entity_missing(&entity_type.name, row.key.clone()));
        };
        let database = EntitySnapshot::from_row(entity_type, &current);
        if let Some(lock_node) = &entity_type.lock_node {
            if database.value(lock_node) != row.local.value(lock_node) {
                return Ok(CoreError::lock_mismatch(
                    row.local.clone(),
                    database,
                    lock_node,
                ));
            }
        }
        Ok(CoreError::illegal_persist_state(format!(
            "no rows affected for {} {}",
            entity_type.name, row.key
        )))
    }

    fn classify_failure(
        &self,
        operation: Operation,
        rows: &[PendingRow],
        err: StoreError,
    ) -> CoreError {
        if operation != Operation::Create || !err.is_unique_violation() {
            return err.into();
        }
        let index = match &err {
            StoreError::BatchFailed { index, .. } => *index,
            _ => 0,
        };
        let Some(row) = rows.get(index) else {
            return err.into();
        };
        match self
            .connection
            .load_by_key(&row.entity_type.table, &row.key, RowLock::None)
        {
            Ok(Some(_)) => CoreError::PrimaryKeyExists {
                entity_type: row.entity_type.name.clone(),
                key: row.key.clone(),
            },
            Ok(None) => err.into(),
            Err(reload) => reload.into(),
        }
    }
}
