//! Per-type prepared statements.

use super::Operation;
use crate::error::{CoreError, CoreResult};
use crate::schema::EntityType;
use relgraph_store::{Connection, Statement, StatementHandle, Value};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Where a statement column's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// A persistent node of the entity.
    Node(String),
    /// The entity's concrete type name.
    Discriminator,
}

/// A prepared statement and the layout of its column parameters.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Store handle.
    pub handle: StatementHandle,
    /// The statement that was prepared.
    pub statement: Statement,
    /// Column parameters in order.
    ///
    /// Update statements take the key and then the expected lock after
    /// these; delete statements take only the key and lock.
    pub columns: Vec<ColumnSource>,
}

impl PreparedStatement {
    /// Column parameters for one entity.
    pub fn bind(&self, entity_type: &EntityType, value_of: impl Fn(&str) -> Value) -> Vec<Value> {
        self.columns
            .iter()
            .map(|source| match source {
                ColumnSource::Node(node) => value_of(node),
                ColumnSource::Discriminator => Value::Text(entity_type.name.clone()),
            })
            .collect()
    }
}

/// Statements prepared during one persist call, keyed by type and
/// operation.
///
/// Every statement is closed when the cache is dropped.
pub struct PreparedStatementCache<'c> {
    connection: &'c dyn Connection,
    statements: HashMap<(String, Operation), PreparedStatement>,
}

impl<'c> PreparedStatementCache<'c> {
    /// Creates an empty cache on `connection`.
    #[must_use]
    pub fn new(connection: &'c dyn Connection) -> Self {
        Self {
            connection,
            statements: HashMap::new(),
        }
    }

    /// Returns the statement for `operation` on `entity_type`, preparing it
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PreparingStatement`] if the store rejects it.
    pub fn get_or_prepare(
        &mut self,
        entity_type: &EntityType,
        operation: Operation,
    ) -> CoreResult<&PreparedStatement> {
        let cache_key = (entity_type.name.clone(), operation);
        if !self.statements.contains_key(&cache_key) {
            let (statement, columns) = layout(entity_type, operation);
            let handle =
                self.connection
                    .prepare(&statement)
                    .map_err(|source| CoreError::PreparingStatement {
                        entity_type: entity_type.name.clone(),
                        source,
                    })?;
            trace!(entity_type = %entity_type.name, %operation, %handle, "prepared");
            self.statements.insert(
                cache_key.clone(),
                PreparedStatement {
                    handle,
                    statement,
                    columns,
                },
            );
        }
        self.statements
            .get(&cache_key)
            .ok_or_else(|| CoreError::invalid_operation("statement cache lost an entry"))
    }

    /// Number of open statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Returns true if nothing is prepared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Closes every statement.
    ///
    /// # Errors
    ///
    /// Returns the first close failure; the remaining statements are still
    /// closed.
    pub fn close_all(&mut self) -> CoreResult<()> {
        let mut first_error = None;
        for (_, prepared) in self.statements.drain() {
            if let Err(err) = self.connection.close_statement(prepared.handle) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), |err| Err(err.into()))
    }
}

impl Drop for PreparedStatementCache<'_> {
    fn drop(&mut self) {
        if self.statements.is_empty() {
            return;
        }
        let count = self.statements.len();
        if let Err(err) = self.close_all() {
            warn!(error = %err, "failed to close prepared statements");
        } else {
            trace!(count, "closed prepared statements");
        }
    }
}

fn layout(entity_type: &EntityType, operation: Operation) -> (Statement, Vec<ColumnSource>) {
    let table = entity_type.table.clone();
    let key_column = entity_type.key_column().to_string();
    let lock_column = entity_type.lock_column().map(str::to_string);

    let mut sources = Vec::new();
    if operation == Operation::Create {
        sources.push(ColumnSource::Node(entity_type.key_node.clone()));
    }
    if operation != Operation::Delete {
        sources.extend(
            entity_type
                .persistent_nodes()
                .filter(|(node, _)| *node != entity_type.key_node)
                .map(|(node, _)| ColumnSource::Node(node.to_string())),
        );
        if entity_type.discriminator.is_some() {
            sources.push(ColumnSource::Discriminator);
        }
    }

    let columns: Vec<String> = sources
        .iter()
        .map(|source| match source {
            ColumnSource::Node(node) => entity_type
                .column_of(node)
                .unwrap_or(node.as_str())
                .to_string(),
            ColumnSource::Discriminator => entity_type.discriminator.clone().unwrap_or_default(),
        })
        .collect();

    let statement = match operation {
        Operation::Create => Statement::Insert { table, columns },
        Operation::Update => Statement::Update {
            table,
            columns,
            key_column,
            lock_column,
        },
        Operation::Delete => Statement::Delete {
            table,
            key_column,
            lock_column,
        },
    };
    (statement, sources)
}
