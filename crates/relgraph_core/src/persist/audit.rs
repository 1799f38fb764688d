//! Audit diffs and sinks.
//!
//! The persister computes one [`AuditInformation`] per persist call: for each
//! created, updated or deleted entity the list of node values that differ
//! between the database and the caller's graph. The same diff decides which
//! updates actually touch their row, and is handed to an [`AuditSink`] once
//! the writes succeeded.

use super::Operation;
use crate::context::EntityContext;
use crate::entity::{Entity, EntityId, EntitySnapshot};
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use relgraph_store::{Connection, Statement, TableDef, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// One node's value before and after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Node name.
    pub node: String,
    /// Database value.
    pub old: Value,
    /// Value being written.
    pub new: Value,
}

/// Audit entry for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Entity identity in the persisting context.
    pub entity_id: EntityId,
    /// Entity type name.
    pub entity_type: String,
    /// Primary key; null for created entities until keys are assigned.
    pub key: Value,
    /// What happens to the row.
    pub operation: Operation,
    /// Changed nodes in name order.
    pub changes: Vec<Change>,
}

/// The diff of one persist call. Built once, then read-only.
#[derive(Debug, Clone, Default)]
pub struct AuditInformation {
    records: Vec<AuditRecord>,
    index: HashMap<EntityId, usize>,
}

impl AuditInformation {
    /// Diffs the working graph against the database snapshots.
    ///
    /// Created entities diff against nothing, updated ones against their
    /// snapshot, deleted ones report every snapshot value going to null.
    /// Updated entities without differences get no record.
    pub(crate) fn compute(
        context: &EntityContext,
        create: &[EntityId],
        update: &[EntityId],
        delete: &[EntityId],
        snapshot: impl Fn(EntityId) -> Option<EntitySnapshot>,
    ) -> CoreResult<Self> {
        let mut records = Vec::new();

        for &id in create {
            let entity = context.get(id)?;
            let key_node = &entity.entity_type().key_node;
            let pending = pending_references(entity);
            let local = entity.snapshot();
            let changes = local
                .values
                .into_iter()
                .filter(|(node, value)| {
                    node != key_node && (!value.is_null() || pending.contains(node.as_str()))
                })
                .map(|(node, new)| Change {
                    node,
                    old: Value::Null,
                    new,
                })
                .collect();
            records.push(record(id, local.entity_type, local.key, Operation::Create, changes));
        }

        for &id in update {
            let entity = context.get(id)?;
            let pending = pending_references(entity);
            let local = entity.snapshot();
            let Some(database) = snapshot(id) else {
                continue;
            };
            let changes: Vec<Change> = local
                .values
                .iter()
                .filter_map(|(node, new)| {
                    let old = database.value(node).cloned().unwrap_or(Value::Null);
                    (old != *new || pending.contains(node.as_str())).then(|| Change {
                        node: node.clone(),
                        old,
                        new: new.clone(),
                    })
                })
                .collect();
            if !changes.is_empty() {
                records.push(record(id, local.entity_type, local.key, Operation::Update, changes));
            }
        }

        for &id in delete {
            let entity = context.get(id)?;
            let Some(database) = snapshot(id) else {
                continue;
            };
            let key_node = &entity.entity_type().key_node;
            let changes = database
                .values
                .iter()
                .filter(|(node, value)| *node != key_node && !value.is_null())
                .map(|(node, old)| Change {
                    node: node.clone(),
                    old: old.clone(),
                    new: Value::Null,
                })
                .collect();
            records.push(record(
                id,
                database.entity_type.clone(),
                database.key.clone(),
                Operation::Delete,
                changes,
            ));
        }

        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.entity_id, i))
            .collect();
        debug!(records = records.len(), "audit computed");
        Ok(Self { records, index })
    }

    /// The record of an entity, if it has one.
    #[must_use]
    pub fn record(&self, id: EntityId) -> Option<&AuditRecord> {
        self.index.get(&id).map(|i| &self.records[*i])
    }

    /// Returns true if the entity has changes to write.
    #[must_use]
    pub fn has_changes(&self, id: EntityId) -> bool {
        self.record(id).is_some_and(|r| !r.changes.is_empty())
    }

    /// All records.
    #[must_use]
    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The records as they stand after keys were assigned.
    ///
    /// Created and updated records take their key and new values from
    /// `current`, so foreign keys to entities created in the same call are
    /// filled in.
    pub(crate) fn finalized(
        &self,
        current: impl Fn(EntityId) -> Option<EntitySnapshot>,
    ) -> Vec<AuditRecord> {
        self.records
            .iter()
            .map(|r| {
                let mut r = r.clone();
                if r.operation == Operation::Delete {
                    return r;
                }
                if let Some(snapshot) = current(r.entity_id) {
                    if r.key.is_null() {
                        r.key = snapshot.key.clone();
                    }
                    for change in &mut r.changes {
                        if let Some(value) = snapshot.value(&change.node) {
                            change.new = value.clone();
                        }
                    }
                }
                r
            })
            .collect()
    }
}

/// Reference nodes pointing at an entity that has no key yet.
fn pending_references(entity: &Entity) -> HashSet<&str> {
    entity
        .nodes()
        .filter(|(_, node)| {
            node.as_reference()
                .is_some_and(|r| r.target().is_some() && r.key().is_none())
        })
        .map(|(name, _)| name)
        .collect()
}

fn record(
    entity_id: EntityId,
    entity_type: String,
    key: Value,
    operation: Operation,
    changes: Vec<Change>,
) -> AuditRecord {
    AuditRecord {
        entity_id,
        entity_type,
        key,
        operation,
        changes,
    }
}

/// Receives audit records after the writes of a persist call.
///
/// The sink runs inside the persist transaction; a failure rolls everything
/// back.
pub trait AuditSink: Send + Sync {
    /// Writes the records.
    ///
    /// # Errors
    ///
    /// Any error aborts the persist call.
    fn write(&self, connection: &dyn Connection, records: &[AuditRecord]) -> CoreResult<()>;
}

/// Discards audit records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuditSink;

impl AuditSink for NoAuditSink {
    fn write(&self, _connection: &dyn Connection, _records: &[AuditRecord]) -> CoreResult<()> {
        Ok(())
    }
}

/// Keeps audit records in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl CollectingAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records collected so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Removes and returns the collected records.
    pub fn take(&self) -> Vec<AuditRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}

impl AuditSink for CollectingAuditSink {
    fn write(&self, _connection: &dyn Connection, records: &[AuditRecord]) -> CoreResult<()> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

/// Writes one row per record into an audit table.
///
/// Columns: `id` (from the `<table>_seq` sequence), `entity_type`,
/// `entity_key`, `operation`, and `changes` as CBOR bytes.
#[derive(Debug, Clone)]
pub struct TableAuditSink {
    table: String,
}

impl TableAuditSink {
    const COLUMNS: [&'static str; 5] = ["id", "entity_type", "entity_key", "operation", "changes"];

    /// Creates a sink writing to `table`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Definition of the audit table.
    #[must_use]
    pub fn table_def(&self) -> TableDef {
        Self::COLUMNS
            .iter()
            .skip(1)
            .fold(TableDef::new(&self.table, Self::COLUMNS[0]), |def, c| {
                def.column(*c)
            })
    }

    /// Decodes the `changes` column of an audit row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditEncoding`] for malformed bytes.
    pub fn decode_changes(bytes: &[u8]) -> CoreResult<Vec<Change>> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::AuditEncoding {
            message: e.to_string(),
        })
    }

    fn encode_changes(changes: &[Change]) -> CoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(changes, &mut bytes).map_err(|e| CoreError::AuditEncoding {
            message: e.to_string(),
        })?;
        Ok(bytes)
    }
}

impl AuditSink for TableAuditSink {
    fn write(&self, connection: &dyn Connection, records: &[AuditRecord]) -> CoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sequence = format!("{}_seq", self.table);
        let mut params = Vec::with_capacity(records.len());
        for record in records {
            params.push(vec![
                Value::Integer(connection.next_sequence_value(&sequence)?),
                Value::Text(record.entity_type.clone()),
                record.key.clone(),
                Value::Text(record.operation.to_string()),
                Value::Bytes(Self::encode_changes(&record.changes)?),
            ]);
        }

        let handle = connection.prepare(&Statement::Insert {
            table: self.table.clone(),
            columns: Self::COLUMNS.iter().map(|c| (*c).to_string()).collect(),
        })?;
        let result = connection.execute_batch(handle, &params);
        connection.close_statement(handle)?;
        result?;
        debug!(table = %self.table, rows = records.len(), "audit written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_store::InMemoryStore;

    fn sample() -> AuditRecord {
        AuditRecord {
            entity_id: EntityId::new(),
            entity_type: "Order".into(),
            key: Value::Integer(1),
            operation: Operation::Update,
            changes: vec![Change {
                node: "status".into(),
                old: Value::from("open"),
                new: Value::from("shipped"),
            }],
        }
    }

    #[test]
    fn collecting_sink_shares_buffer() {
        let sink = CollectingAuditSink::new();
        let clone = sink.clone();
        let store = InMemoryStore::new();
        let conn = store.connect();
        clone.write(&conn, &[sample()]).unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.take().len(), 1);
        assert!(sink.records().is_empty());
    }

    #[test]
    fn table_sink_writes_cbor_changes() {
        let store = InMemoryStore::new();
        let sink = TableAuditSink::new("audit_log");
        store.create_table(sink.table_def()).unwrap();
        let conn = store.connect();

        let record = sample();
        sink.write(&conn, &[record.clone()]).unwrap();

        let row = store.row("audit_log", &Value::Integer(1)).unwrap();
        assert_eq!(row.get("operation"), Some(&Value::from("update")));
        let bytes = row.get("changes").and_then(Value::as_bytes).unwrap();
        assert_eq!(TableAuditSink::decode_changes(bytes).unwrap(), record.changes);
        assert_eq!(conn.open_statements(), 0);
    }

    #[test]
    fn finalized_fills_assigned_keys() {
        let mut record = sample();
        record.key = Value::Null;
        let id = record.entity_id;
        let info = AuditInformation {
            index: [(id, 0)].into_iter().collect(),
            records: vec![record],
        };
        let records = info.finalized(|entity_id| {
            Some(EntitySnapshot {
                entity_type: "Order".into(),
                key: Value::Integer(9),
                values: [(String::from("status"), Value::from("closed"))]
                    .into_iter()
                    .collect(),
            })
            .filter(|_| entity_id == id)
        });
        assert_eq!(records[0].key, Value::Integer(9));
        assert_eq!(records[0].changes[0].new, Value::from("closed"));
        assert!(info.record(id).unwrap().key.is_null());
        assert!(info.has_changes(id));
    }
}
