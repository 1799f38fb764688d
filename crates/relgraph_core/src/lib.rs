//! # relgraph Core
//!
//! An entity graph with identity mapping and lazy loading, and a persistence
//! engine that writes its changes back with optimistic locking.
//!
//! This crate provides:
//! - [`Schema`] - entity types with attributes, references, collections and
//!   single-table inheritance
//! - [`EntityContext`] - identity map, lazy fetching and reverse references
//! - [`Persister`] - the staged persist algorithm: analysis, validation,
//!   lock propagation, batched writes, audit and reconciliation
//!
//! ## Example
//!
//! ```rust
//! use relgraph_core::{Config, EntityContext, EntityTypeDef, PersistRequest, Schema};
//! use relgraph_store::{Connection, InMemoryStore, Value};
//! use std::sync::Arc;
//!
//! let schema = Arc::new(
//!     Schema::builder()
//!         .entity(EntityTypeDef::new("Customer", "customers").lock("version").attribute("name"))
//!         .build()
//!         .unwrap(),
//! );
//! let store = InMemoryStore::new();
//! for table in schema.table_definitions() {
//!     store.create_table(table).unwrap();
//! }
//!
//! let connection: Arc<dyn Connection> = Arc::new(store.connect());
//! let mut context = EntityContext::new(schema, connection, Config::default());
//! let customer = context.new_model("Customer").unwrap();
//! context.set_value(customer.id(), "name", Value::from("Ada")).unwrap();
//! context.persist(&PersistRequest::new().save(&customer)).unwrap();
//!
//! let key = context.key_of(customer.id()).unwrap().unwrap();
//! assert_eq!(store.row("customers", &key).unwrap().get("version"), Some(&Value::Integer(1)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod entity;
mod error;
mod persist;
mod schema;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use context::{ContextEvent, EntityContext, EntityHandle, InternalMode, Mode, RefSource, Removal};
pub use entity::{
    CollectionNode, Entity, EntityId, EntitySnapshot, EntityState, Node, ReferenceNode, Slot,
    ValueNode,
};
pub use error::{CoreError, CoreResult, PersistFailure};
pub use persist::{
    next_lock_value, AccessController, AllowAll, AsEntityId, AuditInformation, AuditRecord,
    AuditSink, BatchExecuter, BatchOutcome, Change, CollectingAuditSink, ColumnSource,
    DatabaseDataSet, DependencyGraph, GraphAnalyser, LockPropagation, NoAuditSink, Operation,
    OperationGroup, OperationGroups, OwnershipGraph, PendingRow, PersistAnalyser, PersistObserver,
    PersistReport, PersistRequest, Persister, PreparedStatement, PreparedStatementCache,
    SequenceGenerator, Stage, StoreSequenceGenerator, TableAuditSink, TransactionScope,
};
pub use schema::{EntityType, EntityTypeDef, NodeDef, Schema, SchemaBuilder};
