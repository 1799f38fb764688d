//! # relgraph Store
//!
//! The relational store boundary consumed by the relgraph persistence engine.
//!
//! The engine never renders SQL. It talks to a store through the
//! [`Connection`] trait using structural [`Statement`]s, single-row loads by
//! primary key, and foreign-key lookups.
//!
//! ## Design Principles
//!
//! - A connection carries at most one transaction; reads see its writes
//! - Batches report a [`RowCount`] per row, or [`RowCount::Unknown`] on
//!   engines without per-row counts
//! - [`Capabilities`] tell the engine which conflict-detection strategy to use
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - shared committed tables with per-connection
//!   transaction overlays, row locks and sequences
//!
//! ## Example
//!
//! ```rust
//! use relgraph_store::{Connection, InMemoryStore, RowCount, Statement, TableDef, Value};
//!
//! let store = InMemoryStore::new();
//! store.create_table(TableDef::new("items", "id").column("name")).unwrap();
//!
//! let conn = store.connect();
//! let insert = conn
//!     .prepare(&Statement::Insert {
//!         table: "items".into(),
//!         columns: vec!["id".into(), "name".into()],
//!     })
//!     .unwrap();
//! let counts = conn
//!     .execute_batch(insert, &[vec![Value::Integer(1), Value::from("bolt")]])
//!     .unwrap();
//! assert_eq!(counts, vec![RowCount::Affected(1)]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capabilities;
mod connection;
mod error;
mod memory;
mod row;
mod statement;
mod value;

pub use capabilities::Capabilities;
pub use connection::Connection;
pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryStore, MemoryConnection};
pub use row::{Row, TableDef};
pub use statement::{RowCount, RowLock, Statement, StatementHandle};
pub use value::Value;
