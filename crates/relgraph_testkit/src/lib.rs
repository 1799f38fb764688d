//! # relgraph Testkit
//!
//! Test utilities for relgraph.
//!
//! This crate provides:
//! - The order-management fixture schema and a ready-made in-memory store
//! - Property-based generators for dependency DAGs and ownership forests,
//!   with or without ownership cycles
//! - Stress runs of concurrent persist calls
//! - A `tracing` subscriber for test output
//!
//! ## Usage
//!
//! ```rust
//! use relgraph_core::PersistRequest;
//! use relgraph_store::Value;
//! use relgraph_testkit::prelude::*;
//!
//! init_tracing();
//! let store = TestStore::new();
//! store.seed_customer(1, "Ada", 1);
//!
//! let mut context = store.context();
//! let customer = context.get_or_create("Customer", Value::Integer(1)).unwrap();
//! context.set_value(customer, "name", Value::from("Grace")).unwrap();
//! context.persist(&PersistRequest::new().save(customer)).unwrap();
//! assert_eq!(store.column("customers", 1, "version"), Some(Value::Integer(2)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
