//! Test fixtures and store helpers.
//!
//! Provides the order-management schema used across the test suites, an
//! in-memory store with its tables created, and seed helpers for common
//! row shapes.

use relgraph_core::{Config, EntityContext, EntityTypeDef, Schema, TableAuditSink};
use relgraph_store::{Capabilities, Connection, InMemoryStore, Row, Value};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

/// Name of the audit table created by [`TestStore`].
pub const AUDIT_TABLE: &str = "audit_log";

/// Customers, orders with owned lines and a shipping address, and a
/// party hierarchy with a company subtype.
///
/// | type | table | lock | notable nodes |
/// |------|-------|------|---------------|
/// | `Customer` | `customers` | `version` | `orders` collection |
/// | `Order` | `orders` | `version` | `customer`, owning `shipping`, owning `lines` |
/// | `OrderLine` | `order_lines` | - | `order` |
/// | `Address` | `addresses` | - | |
/// | `Registration` | `registrations` | - | |
/// | `Party` / `Company` | `parties` | `version` | discriminator `kind` |
pub fn order_schema() -> Arc<Schema> {
    let schema = Schema::builder()
        .entity(
            EntityTypeDef::new("Customer", "customers")
                .lock("version")
                .attribute("name")
                .collection("orders", "Order", "customer"),
        )
        .entity(
            EntityTypeDef::new("Order", "orders")
                .lock("version")
                .attribute("number")
                .attribute("status")
                .reference("customer", "Customer")
                .owning_reference("shipping", "Address")
                .owning_collection("lines", "OrderLine", "order"),
        )
        .entity(
            EntityTypeDef::new("OrderLine", "order_lines")
                .attribute("product")
                .attribute("quantity")
                .reference("order", "Order"),
        )
        .entity(
            EntityTypeDef::new("Address", "addresses")
                .attribute("city")
                .attribute("street"),
        )
        .entity(EntityTypeDef::new("Registration", "registrations").attribute("number"))
        .entity(
            EntityTypeDef::new("Party", "parties")
                .discriminator("kind")
                .lock("version")
                .attribute("name")
                .attribute_column("registration", "registration_id"),
        )
        .entity(
            EntityTypeDef::subtype("Company", "Party").reference("registration", "Registration"),
        )
        .build()
        .expect("order schema is valid");
    Arc::new(schema)
}

/// An in-memory store with the [`order_schema`] tables and an audit table.
#[derive(Debug, Clone)]
pub struct TestStore {
    /// The store.
    pub store: InMemoryStore,
    /// The schema the tables were created from.
    pub schema: Arc<Schema>,
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStore {
    /// Creates a store with default capabilities.
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    /// Creates a store reporting `capabilities`.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        let schema = order_schema();
        let store = InMemoryStore::with_capabilities(capabilities);
        for table in schema.table_definitions() {
            store.create_table(table).expect("fresh store");
        }
        store
            .create_table(TableAuditSink::new(AUDIT_TABLE).table_def())
            .expect("fresh store");
        Self { store, schema }
    }

    /// Opens a connection.
    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::new(self.store.connect())
    }

    /// A context on a fresh connection with the default configuration.
    pub fn context(&self) -> EntityContext {
        self.context_with(Config::default())
    }

    /// A context on a fresh connection.
    pub fn context_with(&self, config: Config) -> EntityContext {
        EntityContext::new(Arc::clone(&self.schema), self.connection(), config)
    }

    /// Seeds a customer row.
    pub fn seed_customer(&self, key: i64, name: &str, version: i64) {
        self.seed(
            "customers",
            Row::new()
                .with("id", key)
                .with("name", name)
                .with("version", version),
        );
    }

    /// Seeds an order row, optionally owned by a customer.
    pub fn seed_order(&self, key: i64, customer: Option<i64>, version: i64) {
        let mut row = Row::new()
            .with("id", key)
            .with("number", format!("N-{key}"))
            .with("status", "open")
            .with("version", version);
        if let Some(customer) = customer {
            row = row.with("customer_id", customer);
        }
        self.seed("orders", row);
    }

    /// Seeds order lines `first..first + count` for an order.
    pub fn seed_lines(&self, order: i64, first: i64, count: i64) {
        for key in first..first + count {
            self.seed(
                "order_lines",
                Row::new()
                    .with("id", key)
                    .with("product", format!("P-{key}"))
                    .with("quantity", 1)
                    .with("order_id", order),
            );
        }
    }

    /// Seeds an arbitrary row.
    pub fn seed(&self, table: &str, row: Row) {
        self.store.seed(table, row).expect("seed row");
    }

    /// Reads a committed column value.
    pub fn column(&self, table: &str, key: i64, column: &str) -> Option<Value> {
        self.store
            .row(table, &Value::Integer(key))
            .and_then(|row| row.get(column).cloned())
    }
}

/// Installs a `tracing` subscriber for tests, once per process.
///
/// The filter comes from `RELGRAPH_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env("RELGRAPH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
