//! Shared fixtures for unit tests.

use crate::config::Config;
use crate::context::EntityContext;
use crate::schema::{EntityTypeDef, Schema};
use relgraph_store::{Connection, InMemoryStore};
use std::sync::Arc;

/// Customers, orders with owned lines and shipping address, and a party
/// hierarchy.
pub(crate) fn schema() -> Arc<Schema> {
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
        .unwrap();
    Arc::new(schema)
}

/// A store with one table per root type.
pub(crate) fn store(schema: &Schema) -> InMemoryStore {
    let store = InMemoryStore::new();
    for table in schema.table_definitions() {
        store.create_table(table).unwrap();
    }
    store
}

pub(crate) fn context() -> EntityContext {
    context_with_store().1
}

pub(crate) fn context_with_store() -> (InMemoryStore, EntityContext) {
    let schema = schema();
    let store = store(&schema);
    let connection: Arc<dyn Connection> = Arc::new(store.connect());
    let context = EntityContext::new(schema, connection, Config::default());
    (store, context)
}
