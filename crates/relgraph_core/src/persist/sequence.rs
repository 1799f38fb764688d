//! Primary-key generation for created entities.

use crate::error::CoreResult;
use crate::schema::EntityType;
use relgraph_store::{Connection, Value};

/// Produces keys for entities created without one.
pub trait SequenceGenerator: Send + Sync {
    /// Next key for a row of `entity_type`.
    ///
    /// # Errors
    ///
    /// Any error aborts the persist call.
    fn next_key(&self, connection: &dyn Connection, entity_type: &EntityType) -> CoreResult<Value>;
}

/// Draws keys from the store sequence named by the entity type.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreSequenceGenerator;

impl SequenceGenerator for StoreSequenceGenerator {
    fn next_key(&self, connection: &dyn Connection, entity_type: &EntityType) -> CoreResult<Value> {
        Ok(Value::Integer(
            connection.next_sequence_value(&entity_type.sequence)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::schema;
    use relgraph_store::InMemoryStore;

    #[test]
    fn hierarchy_shares_sequence() {
        let schema = schema();
        let store = InMemoryStore::new();
        let conn = store.connect();
        let generator = StoreSequenceGenerator;

        let party = schema.entity_type("Party").unwrap();
        let company = schema.entity_type("Company").unwrap();
        assert_eq!(generator.next_key(&conn, party).unwrap(), Value::Integer(1));
        assert_eq!(generator.next_key(&conn, company).unwrap(), Value::Integer(2));
    }
}
