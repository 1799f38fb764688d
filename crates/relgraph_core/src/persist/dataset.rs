//! The database state of the entities a persist call touches.

use crate::context::EntityContext;
use crate::entity::{EntityId, EntitySnapshot, EntityState};
use crate::error::CoreResult;
use relgraph_store::RowLock;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Freshly loaded rows for the update, delete and depends-on entities.
///
/// Rows are read into a side context so that nothing in the working graph is
/// overwritten. When the store cannot report per-row batch counts the rows
/// are read with `FOR UPDATE`, which keeps them stable until commit.
pub struct DatabaseDataSet {
    side: EntityContext,
    snapshots: HashMap<EntityId, EntitySnapshot>,
    row_lock: RowLock,
}

impl DatabaseDataSet {
    /// Creates an empty data set reading through `working`'s connection.
    #[must_use]
    pub fn new(working: &EntityContext) -> Self {
        let capabilities = working.connection().capabilities();
        let row_lock = if capabilities.needs_pessimistic_locking() {
            RowLock::ForUpdate {
                wait: if capabilities.supports_select_for_update_wait {
                    working.config().pessimistic_lock_wait
                } else {
                    None
                },
            }
        } else {
            RowLock::None
        };
        let mut side = working.fork();
        side.set_row_lock(row_lock);
        Self {
            side,
            snapshots: HashMap::new(),
            row_lock,
        }
    }

    /// Loads the rows of `ids`, keyed by their identifier in `working`.
    ///
    /// Entities without a key are skipped. A missing row is not an error
    /// here; it shows up as a missing snapshot.
    ///
    /// # Errors
    ///
    /// Returns store failures, including lock conflicts on the pessimistic
    /// path.
    pub fn load(&mut self, working: &EntityContext, ids: &[EntityId]) -> CoreResult<()> {
        let mut side = self.side.internal();
        for &id in ids {
            let entity = working.get(id)?;
            let Some(key) = entity.key().cloned() else {
                continue;
            };
            let side_id = side.get_or_create(entity.type_name(), key)?;
            side.fetch(side_id, true)?;
            let loaded = side.get(side_id)?;
            if loaded.state() == EntityState::Loaded {
                self.snapshots.insert(id, loaded.snapshot());
            } else {
                trace!(%id, entity_type = entity.type_name(), "no database row");
            }
        }
        debug!(
            requested = ids.len(),
            loaded = self.snapshots.len(),
            row_lock = ?self.row_lock,
            "database data set loaded"
        );
        Ok(())
    }

    /// The database state of an entity, if its row exists.
    #[must_use]
    pub fn snapshot(&self, id: EntityId) -> Option<&EntitySnapshot> {
        self.snapshots.get(&id)
    }

    /// Returns true if the entity's row was found.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.snapshots.contains_key(&id)
    }

    /// Number of rows found.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Returns true if no row was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// The row lock used for loading.
    #[must_use]
    pub fn row_lock(&self) -> RowLock {
        self.row_lock
    }
}

impl Drop for DatabaseDataSet {
    fn drop(&mut self) {
        trace!(entities = self.side.len(), "releasing database data set");
        self.side.clear();
    }
}
