//! External handles to entities.

use crate::entity::EntityId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Debug)]
struct HandleInner {
    id: EntityId,
}

/// A caller-facing view of one entity.
///
/// At most one live handle exists per entity; asking the context again
/// returns a clone of the same handle while any copy is alive, and a fresh
/// one after all copies were dropped.
#[derive(Clone)]
pub struct EntityHandle(Arc<HandleInner>);

impl EntityHandle {
    /// The entity this handle views.
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.0.id
    }

    /// Returns true if both handles are the same view object.
    #[must_use]
    pub fn same_view(&self, other: &EntityHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityHandle({})", self.0.id)
    }
}

impl PartialEq for EntityHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for EntityHandle {}

/// Weak map from entity id to its handle.
#[derive(Debug)]
pub(crate) struct ProxyCache {
    handles: HashMap<EntityId, Weak<HandleInner>>,
    capacity: usize,
}

impl ProxyCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            handles: HashMap::new(),
            capacity,
        }
    }

    pub(crate) fn handle(&mut self, id: EntityId) -> EntityHandle {
        if let Some(inner) = self.handles.get(&id).and_then(Weak::upgrade) {
            return EntityHandle(inner);
        }
        if self.handles.len() >= self.capacity {
            self.purge();
        }
        let inner = Arc::new(HandleInner { id });
        self.handles.insert(id, Arc::downgrade(&inner));
        EntityHandle(inner)
    }

    pub(crate) fn release(&mut self, id: EntityId) {
        self.handles.remove(&id);
    }

    /// Drops entries whose handles are gone.
    pub(crate) fn purge(&mut self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|_, weak| weak.strong_count() > 0);
        before - self.handles.len()
    }

    pub(crate) fn clear(&mut self) {
        self.handles.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}
