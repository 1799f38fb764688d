//! The entity context: identity map, lazy loading and reverse references.
//!
//! An [`EntityContext`] owns every [`Entity`] it hands out. Entities are
//! addressed by their process-local [`EntityId`] or by `(type, key)`; a key
//! is unique within a type hierarchy. The context keeps a reverse index from
//! each entity to the reference nodes pointing at it, which is what
//! collections are computed from and what keeps foreign keys in step when a
//! primary key changes.
//!
//! # Modes
//!
//! In [`Mode::User`] reads fetch missing data, reference edits are tracked
//! and events are emitted. System operations run under an [`InternalMode`]
//! guard, which suppresses all three.

mod collection;
mod copy;
mod events;
mod mode;
mod proxy;
mod remove;

pub use events::ContextEvent;
pub use mode::{InternalMode, Mode};
pub use proxy::EntityHandle;
pub use remove::Removal;

use crate::config::Config;
use crate::entity::{Entity, EntityId, EntityState, Node};
use crate::error::{CoreError, CoreResult};
use crate::schema::{EntityType, NodeDef, Schema};
use events::EventFeed;
use proxy::ProxyCache;
use relgraph_store::{Connection, Row, RowLock, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, trace};

/// A reference node pointing at an entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefSource {
    /// Entity holding the reference.
    pub source: EntityId,
    /// Reference node name.
    pub node: String,
}

/// Identity-mapped graph of entities backed by one connection.
pub struct EntityContext {
    schema: Arc<Schema>,
    connection: Arc<dyn Connection>,
    config: Config,
    entities: HashMap<EntityId, Entity>,
    by_key: HashMap<(String, Value), EntityId>,
    reverse: HashMap<EntityId, BTreeSet<RefSource>>,
    mode: Mode,
    row_lock: RowLock,
    events: EventFeed,
    proxies: ProxyCache,
}

impl fmt::Debug for EntityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityContext")
            .field("entities", &self.entities.len())
            .field("mode", &self.mode)
            .field("row_lock", &self.row_lock)
            .finish_non_exhaustive()
    }
}

impl EntityContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new(schema: Arc<Schema>, connection: Arc<dyn Connection>, config: Config) -> Self {
        let proxies = ProxyCache::new(config.proxy_cache_capacity);
        Self {
            schema,
            connection,
            config,
            entities: HashMap::new(),
            by_key: HashMap::new(),
            reverse: HashMap::new(),
            mode: Mode::User,
            row_lock: RowLock::None,
            events: EventFeed::default(),
            proxies,
        }
    }

    /// Creates an empty context sharing this one's schema, connection and
    /// configuration.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self::new(
            Arc::clone(&self.schema),
            Arc::clone(&self.connection),
            self.config.clone(),
        )
    }

    /// The schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The connection used for fetching and persisting.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Enters internal mode until the guard is dropped.
    pub fn internal(&mut self) -> InternalMode<'_> {
        InternalMode::enter(self)
    }

    /// Subscribes to user-visible changes.
    pub fn subscribe(&mut self) -> Receiver<ContextEvent> {
        self.events.subscribe()
    }

    pub(crate) fn set_row_lock(&mut self, lock: RowLock) {
        self.row_lock = lock;
    }

    pub(crate) fn emit(&mut self, event: ContextEvent) {
        if self.mode == Mode::User {
            self.events.emit(event);
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Creates a new, unsaved entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownEntityType`] for an undefined type.
    pub fn new_model(&mut self, type_name: &str) -> CoreResult<EntityHandle> {
        let entity_type = Arc::clone(self.schema.entity_type(type_name)?);
        let id = EntityId::new();
        self.entities
            .insert(id, Entity::new(id, entity_type, EntityState::New));
        trace!(%id, entity_type = type_name, "new model");
        Ok(self.proxies.handle(id))
    }

    /// Returns the handle of an entity, rebuilding it if it was dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotInContext`] for unknown ids.
    pub fn handle(&mut self, id: EntityId) -> CoreResult<EntityHandle> {
        self.get(id)?;
        Ok(self.proxies.handle(id))
    }

    /// Forgets the cached handle of an entity.
    pub fn release(&mut self, id: EntityId) {
        self.proxies.release(id);
    }

    /// Adds an entity built outside the context.
    ///
    /// Loaded references are resolved to entities of this context, creating
    /// not-loaded placeholders for unknown keys.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateEntity`] if the identifier or the
    /// `(type, key)` pair is already present.
    pub fn add(&mut self, mut entity: Entity) -> CoreResult<EntityId> {
        let id = entity.id();
        let entity_type = Arc::clone(entity.entity_type());
        if self.entities.contains_key(&id) {
            return Err(CoreError::DuplicateEntity {
                entity_type: entity_type.name.clone(),
                detail: format!("identifier {id}"),
            });
        }
        let index_key = entity
            .key()
            .cloned()
            .map(|key| (entity_type.root.clone(), key));
        if let Some(index_key) = &index_key {
            if self.by_key.contains_key(index_key) {
                return Err(CoreError::DuplicateEntity {
                    entity_type: entity_type.name.clone(),
                    detail: format!("key {}", index_key.1),
                });
            }
        }

        let mut links = Vec::new();
        for (name, node) in entity.nodes_mut() {
            if let Node::Reference(reference) = node {
                if reference.is_loaded() {
                    links.push((name.clone(), reference.key().cloned(), reference.target()));
                    reference.assign(None, None);
                }
            }
        }
        self.entities.insert(id, entity);
        if let Some(index_key) = index_key {
            self.by_key.insert(index_key, id);
        }

        for (node, key, target) in links {
            let target = match (&key, target) {
                (Some(key), _) => {
                    let target_type = reference_target(&entity_type, &node)?;
                    Some(self.get_or_create(&target_type, key.clone())?)
                }
                (None, Some(target)) if self.entities.contains_key(&target) => Some(target),
                (None, _) => None,
            };
            self.entity_mut(id)?.reference_mut(&node)?.assign(key, target);
            if let Some(target) = target {
                self.index_reference(id, &node, target);
            }
        }
        Ok(id)
    }

    /// Looks up an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotInContext`] for unknown ids.
    pub fn get(&self, id: EntityId) -> CoreResult<&Entity> {
        self.entities
            .get(&id)
            .ok_or(CoreError::EntityNotInContext { id })
    }

    pub(crate) fn entity_mut(&mut self, id: EntityId) -> CoreResult<&mut Entity> {
        self.entities
            .get_mut(&id)
            .ok_or(CoreError::EntityNotInContext { id })
    }

    /// Returns true if the entity belongs to this context.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if the context holds no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Identifiers of all entities.
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// All entities, in no particular order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Finds an entity by type and primary key.
    ///
    /// Keys are unique per hierarchy, so a lookup through a supertype also
    /// finds subtype instances.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownEntityType`] for an undefined type.
    pub fn get_by_key(&self, type_name: &str, key: &Value) -> CoreResult<Option<EntityId>> {
        let entity_type = self.schema.entity_type(type_name)?;
        Ok(self
            .by_key
            .get(&(entity_type.root.clone(), key.clone()))
            .copied())
    }

    /// Returns the entity with this key, creating a not-loaded placeholder
    /// if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownEntityType`] for an undefined type and
    /// [`CoreError::InvalidOperation`] for a null key.
    pub fn get_or_create(&mut self, type_name: &str, key: Value) -> CoreResult<EntityId> {
        let entity_type = Arc::clone(self.schema.entity_type(type_name)?);
        if key.is_null() {
            return Err(CoreError::invalid_operation(format!(
                "cannot address {type_name} by a null key"
            )));
        }
        let index_key = (entity_type.root.clone(), key);
        if let Some(id) = self.by_key.get(&index_key) {
            return Ok(*id);
        }
        let id = EntityId::new();
        self.entities.insert(
            id,
            Entity::placeholder(id, entity_type, index_key.1.clone()),
        );
        self.by_key.insert(index_key, id);
        Ok(id)
    }

    /// Primary key of an entity, if assigned.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotInContext`] for unknown ids.
    pub fn key_of(&self, id: EntityId) -> CoreResult<Option<Value>> {
        Ok(self.get(id)?.key().cloned())
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    /// Loads an entity's row by primary key.
    ///
    /// Does nothing in internal mode unless `force` is set, nor for loaded
    /// entities unless `force` is set, nor for new or unkeyed entities. The
    /// entity ends up `Loaded` if the row exists and `NotLoaded` otherwise;
    /// a missing row is not an error.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub fn fetch(&mut self, id: EntityId, force: bool) -> CoreResult<()> {
        if self.mode == Mode::Internal && !force {
            return Ok(());
        }
        let entity = self.get(id)?;
        let state = entity.state();
        match state {
            EntityState::New | EntityState::Loading => return Ok(()),
            EntityState::Loaded if !force => return Ok(()),
            EntityState::Loaded | EntityState::NotLoaded => {}
        }
        let Some(key) = entity.key().cloned() else {
            return Ok(());
        };
        let table = entity.entity_type().table.clone();

        self.entity_mut(id)?.set_state(EntityState::Loading);
        let loaded = match self.connection.load_by_key(&table, &key, self.row_lock) {
            Ok(Some(row)) => self.internal().load_row(id, &row).map(|()| true),
            Ok(None) => Ok(false),
            Err(err) => Err(err.into()),
        };

        match loaded {
            Ok(true) => {
                trace!(%id, %table, %key, "fetched");
                self.entity_mut(id)?.set_state(EntityState::Loaded);
                self.emit(ContextEvent::Loaded { id });
                Ok(())
            }
            Ok(false) => {
                debug!(%id, %table, %key, "row not found");
                self.entity_mut(id)?.set_state(EntityState::NotLoaded);
                Ok(())
            }
            Err(err) => {
                self.entity_mut(id)?.set_state(state);
                Err(err)
            }
        }
    }

    /// Copies a row into an entity, downcasting it first if the row names
    /// a subtype.
    pub(crate) fn load_row(&mut self, id: EntityId, row: &Row) -> CoreResult<()> {
        let mut entity_type = Arc::clone(self.get(id)?.entity_type());
        if let Some(actual) = self.row_type(&entity_type, row)? {
            if actual.name != entity_type.name {
                self.downcast(id, &actual.name)?;
                entity_type = actual;
            }
        }

        for (name, def) in &entity_type.nodes {
            match def {
                NodeDef::Attribute { column } => {
                    if *name == entity_type.key_node {
                        continue;
                    }
                    let value = row.get(column).cloned().unwrap_or(Value::Null);
                    self.entity_mut(id)?.value_mut(name)?.set(value);
                }
                NodeDef::Reference { column, target, .. } => {
                    let key = row.get(column).cloned().and_then(Value::into_option);
                    let target_id = match &key {
                        Some(key) => Some(self.get_or_create(target, key.clone())?),
                        None => None,
                    };
                    self.link(id, name, key, target_id, false)?;
                    self.entity_mut(id)?.reference_mut(name)?.clear_tracking();
                }
                NodeDef::Collection { .. } => {}
            }
        }
        Ok(())
    }

    /// The concrete type a row of `base`'s table belongs to.
    ///
    /// Returns `None` when the row's type is not `base` or a subtype of it.
    pub(crate) fn row_type(
        &self,
        base: &Arc<EntityType>,
        row: &Row,
    ) -> CoreResult<Option<Arc<EntityType>>> {
        let Some(column) = &base.discriminator else {
            return Ok(Some(Arc::clone(base)));
        };
        let Some(name) = row.get(column).and_then(Value::as_text) else {
            return Ok(Some(Arc::clone(base)));
        };
        let actual = self.schema.entity_type(name)?;
        Ok(actual.is_a(&base.name).then(|| Arc::clone(actual)))
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Reads a value node, fetching the entity first if the value is not
    /// loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NodeNotLoaded`] if the value is still missing
    /// after the fetch (or no fetch is allowed), and node lookup errors.
    pub fn get_value(&mut self, id: EntityId, node: &str) -> CoreResult<Value> {
        let loaded = self.get(id)?.value_node(node)?.is_loaded();
        if !loaded && self.mode == Mode::User {
            self.fetch(id, true)?;
        }
        let entity = self.get(id)?;
        entity
            .value_node(node)?
            .get()
            .cloned()
            .ok_or_else(|| CoreError::NodeNotLoaded {
                entity_type: entity.type_name().to_string(),
                node: node.to_string(),
            })
    }

    /// Assigns a value node, fetching the entity first if it is not loaded.
    ///
    /// Assigning the key node re-indexes the entity and updates the foreign
    /// keys of every reference pointing at it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateEntity`] if a new key is already taken,
    /// and node lookup errors.
    pub fn set_value(&mut self, id: EntityId, node: &str, value: Value) -> CoreResult<()> {
        if self.mode == Mode::User && self.get(id)?.state() == EntityState::NotLoaded {
            self.fetch(id, false)?;
        }
        self.assign_value(id, node, value)
    }

    /// Assigns a value node without fetching.
    pub(crate) fn assign_value(&mut self, id: EntityId, node: &str, value: Value) -> CoreResult<()> {
        let entity = self.get(id)?;
        entity.value_node(node)?;
        let entity_type = Arc::clone(entity.entity_type());

        if node == entity_type.key_node {
            let old = entity.key().cloned();
            let new = value.clone().into_option();
            if let Some(new_key) = &new {
                let index_key = (entity_type.root.clone(), new_key.clone());
                if matches!(self.by_key.get(&index_key), Some(other) if *other != id) {
                    return Err(CoreError::DuplicateEntity {
                        entity_type: entity_type.name.clone(),
                        detail: format!("key {new_key}"),
                    });
                }
            }
            self.entity_mut(id)?.value_mut(node)?.set(value);
            if old != new {
                self.on_key_changed(id, old, new)?;
            }
        } else {
            self.entity_mut(id)?.value_mut(node)?.set(value);
        }
        self.emit(ContextEvent::ValueChanged {
            id,
            node: node.to_string(),
        });
        Ok(())
    }

    fn on_key_changed(
        &mut self,
        id: EntityId,
        old: Option<Value>,
        new: Option<Value>,
    ) -> CoreResult<()> {
        let entity_type = Arc::clone(self.get(id)?.entity_type());
        if let Some(old) = &old {
            let index_key = (entity_type.root.clone(), old.clone());
            if self.by_key.get(&index_key) == Some(&id) {
                self.by_key.remove(&index_key);
            }
        }
        if let Some(new) = &new {
            self.by_key.insert((entity_type.root.clone(), new.clone()), id);
        }

        let referrers: Vec<RefSource> = self.references_to(id);
        for referrer in &referrers {
            if let Some(source) = self.entities.get_mut(&referrer.source) {
                source
                    .reference_mut(&referrer.node)?
                    .assign(new.clone(), Some(id));
            }
        }
        trace!(%id, referrers = referrers.len(), "key changed");

        self.refresh_owner_collections(id)?;
        self.emit(ContextEvent::KeyChanged { id, old, new });
        Ok(())
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    /// Resolves a reference node, fetching the entity first if the foreign
    /// key is not loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NodeNotLoaded`] if the reference is still not
    /// loaded, and node lookup errors.
    pub fn reference(&mut self, id: EntityId, node: &str) -> CoreResult<Option<EntityId>> {
        self.ensure_reference_loaded(id, node)?;
        Ok(self.get(id)?.reference(node)?.target())
    }

    /// Foreign-key value of a reference node.
    ///
    /// # Errors
    ///
    /// Same as [`EntityContext::reference`].
    pub fn reference_key(&mut self, id: EntityId, node: &str) -> CoreResult<Option<Value>> {
        self.ensure_reference_loaded(id, node)?;
        Ok(self.get(id)?.reference(node)?.key().cloned())
    }

    fn ensure_reference_loaded(&mut self, id: EntityId, node: &str) -> CoreResult<()> {
        let entity = self.get(id)?;
        if entity.reference(node)?.is_loaded() {
            return Ok(());
        }
        if self.mode == Mode::User {
            self.fetch(id, true)?;
        }
        let entity = self.get(id)?;
        if entity.reference(node)?.is_loaded() {
            Ok(())
        } else {
            Err(CoreError::NodeNotLoaded {
                entity_type: entity.type_name().to_string(),
                node: node.to_string(),
            })
        }
    }

    /// Points a reference node at `target`.
    ///
    /// The owner is fetched first if it is not loaded. Re-setting the
    /// current target does nothing; setting the key the reference held
    /// before editing began clears its removed key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the target is of the
    /// wrong type, and lookup errors.
    pub fn set_reference(
        &mut self,
        id: EntityId,
        node: &str,
        target: Option<EntityId>,
    ) -> CoreResult<()> {
        let entity = self.get(id)?;
        let needs_fetch = entity.state() != EntityState::New
            && (entity.state() == EntityState::NotLoaded || !entity.reference(node)?.is_loaded());
        if needs_fetch && self.mode == Mode::User {
            self.fetch(id, true)?;
        }

        let entity = self.get(id)?;
        let target_type = reference_target(entity.entity_type(), node)?;
        let current = entity.reference(node)?;
        if current.is_loaded() && current.target() == target {
            return Ok(());
        }

        let key = match target {
            Some(target) => {
                let target_entity = self.get(target)?;
                if !target_entity.entity_type().is_a(&target_type) {
                    return Err(CoreError::invalid_operation(format!(
                        "{node} expects {target_type}, got {}",
                        target_entity.type_name()
                    )));
                }
                target_entity.key().cloned()
            }
            None => None,
        };
        let tracked = self.mode == Mode::User;
        self.link(id, node, key, target, tracked)
    }

    /// Points a reference node at the entity with `key`, creating a
    /// not-loaded placeholder if needed.
    ///
    /// # Errors
    ///
    /// Same as [`EntityContext::set_reference`].
    pub fn set_reference_key(
        &mut self,
        id: EntityId,
        node: &str,
        key: Option<Value>,
    ) -> CoreResult<()> {
        let target_type = reference_target(self.get(id)?.entity_type(), node)?;
        let target = match key.and_then(Value::into_option) {
            Some(key) => Some(self.get_or_create(&target_type, key)?),
            None => None,
        };
        self.set_reference(id, node, target)
    }

    /// Every reference node currently pointing at `id`.
    #[must_use]
    pub fn references_to(&self, id: EntityId) -> Vec<RefSource> {
        self.reverse
            .get(&id)
            .map(|sources| sources.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Assigns a reference node and maintains the reverse index.
    pub(crate) fn link(
        &mut self,
        id: EntityId,
        node: &str,
        key: Option<Value>,
        target: Option<EntityId>,
        tracked: bool,
    ) -> CoreResult<()> {
        let reference = self.entity_mut(id)?.reference_mut(node)?;
        let old = reference.target();
        if tracked {
            reference.assign_tracked(key, target);
        } else {
            reference.assign(key, target);
        }

        if let Some(old) = old {
            self.unindex_reference(id, node, old);
        }
        if let Some(target) = target {
            self.index_reference(id, node, target);
        }
        if old != target {
            if let Some(old) = old {
                self.refresh_inverse(id, node, old)?;
            }
            if let Some(target) = target {
                self.refresh_inverse(id, node, target)?;
            }
            self.emit(ContextEvent::ReferenceChanged {
                id,
                node: node.to_string(),
                old,
                new: target,
            });
        }
        Ok(())
    }

    fn index_reference(&mut self, source: EntityId, node: &str, target: EntityId) {
        self.reverse.entry(target).or_default().insert(RefSource {
            source,
            node: node.to_string(),
        });
    }

    fn unindex_reference(&mut self, source: EntityId, node: &str, target: EntityId) {
        if let Some(sources) = self.reverse.get_mut(&target) {
            sources.remove(&RefSource {
                source,
                node: node.to_string(),
            });
            if sources.is_empty() {
                self.reverse.remove(&target);
            }
        }
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    /// Converts an entity to a subtype of its current type.
    ///
    /// Value nodes that are references in the subtype become reference nodes
    /// pointing at the entity with that key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `subtype` is not a subtype
    /// of the entity's type.
    pub fn downcast(&mut self, id: EntityId, subtype: &str) -> CoreResult<()> {
        let subtype = Arc::clone(self.schema.entity_type(subtype)?);
        let entity = self.get(id)?;
        if entity.type_name() == subtype.name {
            return Ok(());
        }
        if !subtype.is_a(entity.type_name()) {
            return Err(CoreError::invalid_operation(format!(
                "{} is not a subtype of {}",
                subtype.name,
                entity.type_name()
            )));
        }
        debug!(%id, from = entity.type_name(), to = %subtype.name, "downcast");

        let converted = self.entity_mut(id)?.retype(Arc::clone(&subtype));
        for (node, value) in converted {
            let Some(value) = value else {
                continue;
            };
            let key = value.into_option();
            let target = match &key {
                Some(key) => {
                    let target_type = reference_target(&subtype, &node)?;
                    Some(self.get_or_create(&target_type, key.clone())?)
                }
                None => None,
            };
            self.link(id, &node, key, target, false)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------

    /// Entities owning `id` through an owning reference or an owning
    /// collection.
    #[must_use]
    pub fn owners_of(&self, id: EntityId) -> Vec<EntityId> {
        let Some(entity) = self.entities.get(&id) else {
            return Vec::new();
        };
        let mut owners = Vec::new();

        for referrer in self.reverse.get(&id).into_iter().flatten() {
            let owning = self
                .entities
                .get(&referrer.source)
                .and_then(|source| source.entity_type().nodes.get(&referrer.node))
                .is_some_and(NodeDef::is_owning);
            if owning && !owners.contains(&referrer.source) {
                owners.push(referrer.source);
            }
        }

        for (name, node) in entity.nodes() {
            let Some(target) = node.as_reference().and_then(|r| r.target()) else {
                continue;
            };
            let Some(owner) = self.entities.get(&target) else {
                continue;
            };
            let owns = owner.entity_type().collections().any(|(_, def)| {
                matches!(def, NodeDef::Collection { target, foreign_node, owning: true }
                    if foreign_node == name && entity.entity_type().is_a(target))
            });
            if owns && !owners.contains(&target) {
                owners.push(target);
            }
        }
        owners
    }

    /// Entities owned by `id`: targets of its owning references and members
    /// of its owning collections.
    #[must_use]
    pub fn owned_children(&self, id: EntityId) -> Vec<EntityId> {
        let Some(entity) = self.entities.get(&id) else {
            return Vec::new();
        };
        let mut children = Vec::new();
        for (name, def) in &entity.entity_type().nodes {
            match def {
                NodeDef::Reference { owning: true, .. } => {
                    if let Some(target) = entity
                        .node(name)
                        .and_then(Node::as_reference)
                        .and_then(|r| r.target())
                    {
                        children.push(target);
                    }
                }
                NodeDef::Collection {
                    target,
                    foreign_node,
                    owning: true,
                } => children.extend(self.inverse_members(id, target, foreign_node)),
                _ => {}
            }
        }
        children.dedup();
        children
    }

    /// Entities of type `member_type` whose `foreign_node` points at `id`.
    pub(crate) fn inverse_members(
        &self,
        id: EntityId,
        member_type: &str,
        foreign_node: &str,
    ) -> Vec<EntityId> {
        self.reverse
            .get(&id)
            .into_iter()
            .flatten()
            .filter(|r| r.node == foreign_node)
            .filter(|r| {
                self.entities
                    .get(&r.source)
                    .is_some_and(|e| e.entity_type().is_a(member_type))
            })
            .map(|r| r.source)
            .collect()
    }
}

/// Target type of a reference node.
fn reference_target(entity_type: &EntityType, node: &str) -> CoreResult<String> {
    match entity_type.node(node)? {
        NodeDef::Reference { target, .. } => Ok(target.clone()),
        _ => Err(CoreError::node_kind(&entity_type.name, node, "reference")),
    }
}

/// Member type and foreign node of a collection node.
fn collection_def(entity_type: &EntityType, node: &str) -> CoreResult<(String, String)> {
    match entity_type.node(node)? {
        NodeDef::Collection {
            target,
            foreign_node,
            ..
        } => Ok((target.clone(), foreign_node.clone())),
        _ => Err(CoreError::node_kind(&entity_type.name, node, "collection")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, context_with_store};
    use relgraph_store::Row;

    #[test]
    fn new_model_is_new_and_unkeyed() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap();
        let entity = ctx.get(order.id()).unwrap();
        assert_eq!(entity.state(), EntityState::New);
        assert_eq!(entity.key(), None);
        assert!(ctx.handle(order.id()).unwrap().same_view(&order));
    }

    #[test]
    fn get_or_create_is_identity_mapped() {
        let mut ctx = context();
        let a = ctx.get_or_create("Customer", Value::Integer(1)).unwrap();
        let b = ctx.get_or_create("Customer", Value::Integer(1)).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.get(a).unwrap().state(), EntityState::NotLoaded);
        assert_eq!(
            ctx.get_by_key("Customer", &Value::Integer(1)).unwrap(),
            Some(a)
        );
        assert!(ctx.get_or_create("Customer", Value::Null).is_err());
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut ctx = context();
        let ty = Arc::clone(ctx.schema().entity_type("Customer").unwrap());
        let existing = ctx.get_or_create("Customer", Value::Integer(5)).unwrap();

        let same_key = Entity::placeholder(EntityId::new(), Arc::clone(&ty), Value::Integer(5));
        assert!(matches!(
            ctx.add(same_key),
            Err(CoreError::DuplicateEntity { .. })
        ));

        let same_id = Entity::new(existing, ty, EntityState::New);
        assert!(matches!(
            ctx.add(same_id),
            Err(CoreError::DuplicateEntity { .. })
        ));
    }

    #[test]
    fn fetch_loads_row_and_resolves_references() {
        let (store, mut ctx) = context_with_store();
        store
            .seed("customers", Row::new().with("id", 1).with("name", "Ada").with("version", 1))
            .unwrap();
        store
            .seed(
                "orders",
                Row::new()
                    .with("id", 10)
                    .with("number", "A-10")
                    .with("status", "open")
                    .with("version", 3)
                    .with("customer_id", 1),
            )
            .unwrap();

        let order = ctx.get_or_create("Order", Value::Integer(10)).unwrap();
        assert_eq!(ctx.get_value(order, "number").unwrap(), Value::from("A-10"));
        assert_eq!(ctx.get(order).unwrap().state(), EntityState::Loaded);

        let customer = ctx.reference(order, "customer").unwrap().unwrap();
        assert_eq!(ctx.key_of(customer).unwrap(), Some(Value::Integer(1)));
        assert_eq!(ctx.get(customer).unwrap().state(), EntityState::NotLoaded);
        assert_eq!(
            ctx.references_to(customer),
            vec![RefSource {
                source: order,
                node: "customer".into()
            }]
        );
    }

    #[test]
    fn fetch_of_missing_row_is_not_an_error() {
        let mut ctx = context();
        let order = ctx.get_or_create("Order", Value::Integer(99)).unwrap();
        ctx.fetch(order, false).unwrap();
        assert_eq!(ctx.get(order).unwrap().state(), EntityState::NotLoaded);
        assert!(matches!(
            ctx.get_value(order, "number"),
            Err(CoreError::NodeNotLoaded { .. })
        ));
    }

    #[test]
    fn internal_mode_suppresses_fetch() {
        let (store, mut ctx) = context_with_store();
        store
            .seed("customers", Row::new().with("id", 1).with("name", "Ada").with("version", 1))
            .unwrap();
        let customer = ctx.get_or_create("Customer", Value::Integer(1)).unwrap();

        {
            let mut internal = ctx.internal();
            internal.fetch(customer, false).unwrap();
            assert_eq!(internal.get(customer).unwrap().state(), EntityState::NotLoaded);
            assert!(internal.get_value(customer, "name").is_err());
        }
        assert_eq!(ctx.mode(), Mode::User);
        assert_eq!(ctx.get_value(customer, "name").unwrap(), Value::from("Ada"));
    }

    #[test]
    fn key_change_rekeys_referrers() {
        let mut ctx = context();
        let customer = ctx.new_model("Customer").unwrap().id();
        let order = ctx.new_model("Order").unwrap().id();
        ctx.set_reference(order, "customer", Some(customer)).unwrap();
        assert_eq!(ctx.reference_key(order, "customer").unwrap(), None);

        ctx.set_value(customer, "id", Value::Integer(42)).unwrap();

        assert_eq!(
            ctx.reference_key(order, "customer").unwrap(),
            Some(Value::Integer(42))
        );
        assert_eq!(
            ctx.get_by_key("Customer", &Value::Integer(42)).unwrap(),
            Some(customer)
        );
    }

    #[test]
    fn duplicate_key_assignment_fails() {
        let mut ctx = context();
        ctx.get_or_create("Customer", Value::Integer(1)).unwrap();
        let fresh = ctx.new_model("Customer").unwrap().id();
        assert!(matches!(
            ctx.set_value(fresh, "id", Value::Integer(1)),
            Err(CoreError::DuplicateEntity { .. })
        ));
    }

    #[test]
    fn set_reference_tracks_and_restores() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let first = ctx.get_or_create("Customer", Value::Integer(1)).unwrap();
        let second = ctx.get_or_create("Customer", Value::Integer(2)).unwrap();

        ctx.internal().set_reference(order, "customer", Some(first)).unwrap();
        assert!(!ctx.get(order).unwrap().reference("customer").unwrap().is_modified());

        ctx.set_reference(order, "customer", Some(second)).unwrap();
        let reference = ctx.get(order).unwrap().reference("customer").unwrap();
        assert_eq!(reference.removed_key(), Some(&Value::Integer(1)));
        assert!(ctx.references_to(first).is_empty());
        assert_eq!(ctx.references_to(second).len(), 1);

        ctx.set_reference(order, "customer", Some(first)).unwrap();
        let reference = ctx.get(order).unwrap().reference("customer").unwrap();
        assert_eq!(reference.removed_key(), None);
        assert!(!reference.is_modified());
    }

    #[test]
    fn set_reference_rejects_wrong_type() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let line = ctx.new_model("OrderLine").unwrap().id();
        assert!(matches!(
            ctx.set_reference(order, "customer", Some(line)),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn events_follow_user_edits_only() {
        let mut ctx = context();
        let events = ctx.subscribe();
        let customer = ctx.new_model("Customer").unwrap().id();

        ctx.internal()
            .set_value(customer, "name", Value::from("quiet"))
            .unwrap();
        assert!(events.try_recv().is_err());

        ctx.set_value(customer, "name", Value::from("loud")).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            ContextEvent::ValueChanged {
                id: customer,
                node: "name".into()
            }
        );
    }

    #[test]
    fn downcast_converts_values_to_references() {
        let mut ctx = context();
        let party = ctx.new_model("Party").unwrap().id();
        ctx.set_value(party, "registration", Value::Integer(7)).unwrap();

        ctx.downcast(party, "Company").unwrap();

        let target = ctx.reference(party, "registration").unwrap().unwrap();
        assert_eq!(ctx.get(target).unwrap().type_name(), "Registration");
        assert_eq!(ctx.key_of(target).unwrap(), Some(Value::Integer(7)));
        assert!(ctx.downcast(party, "Customer").is_err());
    }

    #[test]
    fn fetch_downcasts_by_discriminator() {
        let (store, mut ctx) = context_with_store();
        store
            .seed(
                "parties",
                Row::new()
                    .with("id", 3)
                    .with("kind", "Company")
                    .with("name", "Acme")
                    .with("registration_id", 8),
            )
            .unwrap();
        let party = ctx.get_or_create("Party", Value::Integer(3)).unwrap();
        ctx.fetch(party, false).unwrap();
        assert_eq!(ctx.get(party).unwrap().type_name(), "Company");
        assert!(ctx.reference(party, "registration").unwrap().is_some());
    }

    #[test]
    fn ownership_queries() {
        let mut ctx = context();
        let order = ctx.new_model("Order").unwrap().id();
        let address = ctx.new_model("Address").unwrap().id();
        let line = ctx.new_model("OrderLine").unwrap().id();
        let customer = ctx.new_model("Customer").unwrap().id();
        ctx.set_reference(order, "shipping", Some(address)).unwrap();
        ctx.set_reference(line, "order", Some(order)).unwrap();
        ctx.set_reference(order, "customer", Some(customer)).unwrap();

        assert_eq!(ctx.owners_of(address), vec![order]);
        assert_eq!(ctx.owners_of(line), vec![order]);
        assert!(ctx.owners_of(order).is_empty());

        let children = ctx.owned_children(order);
        assert!(children.contains(&address));
        assert!(children.contains(&line));
        assert!(!children.contains(&customer));
    }
}
