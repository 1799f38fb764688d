//! Entity type descriptors.
//!
//! A [`Schema`] is the runtime description of every entity type: its table,
//! key and lock nodes, and the attribute, reference and collection nodes it
//! carries. Subtypes share their root's table (single-table inheritance) and
//! may override inherited nodes, typically turning a plain attribute into a
//! reference with the same column.
//!
//! ```rust
//! use relgraph_core::{EntityTypeDef, Schema};
//!
//! let schema = Schema::builder()
//!     .entity(EntityTypeDef::new("Customer", "customers").lock("version").attribute("name"))
//!     .entity(
//!         EntityTypeDef::new("Order", "orders")
//!             .attribute("number")
//!             .reference("customer", "Customer"),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let order = schema.entity_type("Order").unwrap();
//! assert_eq!(order.column_of("customer"), Some("customer_id"));
//! ```

use crate::error::{CoreError, CoreResult};
use relgraph_store::TableDef;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Definition of one node of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeDef {
    /// A scalar column.
    Attribute {
        /// Column name.
        column: String,
    },
    /// A foreign key resolved to another entity.
    Reference {
        /// Foreign-key column.
        column: String,
        /// Target entity type.
        target: String,
        /// Whether the referencing entity owns the target.
        owning: bool,
    },
    /// The set of `target` entities whose `foreign_node` reference points here.
    Collection {
        /// Member entity type.
        target: String,
        /// Reference node on the member type.
        foreign_node: String,
        /// Whether this entity owns the members.
        owning: bool,
    },
}

impl NodeDef {
    /// Returns the column backing this node, if it is persistent.
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Attribute { column } | Self::Reference { column, .. } => Some(column),
            Self::Collection { .. } => None,
        }
    }

    /// Returns true for owning references and owning collections.
    #[must_use]
    pub fn is_owning(&self) -> bool {
        match self {
            Self::Attribute { .. } => false,
            Self::Reference { owning, .. } | Self::Collection { owning, .. } => *owning,
        }
    }

    /// Short kind name used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Attribute { .. } => "value",
            Self::Reference { .. } => "reference",
            Self::Collection { .. } => "collection",
        }
    }
}

/// A resolved entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    /// Type name.
    pub name: String,
    /// Backing table, shared across a hierarchy.
    pub table: String,
    /// Name of the hierarchy root.
    pub root: String,
    /// Direct supertype.
    pub supertype: Option<String>,
    /// Supertypes, nearest first.
    pub ancestors: Vec<String>,
    /// Primary-key node.
    pub key_node: String,
    /// Optimistic-lock node, if the type is locked.
    pub lock_node: Option<String>,
    /// Sequence used to assign keys to new rows.
    pub sequence: String,
    /// Column naming the concrete type of a row, for hierarchies.
    pub discriminator: Option<String>,
    /// Nodes by name, inherited ones included.
    pub nodes: BTreeMap<String, NodeDef>,
}

impl EntityType {
    /// Returns the node definition, or `UnknownNode`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownNode`] if the type has no such node.
    pub fn node(&self, name: &str) -> CoreResult<&NodeDef> {
        self.nodes
            .get(name)
            .ok_or_else(|| CoreError::unknown_node(&self.name, name))
    }

    /// Returns true if this type is `name` or one of its subtypes.
    #[must_use]
    pub fn is_a(&self, name: &str) -> bool {
        self.name == name || self.ancestors.iter().any(|a| a == name)
    }

    /// Returns the column backing a node.
    #[must_use]
    pub fn column_of(&self, node: &str) -> Option<&str> {
        self.nodes.get(node).and_then(NodeDef::column)
    }

    /// Primary-key column.
    #[must_use]
    pub fn key_column(&self) -> &str {
        self.column_of(&self.key_node).unwrap_or(&self.key_node)
    }

    /// Optimistic-lock column.
    #[must_use]
    pub fn lock_column(&self) -> Option<&str> {
        self.lock_node.as_deref().and_then(|n| self.column_of(n))
    }

    /// Returns true if the type carries an optimistic lock.
    #[must_use]
    pub fn has_lock(&self) -> bool {
        self.lock_node.is_some()
    }

    /// Persistent nodes (attributes and references) with their columns.
    pub fn persistent_nodes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes
            .iter()
            .filter_map(|(name, def)| def.column().map(|c| (name.as_str(), c)))
    }

    /// Reference nodes.
    pub fn references(&self) -> impl Iterator<Item = (&str, &NodeDef)> {
        self.nodes
            .iter()
            .filter(|(_, def)| matches!(def, NodeDef::Reference { .. }))
            .map(|(name, def)| (name.as_str(), def))
    }

    /// Collection nodes.
    pub fn collections(&self) -> impl Iterator<Item = (&str, &NodeDef)> {
        self.nodes
            .iter()
            .filter(|(_, def)| matches!(def, NodeDef::Collection { .. }))
            .map(|(name, def)| (name.as_str(), def))
    }
}

/// Builder input for one entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeDef {
    name: String,
    table: Option<String>,
    supertype: Option<String>,
    key_node: Option<String>,
    lock_node: Option<String>,
    sequence: Option<String>,
    discriminator: Option<String>,
    nodes: Vec<(String, NodeDef)>,
}

impl EntityTypeDef {
    /// Starts a root type stored in `table`, keyed by an `id` node.
    #[must_use]
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: Some(table.into()),
            supertype: None,
            key_node: None,
            lock_node: None,
            sequence: None,
            discriminator: None,
            nodes: Vec::new(),
        }
    }

    /// Starts a subtype of `supertype`, stored in the supertype's table.
    #[must_use]
    pub fn subtype(name: impl Into<String>, supertype: impl Into<String>) -> Self {
        Self {
            table: None,
            supertype: Some(supertype.into()),
            ..Self::new(name, String::new())
        }
    }

    /// Names the primary-key node (default `id`).
    #[must_use]
    pub fn key(mut self, node: impl Into<String>) -> Self {
        self.key_node = Some(node.into());
        self
    }

    /// Adds an optimistic-lock node.
    #[must_use]
    pub fn lock(mut self, node: impl Into<String>) -> Self {
        self.lock_node = Some(node.into());
        self
    }

    /// Names the key sequence (default `<table>_seq`).
    #[must_use]
    pub fn sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    /// Stores the concrete type name of each row in `column`.
    #[must_use]
    pub fn discriminator(mut self, column: impl Into<String>) -> Self {
        self.discriminator = Some(column.into());
        self
    }

    /// Adds an attribute stored in a column of the same name.
    #[must_use]
    pub fn attribute(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let column = name.clone();
        self.attribute_column(name, column)
    }

    /// Adds an attribute stored in `column`.
    #[must_use]
    pub fn attribute_column(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.nodes.push((
            name.into(),
            NodeDef::Attribute {
                column: column.into(),
            },
        ));
        self
    }

    /// Adds a non-owning reference stored in `<name>_id`.
    #[must_use]
    pub fn reference(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_reference(name.into(), target.into(), false)
    }

    /// Adds an owning reference stored in `<name>_id`.
    #[must_use]
    pub fn owning_reference(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_reference(name.into(), target.into(), true)
    }

    /// Adds a non-owning collection of `target` entities linked by `foreign_node`.
    #[must_use]
    pub fn collection(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_node: impl Into<String>,
    ) -> Self {
        self.push_collection(name.into(), target.into(), foreign_node.into(), false)
    }

    /// Adds an owning collection of `target` entities linked by `foreign_node`.
    #[must_use]
    pub fn owning_collection(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_node: impl Into<String>,
    ) -> Self {
        self.push_collection(name.into(), target.into(), foreign_node.into(), true)
    }

    fn push_reference(mut self, name: String, target: String, owning: bool) -> Self {
        let column = format!("{name}_id");
        self.nodes.push((
            name,
            NodeDef::Reference {
                column,
                target,
                owning,
            },
        ));
        self
    }

    fn push_collection(
        mut self,
        name: String,
        target: String,
        foreign_node: String,
        owning: bool,
    ) -> Self {
        self.nodes.push((
            name,
            NodeDef::Collection {
                target,
                foreign_node,
                owning,
            },
        ));
        self
    }
}

/// Builds and validates a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    defs: Vec<EntityTypeDef>,
}

impl SchemaBuilder {
    /// Adds an entity type definition.
    #[must_use]
    pub fn entity(mut self, def: EntityTypeDef) -> Self {
        self.defs.push(def);
        self
    }

    /// Resolves inheritance and validates every type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidSchema`] for duplicate or unknown types,
    /// inheritance cycles, dangling reference targets, collections whose
    /// foreign node is not a reference back to the owner, and overrides that
    /// move a node to a different column.
    pub fn build(self) -> CoreResult<Schema> {
        let mut pending: HashMap<String, EntityTypeDef> = HashMap::new();
        for def in self.defs {
            if pending.contains_key(&def.name) {
                return Err(CoreError::invalid_schema(format!(
                    "entity type {} defined twice",
                    def.name
                )));
            }
            pending.insert(def.name.clone(), def);
        }

        let mut types: BTreeMap<String, EntityType> = BTreeMap::new();
        while !pending.is_empty() {
            let ready: Vec<String> = pending
                .values()
                .filter(|d| d.supertype.as_ref().map_or(true, |s| types.contains_key(s)))
                .map(|d| d.name.clone())
                .collect();
            if ready.is_empty() {
                let mut names: Vec<_> = pending.keys().cloned().collect();
                names.sort();
                return Err(CoreError::invalid_schema(format!(
                    "unresolvable supertypes for {}",
                    names.join(", ")
                )));
            }
            for name in ready {
                if let Some(def) = pending.remove(&name) {
                    let resolved = resolve(def, &types)?;
                    types.insert(name, resolved);
                }
            }
        }

        validate(&types)?;
        Ok(Schema {
            types: types
                .into_iter()
                .map(|(name, ty)| (name, Arc::new(ty)))
                .collect(),
        })
    }
}

fn resolve(def: EntityTypeDef, types: &BTreeMap<String, EntityType>) -> CoreResult<EntityType> {
    let parent = def.supertype.as_ref().and_then(|s| types.get(s));
    let mut ty = match parent {
        Some(parent) => {
            if def.table.is_some() || def.key_node.is_some() || def.discriminator.is_some() {
                return Err(CoreError::invalid_schema(format!(
                    "subtype {} cannot redefine table, key or discriminator",
                    def.name
                )));
            }
            let mut ancestors = vec![parent.name.clone()];
            ancestors.extend(parent.ancestors.iter().cloned());
            EntityType {
                name: def.name.clone(),
                supertype: Some(parent.name.clone()),
                ancestors,
                lock_node: def.lock_node.clone().or_else(|| parent.lock_node.clone()),
                ..parent.clone()
            }
        }
        None => {
            let table = def.table.clone().unwrap_or_default();
            if table.is_empty() {
                return Err(CoreError::invalid_schema(format!(
                    "entity type {} has no table",
                    def.name
                )));
            }
            let key_node = def.key_node.clone().unwrap_or_else(|| "id".to_string());
            let mut nodes = BTreeMap::new();
            nodes.insert(
                key_node.clone(),
                NodeDef::Attribute {
                    column: key_node.clone(),
                },
            );
            EntityType {
                name: def.name.clone(),
                sequence: def.sequence.clone().unwrap_or_else(|| format!("{table}_seq")),
                table,
                root: def.name.clone(),
                supertype: None,
                ancestors: Vec::new(),
                key_node,
                lock_node: def.lock_node.clone(),
                discriminator: def.discriminator.clone(),
                nodes,
            }
        }
    };

    if let Some(lock) = &def.lock_node {
        ty.nodes
            .entry(lock.clone())
            .or_insert_with(|| NodeDef::Attribute {
                column: lock.clone(),
            });
    }

    for (name, node) in def.nodes {
        if name == ty.key_node {
            return Err(CoreError::invalid_schema(format!(
                "{} redefines its key node {name}",
                ty.name
            )));
        }
        if let Some(existing) = ty.nodes.get(&name) {
            if existing.column() != node.column() {
                return Err(CoreError::invalid_schema(format!(
                    "{}.{name} overrides an inherited node with a different column",
                    ty.name
                )));
            }
        }
        ty.nodes.insert(name, node);
    }

    Ok(ty)
}

fn validate(types: &BTreeMap<String, EntityType>) -> CoreResult<()> {
    for ty in types.values() {
        if let Some(lock) = &ty.lock_node {
            if !matches!(ty.nodes.get(lock), Some(NodeDef::Attribute { .. })) {
                return Err(CoreError::invalid_schema(format!(
                    "{} lock node {lock} is not an attribute",
                    ty.name
                )));
            }
        }
        for (name, node) in &ty.nodes {
            match node {
                NodeDef::Attribute { .. } => {}
                NodeDef::Reference { target, .. } => {
                    if !types.contains_key(target) {
                        return Err(CoreError::invalid_schema(format!(
                            "{}.{name} references unknown type {target}",
                            ty.name
                        )));
                    }
                }
                NodeDef::Collection {
                    target,
                    foreign_node,
                    ..
                } => {
                    let member = types.get(target).ok_or_else(|| {
                        CoreError::invalid_schema(format!(
                            "{}.{name} collects unknown type {target}",
                            ty.name
                        ))
                    })?;
                    match member.nodes.get(foreign_node) {
                        Some(NodeDef::Reference { target: back, .. }) if ty.is_a(back) => {}
                        _ => {
                            return Err(CoreError::invalid_schema(format!(
                                "{}.{name}: {target}.{foreign_node} is not a reference to {}",
                                ty.name, ty.name
                            )))
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// The set of entity types known to a context.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: BTreeMap<String, Arc<EntityType>>,
}

impl Schema {
    /// Starts a schema builder.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Looks up an entity type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownEntityType`] if no such type exists.
    pub fn entity_type(&self, name: &str) -> CoreResult<&Arc<EntityType>> {
        self.types
            .get(name)
            .ok_or_else(|| CoreError::unknown_entity_type(name))
    }

    /// Iterates over all entity types in name order.
    pub fn types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.types.values()
    }

    /// Table definitions for every root type, with the union of the
    /// hierarchy's columns.
    #[must_use]
    pub fn table_definitions(&self) -> Vec<TableDef> {
        let mut tables: BTreeMap<&str, TableDef> = BTreeMap::new();
        for ty in self.types.values() {
            let mut def = tables
                .remove(ty.table.as_str())
                .unwrap_or_else(|| TableDef::new(&ty.table, ty.key_column()));
            for (_, column) in ty.persistent_nodes() {
                def = def.column(column);
            }
            if let Some(discriminator) = &ty.discriminator {
                def = def.column(discriminator);
            }
            tables.insert(ty.table.as_str(), def);
        }
        tables.into_values().collect()
    }
}
