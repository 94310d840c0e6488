//! Live entities.

use std::fmt;
use std::sync::Arc;

use ormgraph_proto::Value;
use uuid::Uuid;

use super::node::{Node, RefNode, ToManyNode, ValueNode};
use crate::catalog::{EntityType, FieldKind};
use crate::error::{Error, Result};

/// Stable handle of an entity inside its context's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub(crate) u64);

impl EntityId {
    /// Raw arena index.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Stub known only by key.
    NotLoaded,
    /// Fetch in progress.
    Loading,
    /// Mirrors a stored row.
    Loaded,
    /// Created in memory, not yet inserted.
    New,
    /// Row deleted; node access fails.
    Deleted,
}

/// Plain copy of an entity's column values.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    /// Entity type name.
    pub entity_type: String,
    /// Primary key, if assigned.
    pub key: Option<Value>,
    /// Column-backed fields and their values, in field order.
    pub values: Vec<(String, Value)>,
}

impl EntitySnapshot {
    /// Value of a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v)
    }

    /// Key rendered for messages.
    pub fn key_display(&self) -> String {
        match &self.key {
            Some(key) => key.to_string(),
            None => "<unassigned>".to_string(),
        }
    }
}

/// One live row.
#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) id: EntityId,
    uuid: Uuid,
    entity_type: Arc<EntityType>,
    state: EntityState,
    nodes: Vec<Node>,
    marked_for_removal: bool,
}

impl Entity {
    /// Create a NEW entity without a key.
    pub fn new(entity_type: Arc<EntityType>) -> Self {
        let nodes = entity_type
            .fields
            .iter()
            .map(|field| match &field.kind {
                FieldKind::Value { .. } => Node::Value(ValueNode::new(Value::Null)),
                FieldKind::Reference { .. } => Node::Ref(RefNode::new()),
                FieldKind::ToMany { join_property, .. } => {
                    Node::ToMany(ToManyNode::new(join_property.clone()))
                }
            })
            .collect();
        Self {
            id: EntityId(0),
            uuid: Uuid::new_v4(),
            entity_type,
            state: EntityState::New,
            nodes,
            marked_for_removal: false,
        }
    }

    /// Create a NOT_LOADED stub for a known key.
    pub fn stub(entity_type: Arc<EntityType>, key: Value) -> Self {
        let mut entity = Self::new(entity_type);
        entity.state = EntityState::NotLoaded;
        if let Some(node) = entity
            .key_index()
            .and_then(|i| entity.nodes.get_mut(i))
            .and_then(Node::as_value_mut)
        {
            node.load(key);
        }
        entity
    }

    /// Arena handle.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Session identity, independent of the primary key.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Schema type.
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    /// Lifecycle state.
    pub fn state(&self) -> EntityState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    /// Whether the entity is scheduled for deletion by the next persist.
    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal
    }

    pub(crate) fn set_marked_for_removal(&mut self, marked: bool) {
        self.marked_for_removal = marked;
    }

    fn key_index(&self) -> Option<usize> {
        self.entity_type.primary_key_index()
    }

    /// Primary key, if assigned.
    pub fn key(&self) -> Option<&Value> {
        self.key_index()
            .and_then(|i| self.nodes.get(i))
            .and_then(Node::as_value)
            .map(ValueNode::value)
            .filter(|v| !v.is_null())
    }

    /// Set the primary key without change tracking.
    pub(crate) fn load_key(&mut self, key: Value) {
        if let Some(node) = self
            .key_index()
            .and_then(|i| self.nodes.get_mut(i))
            .and_then(Node::as_value_mut)
        {
            node.load(key);
        }
    }

    /// `Type#key`, or `Type#handle` before a key is assigned.
    pub fn label(&self) -> String {
        match self.key() {
            Some(key) => format!("{}#{}", self.entity_type.name, key),
            None => format!("{}{}", self.entity_type.name, self.id),
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.state == EntityState::Deleted {
            return Err(Error::EntityDeleted {
                entity_type: self.entity_type.name.clone(),
                uuid: self.uuid,
            });
        }
        Ok(())
    }

    fn field_position(&self, name: &str) -> Result<usize> {
        self.entity_type
            .field_index(name)
            .ok_or_else(|| Error::UnknownField {
                entity_type: self.entity_type.name.clone(),
                field: name.to_string(),
            })
    }

    /// Node by field name.
    pub fn node(&self, name: &str) -> Result<&Node> {
        let index = self.field_position(name)?;
        self.node_at(index)
    }

    /// Node by field position.
    pub fn node_at(&self, index: usize) -> Result<&Node> {
        self.check_live()?;
        self.nodes.get(index).ok_or_else(|| Error::UnknownField {
            entity_type: self.entity_type.name.clone(),
            field: index.to_string(),
        })
    }

    /// Mutable node by field position.
    pub(crate) fn node_at_mut(&mut self, index: usize) -> Result<&mut Node> {
        self.check_live()?;
        let entity_type = &self.entity_type;
        self.nodes.get_mut(index).ok_or_else(|| Error::UnknownField {
            entity_type: entity_type.name.clone(),
            field: index.to_string(),
        })
    }

    /// All nodes, without the deletion check.
    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    /// Current value of a scalar field.
    ///
    /// The key of a stub is readable; other fields require a loaded entity.
    pub fn value(&self, name: &str) -> Result<&Value> {
        let index = self.field_position(name)?;
        let node = self.node_at(index)?;
        if matches!(self.state, EntityState::NotLoaded | EntityState::Loading)
            && Some(index) != self.key_index()
        {
            return Err(Error::NotLoaded {
                entity_type: self.entity_type.name.clone(),
                key: self.key().cloned().unwrap_or(Value::Null),
            });
        }
        node.as_value()
            .map(ValueNode::value)
            .ok_or_else(|| Error::InvalidNodeType {
                entity_type: self.entity_type.name.clone(),
                property: name.to_string(),
                expected: "value",
            })
    }

    /// Whether any node holds an uncommitted change.
    pub fn is_dirty(&self) -> bool {
        self.nodes.iter().any(Node::is_dirty)
    }

    /// Positions of nodes with pending changes.
    pub fn dirty_fields(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_dirty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Accept all pending changes.
    pub(crate) fn commit(&mut self) {
        for node in &mut self.nodes {
            node.commit();
        }
    }

    /// Current column values.
    pub fn snapshot(&self) -> EntitySnapshot {
        let values = self
            .entity_type
            .column_fields()
            .filter_map(|(i, field)| {
                let value = match self.nodes.get(i)? {
                    Node::Value(v) => v.value().clone(),
                    Node::Ref(r) => r.entity_key().cloned().unwrap_or(Value::Null),
                    Node::ToMany(_) => return None,
                };
                Some((field.name.clone(), value))
            })
            .collect();
        EntitySnapshot {
            entity_type: self.entity_type.name.clone(),
            key: self.key().cloned(),
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDef, ScalarType, TypeRef};

    fn user_type() -> Arc<EntityType> {
        Arc::new(
            EntityType::new("User", "app_user", "id")
                .with_field(FieldDef::value("id", ScalarType::Int64))
                .with_field(FieldDef::value("name", ScalarType::String))
                .with_field(
                    FieldDef::reference("team", TypeRef::local("Team"), ScalarType::Int64)
                        .optional(),
                )
                .with_field(FieldDef::to_many("logins", TypeRef::local("Login"), "user")),
        )
    }

    #[test]
    fn test_new_entity_nodes() {
        let entity = Entity::new(user_type());

        assert_eq!(entity.state(), EntityState::New);
        assert!(entity.key().is_none());
        assert!(matches!(entity.node("name").unwrap(), Node::Value(_)));
        assert!(matches!(entity.node("team").unwrap(), Node::Ref(_)));
        assert!(matches!(entity.node("logins").unwrap(), Node::ToMany(_)));
        assert!(matches!(
            entity.node("nope"),
            Err(Error::UnknownField { .. })
        ));
    }

    #[test]
    fn test_stub_exposes_only_key() {
        let entity = Entity::stub(user_type(), Value::Int64(9));

        assert_eq!(entity.state(), EntityState::NotLoaded);
        assert_eq!(entity.value("id").unwrap(), &Value::Int64(9));
        assert!(matches!(entity.value("name"), Err(Error::NotLoaded { .. })));
    }

    #[test]
    fn test_deleted_entity_rejects_access() {
        let mut entity = Entity::new(user_type());
        entity.set_state(EntityState::Deleted);

        assert!(matches!(
            entity.node("name"),
            Err(Error::EntityDeleted { .. })
        ));
    }

    #[test]
    fn test_snapshot_skips_collections() {
        let mut entity = Entity::stub(user_type(), Value::Int64(1));
        entity.set_state(EntityState::Loaded);
        entity.nodes_mut()[1] = Node::Value(ValueNode::new(Value::from("Ann")));

        let snapshot = entity.snapshot();
        assert_eq!(snapshot.values.len(), 3);
        assert_eq!(snapshot.get("name"), Some(&Value::from("Ann")));
        assert_eq!(snapshot.get("team"), Some(&Value::Null));
        assert_eq!(snapshot.key_display(), "1");
    }
}
