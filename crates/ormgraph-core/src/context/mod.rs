//! Entity context: the per-session identity map.
//!
//! The context owns every entity of a session in an arena keyed by
//! [`EntityId`] and keeps three indices over it (session UUID, primary key,
//! entity type). References between entities are tracked in both
//! directions: each reference node stores its target's handle, and each
//! target records the `(owner, field)` pairs pointing at it, so key changes
//! and deletions update all dependents without scanning the arena.

mod proxy;
mod refs;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use ormgraph_proto::Value;
use tracing::trace;
use uuid::Uuid;

use crate::catalog::{Definitions, EntityType, FieldKind};
use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::graph::{Entity, EntityId, EntityState, Node};

pub use proxy::{GenericProxy, Property, ProxyFactory};
use proxy::ProxySlot;

/// Session-scoped container of entities.
pub struct EntityContext {
    definitions: Arc<Definitions>,
    config: ContextConfig,
    next_id: u64,
    entities: BTreeMap<EntityId, Entity>,
    by_uuid: HashMap<Uuid, EntityId>,
    by_key: HashMap<(String, Value), EntityId>,
    by_type: HashMap<String, BTreeSet<EntityId>>,
    /// target -> reference nodes `(owner, field)` pointing at it
    fk_references: HashMap<EntityId, HashSet<(EntityId, usize)>>,
    proxies: HashMap<EntityId, ProxySlot>,
    factories: Vec<Arc<dyn ProxyFactory>>,
    pins: HashMap<EntityId, usize>,
}

impl std::fmt::Debug for EntityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityContext")
            .field("entities", &self.entities.len())
            .field("proxies", &self.proxies.len())
            .field("pins", &self.pins.len())
            .field("config", &self.config)
            .finish()
    }
}

impl EntityContext {
    /// Create an empty context.
    pub fn new(definitions: Arc<Definitions>, config: ContextConfig) -> Self {
        Self {
            definitions,
            config,
            next_id: 1,
            entities: BTreeMap::new(),
            by_uuid: HashMap::new(),
            by_key: HashMap::new(),
            by_type: HashMap::new(),
            fk_references: HashMap::new(),
            proxies: HashMap::new(),
            factories: Vec::new(),
            pins: HashMap::new(),
        }
    }

    /// Schema catalog.
    pub fn definitions(&self) -> &Arc<Definitions> {
        &self.definitions
    }

    /// Context settings.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Number of entities held.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the context holds no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Handles of all entities, in creation order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// All entities, in creation order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Borrow an entity.
    pub fn entity(&self, id: EntityId) -> Result<&Entity> {
        self.entities.get(&id).ok_or(Error::UnknownEntity(id))
    }

    pub(crate) fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.entities.get_mut(&id).ok_or(Error::UnknownEntity(id))
    }

    /// Find an entity by session UUID.
    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<EntityId> {
        self.by_uuid.get(uuid).copied()
    }

    /// Find an entity by type and primary key.
    pub fn find(&self, entity_type: &EntityType, key: &Value) -> Option<EntityId> {
        self.by_key
            .get(&(entity_type.qualified_name(), key.clone()))
            .copied()
    }

    /// Entities of a type, in creation order.
    pub fn of_type(&self, entity_type: &EntityType) -> Vec<EntityId> {
        self.by_type
            .get(&entity_type.qualified_name())
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Create a NEW entity of the given type.
    pub fn create(&mut self, entity_type: &Arc<EntityType>) -> Result<EntityId> {
        self.add(Entity::new(Arc::clone(entity_type)))
    }

    /// Add an entity to all indices.
    ///
    /// Adding an entity whose UUID is already present returns the existing
    /// handle; a different entity with the same key is rejected.
    pub fn add(&mut self, mut entity: Entity) -> Result<EntityId> {
        if let Some(existing) = self.by_uuid.get(&entity.uuid()) {
            return Ok(*existing);
        }
        let type_name = entity.entity_type().qualified_name();
        if let Some(key) = entity.key() {
            if self.by_key.contains_key(&(type_name.clone(), key.clone())) {
                return Err(Error::DuplicateIdentity {
                    entity_type: entity.entity_type().name.clone(),
                    key: key.clone(),
                });
            }
        }

        let id = EntityId(self.next_id);
        self.next_id += 1;
        entity.id = id;

        self.by_uuid.insert(entity.uuid(), id);
        if let Some(key) = entity.key() {
            self.by_key.insert((type_name.clone(), key.clone()), id);
        }
        self.by_type.entry(type_name).or_default().insert(id);

        let links: Vec<(usize, EntityId)> = entity
            .nodes()
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref_node().and_then(|r| r.target()).map(|t| (i, t)))
            .collect();

        trace!(entity = %id, entity_type = %entity.entity_type().name, state = ?entity.state(), "Entity added");
        self.entities.insert(id, entity);
        for (field, target) in links {
            self.link(id, field, target);
        }
        Ok(id)
    }

    /// Remove an entity from the context and clear its association
    /// bookkeeping. Dependents keep the foreign-key value and resolve it
    /// again on next access.
    pub fn remove(&mut self, id: EntityId) -> Result<Entity> {
        self.detach(id)?;
        let entity = self.entities.remove(&id).ok_or(Error::UnknownEntity(id))?;

        self.by_uuid.remove(&entity.uuid());
        let type_name = entity.entity_type().qualified_name();
        if let Some(ids) = self.by_type.get_mut(&type_name) {
            ids.remove(&id);
        }
        if let Some(key) = entity.key() {
            let index_key = (type_name, key.clone());
            if self.by_key.get(&index_key) == Some(&id) {
                self.by_key.remove(&index_key);
            }
        }
        self.unresolve_dependents(id);
        self.fk_references.remove(&id);
        self.proxies.remove(&id);
        self.pins.remove(&id);

        trace!(entity = %id, entity_type = %entity.entity_type().name, "Entity removed");
        Ok(entity)
    }

    /// Return the entity for `(type, key)`, creating a NOT_LOADED stub when
    /// none is present.
    pub fn get_or_create(&mut self, entity_type: &Arc<EntityType>, key: Value) -> Result<EntityId> {
        if key.is_null() {
            return Err(Error::MandatoryValueMissing {
                entity_type: entity_type.name.clone(),
                field: entity_type.primary_key.clone(),
            });
        }
        let key = self.coerce_key(entity_type, key);
        if let Some(id) = self.find(entity_type, &key) {
            return Ok(id);
        }
        self.add(Entity::stub(Arc::clone(entity_type), key))
    }

    fn coerce_key(&self, entity_type: &EntityType, key: Value) -> Value {
        match entity_type.primary_key_field().and_then(|f| f.value_type()) {
            Some(ty) => ty.coerce(key),
            None => key,
        }
    }

    /// Re-index an entity whose key went from `old_key` to its current key.
    ///
    /// Keys are immutable once assigned: both keys being set is an error.
    /// References that pointed at the keyless entity receive the new key.
    pub fn key_changed(&mut self, id: EntityId, old_key: Option<Value>) -> Result<()> {
        let entity = self.entity(id)?;
        let type_name = entity.entity_type().qualified_name();
        let new_key = entity.key().cloned();

        match (old_key, new_key) {
            (Some(old), Some(new)) => Err(Error::PrimaryKeyMutation {
                entity_type: entity.entity_type().name.clone(),
                old,
                new,
            }),
            (Some(old), None) => {
                self.by_key.remove(&(type_name, old));
                Ok(())
            }
            (None, Some(new)) => {
                let index_key = (type_name, new.clone());
                match self.by_key.get(&index_key) {
                    Some(other) if *other != id => {
                        return Err(Error::DuplicateIdentity {
                            entity_type: entity.entity_type().name.clone(),
                            key: new,
                        })
                    }
                    _ => {}
                }
                self.by_key.insert(index_key, id);
                let dependents: Vec<(EntityId, usize)> = self
                    .fk_references
                    .get(&id)
                    .map(|deps| deps.iter().copied().collect())
                    .unwrap_or_default();
                for (owner, field) in dependents {
                    if let Some(node) = self
                        .entities
                        .get_mut(&owner)
                        .and_then(|o| o.nodes_mut().get_mut(field))
                        .and_then(Node::as_ref_node_mut)
                    {
                        node.key_assigned(id, &new);
                    }
                }
                trace!(entity = %id, key = %new, "Key assigned");
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    /// Give a keyless entity its primary key.
    pub(crate) fn assign_key(&mut self, id: EntityId, key: Value) -> Result<()> {
        let entity = self.entity_mut(id)?;
        let old = entity.key().cloned();
        if old.as_ref() == Some(&key) {
            return Ok(());
        }
        if let Some(old) = old {
            return Err(Error::PrimaryKeyMutation {
                entity_type: entity.entity_type().name.clone(),
                old,
                new: key,
            });
        }
        entity.load_key(key);
        self.key_changed(id, None)
    }

    /// Current value of a scalar field.
    pub fn value(&self, id: EntityId, field: &str) -> Result<Value> {
        self.entity(id)?.value(field).cloned()
    }

    /// Set a scalar field under change tracking. Returns whether the value
    /// changed.
    pub fn set_value(&mut self, id: EntityId, field: &str, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        let entity = self.entity(id)?;
        let entity_type = Arc::clone(entity.entity_type());
        let index = entity_type
            .field_index(field)
            .ok_or_else(|| Error::UnknownField {
                entity_type: entity_type.name.clone(),
                field: field.to_string(),
            })?;
        let def = &entity_type.fields[index];
        let FieldKind::Value { value_type, .. } = def.kind else {
            return Err(Error::InvalidNodeType {
                entity_type: entity_type.name.clone(),
                property: field.to_string(),
                expected: "value",
            });
        };
        entity.node_at(index)?;
        if matches!(entity.state(), EntityState::NotLoaded | EntityState::Loading) {
            return Err(Error::NotLoaded {
                entity_type: entity_type.name.clone(),
                key: entity.key().cloned().unwrap_or(Value::Null),
            });
        }
        if def.lock.is_some() {
            return Err(Error::ReadOnlyField {
                entity_type: entity_type.name.clone(),
                field: field.to_string(),
            });
        }
        if !value_type.accepts(&value) {
            return Err(Error::TypeMismatch {
                entity_type: entity_type.name.clone(),
                field: field.to_string(),
                expected: value_type.to_string(),
                found: value,
            });
        }
        let value = value_type.coerce(value);

        if Some(index) == entity_type.primary_key_index() {
            return match entity.key().cloned() {
                Some(current) if current == value => Ok(false),
                Some(current) => Err(Error::PrimaryKeyMutation {
                    entity_type: entity_type.name.clone(),
                    old: current,
                    new: value,
                }),
                None if value.is_null() => Ok(false),
                None => {
                    self.assign_key(id, value)?;
                    Ok(true)
                }
            };
        }

        let changed = match self.entity_mut(id)?.node_at_mut(index)? {
            Node::Value(node) => node.set(value),
            _ => false,
        };
        if changed {
            trace!(entity = %id, field, "Value changed");
        }
        Ok(changed)
    }

    /// Fill an entity from a fetched row.
    ///
    /// `row` holds application-level values by field position. An entity
    /// already present in a loaded (or new, or deleted) state is left
    /// untouched so pending in-memory changes survive; only stubs are
    /// filled.
    pub fn merge_loaded(
        &mut self,
        entity_type: &Arc<EntityType>,
        row: Vec<(usize, Value)>,
    ) -> Result<EntityId> {
        let pk = entity_type.primary_key_index();
        let key = row
            .iter()
            .find(|(i, _)| Some(*i) == pk)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_null())
            .ok_or_else(|| Error::InvalidQuery(format!(
                "row of '{}' has no primary key",
                entity_type.name
            )))?;
        let id = self.get_or_create(entity_type, key)?;
        let state = self.entity(id)?.state();
        if !matches!(state, EntityState::NotLoaded | EntityState::Loading) {
            return Ok(id);
        }

        for (index, value) in row {
            let Some(def) = entity_type.fields.get(index) else {
                continue;
            };
            match &def.kind {
                FieldKind::Value { .. } => {
                    if let Node::Value(node) = self.entity_mut(id)?.node_at_mut(index)? {
                        node.load(value);
                    }
                }
                FieldKind::Reference { target, .. } => {
                    let target_id = if value.is_null() {
                        None
                    } else {
                        let target_type = self.definitions.resolve(entity_type, target)?;
                        Some(self.get_or_create(&target_type, value.clone())?)
                    };
                    if let Node::Ref(node) = self.entity_mut(id)?.node_at_mut(index)? {
                        node.load(value.non_null(), target_id);
                    }
                    if let Some(target_id) = target_id {
                        self.link(id, index, target_id);
                        self.attach_to_parent(id, index, target_id);
                    }
                }
                FieldKind::ToMany { .. } => {}
            }
        }
        self.entity_mut(id)?.set_state(EntityState::Loaded);
        trace!(entity = %id, entity_type = %entity_type.name, "Entity loaded");
        Ok(id)
    }

    /// Mark an entity as fetch-in-progress.
    pub(crate) fn begin_loading(&mut self, id: EntityId) -> Result<()> {
        let entity = self.entity_mut(id)?;
        if entity.state() == EntityState::NotLoaded {
            entity.set_state(EntityState::Loading);
        }
        Ok(())
    }

    /// Return a stub whose fetch failed to NOT_LOADED.
    pub(crate) fn abort_loading(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if entity.state() == EntityState::Loading {
                entity.set_state(EntityState::NotLoaded);
            }
        }
    }

    /// The row behind an entity was deleted (or a NEW entity was discarded).
    ///
    /// The entity stays addressable in state DELETED but leaves the key and
    /// type indices and its parents' collections.
    pub(crate) fn entity_deleted(&mut self, id: EntityId) -> Result<()> {
        self.detach(id)?;
        let entity = self.entity_mut(id)?;
        entity.set_state(EntityState::Deleted);
        entity.set_marked_for_removal(false);
        let type_name = entity.entity_type().qualified_name();
        let key = entity.key().cloned();

        if let Some(ids) = self.by_type.get_mut(&type_name) {
            ids.remove(&id);
        }
        if let Some(key) = key {
            let index_key = (type_name, key);
            if self.by_key.get(&index_key) == Some(&id) {
                self.by_key.remove(&index_key);
            }
        }
        self.unresolve_dependents(id);
        self.pins.remove(&id);
        Ok(())
    }

    /// Drop every entity and proxy.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.by_uuid.clear();
        self.by_key.clear();
        self.by_type.clear();
        self.fk_references.clear();
        self.proxies.clear();
        self.pins.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::{FieldDef, LockKind, ScalarType, TypeRef};

    pub(crate) fn definitions() -> Arc<Definitions> {
        let mut defs = Definitions::new();
        defs.add_namespace("app", Vec::<String>::new());
        defs.register(
            "app",
            EntityType::new("Team", "team", "id")
                .with_field(FieldDef::value("id", ScalarType::Int64))
                .with_field(FieldDef::value("name", ScalarType::String))
                .with_field(FieldDef::to_many("members", TypeRef::local("User"), "team")),
        )
        .unwrap();
        defs.register(
            "app",
            EntityType::new("User", "app_user", "id")
                .with_field(FieldDef::value("id", ScalarType::Int64))
                .with_field(FieldDef::value("name", ScalarType::String))
                .with_field(FieldDef::value("version", ScalarType::Int64).with_lock(LockKind::Counter))
                .with_field(
                    FieldDef::reference("team", TypeRef::local("Team"), ScalarType::Int64)
                        .optional(),
                ),
        )
        .unwrap();
        Arc::new(defs)
    }

    pub(crate) fn context() -> EntityContext {
        EntityContext::new(definitions(), ContextConfig::default())
    }

    #[test]
    fn test_identity_by_key() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();

        let a = ctx.get_or_create(&user, Value::Int64(5)).unwrap();
        let b = ctx.get_or_create(&user, Value::Int32(5)).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.entity(a).unwrap().state(), EntityState::NotLoaded);
        assert_eq!(ctx.of_type(&user), vec![a]);
    }

    #[test]
    fn test_add_twice_is_noop() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let entity = Entity::new(Arc::clone(&user));

        let a = ctx.add(entity.clone()).unwrap();
        let b = ctx.add(entity).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.len(), 1);

        let stub = ctx.get_or_create(&user, Value::Int64(1)).unwrap();
        assert!(stub != a);
        let err = ctx
            .add(Entity::stub(Arc::clone(&user), Value::Int64(1)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity { .. }));
    }

    #[test]
    fn test_key_changed_reindexes_and_rejects_mutation() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let id = ctx.create(&user).unwrap();

        ctx.assign_key(id, Value::Int64(11)).unwrap();
        assert_eq!(ctx.find(&user, &Value::Int64(11)), Some(id));

        let err = ctx.set_value(id, "id", 12i64).unwrap_err();
        assert!(matches!(err, Error::PrimaryKeyMutation { .. }));
        assert!(matches!(
            ctx.key_changed(id, Some(Value::Int64(3))),
            Err(Error::PrimaryKeyMutation { .. })
        ));
    }

    #[test]
    fn test_set_value_checks() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let id = ctx.create(&user).unwrap();

        assert!(ctx.set_value(id, "name", "Ann").unwrap());
        assert!(!ctx.set_value(id, "name", "Ann").unwrap());
        assert!(matches!(
            ctx.set_value(id, "name", 3i64),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            ctx.set_value(id, "version", 3i64),
            Err(Error::ReadOnlyField { .. })
        ));
        assert!(matches!(
            ctx.set_value(id, "team", 3i64),
            Err(Error::InvalidNodeType { .. })
        ));

        let stub = ctx.get_or_create(&user, Value::Int64(40)).unwrap();
        assert!(matches!(
            ctx.set_value(stub, "name", "x"),
            Err(Error::NotLoaded { .. })
        ));
    }

    #[test]
    fn test_merge_does_not_regress_loaded_entities() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let row = |name: &str| {
            vec![
                (0, Value::Int64(1)),
                (1, Value::from(name)),
                (2, Value::Int64(1)),
                (3, Value::Int64(9)),
            ]
        };

        let id = ctx.merge_loaded(&user, row("Ann")).unwrap();
        ctx.set_value(id, "name", "Changed").unwrap();

        let again = ctx.merge_loaded(&user, row("Stored")).unwrap();
        assert_eq!(id, again);
        assert_eq!(ctx.value(id, "name").unwrap(), Value::from("Changed"));

        // the reference was resolved to a team stub and the stub knows its member
        let team = ctx.reference(id, "team").unwrap().unwrap();
        assert_eq!(ctx.entity(team).unwrap().state(), EntityState::NotLoaded);
        assert_eq!(ctx.children(team, "members").unwrap(), vec![id]);
    }

    #[test]
    fn test_remove_keeps_dependent_keys() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let team = ctx.definitions().lookup("app", "Team").unwrap();

        let u = ctx
            .merge_loaded(&user, vec![(0, Value::Int64(1)), (3, Value::Int64(2))])
            .unwrap();
        let t = ctx.find(&team, &Value::Int64(2)).unwrap();
        ctx.remove(t).unwrap();
        assert!(ctx.entity(t).is_err());

        let node = ctx.entity(u).unwrap().node("team").unwrap().as_ref_node().unwrap().clone();
        assert_eq!(node.entity_key(), Some(&Value::Int64(2)));
        assert!(node.reference().is_none());

        let resolved = ctx.reference(u, "team").unwrap().unwrap();
        assert_ne!(resolved, t);
        assert_eq!(ctx.find(&team, &Value::Int64(2)), Some(resolved));
    }
}
