//! Reference and collection maintenance.
//!
//! Setting a reference keeps three structures consistent: the reference
//! node itself, the target's back-reference set and the to-many
//! collections on the old and new parent that are mapped by the reference.

use std::collections::BTreeSet;
use std::sync::Arc;

use ormgraph_proto::Value;
use tracing::trace;

use super::EntityContext;
use crate::catalog::{DeleteBehavior, EntityType, FieldDef, FieldKind};
use crate::error::{Error, Result};
use crate::graph::{EntityId, EntityState, Node, RefState};

impl EntityContext {
    pub(crate) fn link(&mut self, owner: EntityId, field: usize, target: EntityId) {
        self.fk_references
            .entry(target)
            .or_default()
            .insert((owner, field));
    }

    pub(crate) fn unlink(&mut self, owner: EntityId, field: usize, target: EntityId) {
        if let Some(deps) = self.fk_references.get_mut(&target) {
            deps.remove(&(owner, field));
            if deps.is_empty() {
                self.fk_references.remove(&target);
            }
        }
    }

    /// Reference nodes pointing at an entity.
    pub fn dependents(&self, target: EntityId) -> Vec<(EntityId, usize)> {
        let mut deps: Vec<(EntityId, usize)> = self
            .fk_references
            .get(&target)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// To-many fields of `parent` mapped by reference `field` of `child`.
    fn inverse_fields(&self, parent: &EntityType, child: &EntityType, field: &str) -> Vec<usize> {
        let child_name = child.qualified_name();
        parent
            .to_many_fields()
            .filter(|(_, def)| match &def.kind {
                FieldKind::ToMany {
                    target, mapped_by, ..
                } => {
                    mapped_by == field
                        && self
                            .definitions
                            .resolve(parent, target)
                            .is_ok_and(|t| t.qualified_name() == child_name)
                }
                _ => false,
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn parent_lists(&self, child: EntityId, field: usize, parent: EntityId) -> Vec<usize> {
        let (Some(c), Some(p)) = (self.entities.get(&child), self.entities.get(&parent)) else {
            return Vec::new();
        };
        let Some(def) = c.entity_type().fields.get(field) else {
            return Vec::new();
        };
        self.inverse_fields(p.entity_type(), c.entity_type(), &def.name)
    }

    pub(crate) fn attach_to_parent(&mut self, child: EntityId, field: usize, parent: EntityId) {
        for list in self.parent_lists(child, field, parent) {
            if let Some(node) = self
                .entities
                .get_mut(&parent)
                .and_then(|p| p.nodes_mut().get_mut(list))
                .and_then(Node::as_to_many_mut)
            {
                node.insert(child);
            }
        }
    }

    fn detach_from_parent(&mut self, child: EntityId, field: usize, parent: EntityId) {
        for list in self.parent_lists(child, field, parent) {
            if let Some(node) = self
                .entities
                .get_mut(&parent)
                .and_then(|p| p.nodes_mut().get_mut(list))
                .and_then(Node::as_to_many_mut)
            {
                node.remove(child);
            }
        }
    }

    /// Drop an entity's outgoing links and its membership in parents'
    /// collections.
    pub(crate) fn detach(&mut self, id: EntityId) -> Result<()> {
        let targets: Vec<(usize, EntityId)> = self
            .entity(id)?
            .nodes()
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref_node().and_then(|r| r.target()).map(|t| (i, t)))
            .collect();
        for (field, target) in targets {
            self.detach_from_parent(id, field, target);
            self.unlink(id, field, target);
        }
        Ok(())
    }

    pub(crate) fn unresolve_dependents(&mut self, target: EntityId) {
        for (owner, field) in self.dependents(target) {
            if let Some(node) = self
                .entities
                .get_mut(&owner)
                .and_then(|o| o.nodes_mut().get_mut(field))
                .and_then(Node::as_ref_node_mut)
            {
                node.unresolve(target);
            }
        }
        self.fk_references.remove(&target);
    }

    fn reference_field(&self, owner: EntityId, field: &str) -> Result<(Arc<EntityType>, usize)> {
        let entity_type = Arc::clone(self.entity(owner)?.entity_type());
        let index = entity_type
            .field_index(field)
            .ok_or_else(|| Error::UnknownField {
                entity_type: entity_type.name.clone(),
                field: field.to_string(),
            })?;
        if !entity_type.fields[index].is_reference() {
            return Err(Error::InvalidNodeType {
                entity_type: entity_type.name.clone(),
                property: field.to_string(),
                expected: "reference",
            });
        }
        Ok((entity_type, index))
    }

    fn collection_field(&self, owner: EntityId, field: &str) -> Result<(Arc<EntityType>, usize)> {
        let entity_type = Arc::clone(self.entity(owner)?.entity_type());
        let index = entity_type
            .field_index(field)
            .ok_or_else(|| Error::UnknownField {
                entity_type: entity_type.name.clone(),
                field: field.to_string(),
            })?;
        if !entity_type.fields[index].is_to_many() {
            return Err(Error::InvalidNodeType {
                entity_type: entity_type.name.clone(),
                property: field.to_string(),
                expected: "to-many",
            });
        }
        Ok((entity_type, index))
    }

    /// Point a reference at `target` (or null) under change tracking.
    ///
    /// Returns whether the reference changed. Collections mapped by the
    /// reference on the old and new target follow the change.
    pub fn set_reference(
        &mut self,
        owner: EntityId,
        field: &str,
        target: Option<EntityId>,
    ) -> Result<bool> {
        let (owner_type, index) = self.reference_field(owner, field)?;
        let owner_entity = self.entity(owner)?;
        owner_entity.node_at(index)?;
        if matches!(owner_entity.state(), EntityState::NotLoaded | EntityState::Loading) {
            return Err(Error::NotLoaded {
                entity_type: owner_type.name.clone(),
                key: owner_entity.key().cloned().unwrap_or(Value::Null),
            });
        }

        let new_state = match target {
            None => RefState::null(),
            Some(target) => {
                let target_entity = self.entity(target)?;
                let expected = self.definitions.target_of(&owner_type, field)?;
                if target_entity.entity_type().qualified_name() != expected.qualified_name() {
                    return Err(Error::TypeMismatch {
                        entity_type: owner_type.name.clone(),
                        field: field.to_string(),
                        expected: expected.qualified_name(),
                        found: Value::from(target_entity.entity_type().qualified_name()),
                    });
                }
                if target_entity.state() == EntityState::Deleted {
                    return Err(Error::EntityDeleted {
                        entity_type: target_entity.entity_type().name.clone(),
                        uuid: target_entity.uuid(),
                    });
                }
                RefState {
                    key: target_entity.key().cloned(),
                    target: Some(target),
                }
            }
        };

        let old_target = match self.entity(owner)?.node_at(index)? {
            Node::Ref(node) => node.target(),
            _ => None,
        };
        let changed = match self.entity_mut(owner)?.node_at_mut(index)? {
            Node::Ref(node) => node.apply(new_state),
            _ => false,
        };

        let new_target = match self.entity(owner)?.node_at(index)? {
            Node::Ref(node) => node.target(),
            _ => None,
        };
        if old_target != new_target {
            if let Some(old) = old_target {
                self.detach_from_parent(owner, index, old);
                self.unlink(owner, index, old);
            }
            if let Some(new) = new_target {
                self.link(owner, index, new);
                self.attach_to_parent(owner, index, new);
            }
        }
        if changed {
            trace!(entity = %owner, field, target = ?new_target, "Reference changed");
        }
        Ok(changed)
    }

    /// Point a reference at the entity with the given key, creating a stub
    /// for it when needed.
    pub fn set_entity_key(&mut self, owner: EntityId, field: &str, key: Value) -> Result<bool> {
        if key.is_null() {
            return self.set_reference(owner, field, None);
        }
        let (owner_type, _) = self.reference_field(owner, field)?;
        let target_type = self.definitions.target_of(&owner_type, field)?;
        let target = self.get_or_create(&target_type, key)?;
        self.set_reference(owner, field, Some(target))
    }

    /// Foreign-key value of a reference.
    pub fn entity_key(&self, owner: EntityId, field: &str) -> Result<Option<Value>> {
        let (_, index) = self.reference_field(owner, field)?;
        Ok(self
            .entity(owner)?
            .node_at(index)?
            .as_ref_node()
            .and_then(|r| r.entity_key().cloned()))
    }

    /// Target of a reference, resolving the key to an entity (possibly a
    /// stub) when it has not been resolved yet.
    pub fn reference(&mut self, owner: EntityId, field: &str) -> Result<Option<EntityId>> {
        let (owner_type, index) = self.reference_field(owner, field)?;
        let node = self
            .entity(owner)?
            .node_at(index)?
            .as_ref_node()
            .cloned()
            .unwrap_or_default();
        if let Some(target) = node.target() {
            return Ok(Some(target));
        }
        let Some(key) = node.entity_key().cloned() else {
            return Ok(None);
        };

        let target_type = self.definitions.target_of(&owner_type, field)?;
        let target = self.get_or_create(&target_type, key)?;
        if let Node::Ref(node) = self.entity_mut(owner)?.node_at_mut(index)? {
            node.resolve(target);
        }
        self.link(owner, index, target);
        self.attach_to_parent(owner, index, target);
        Ok(Some(target))
    }

    /// Direct members of a collection (join entities for join-table
    /// relations), excluding members scheduled for deletion.
    pub fn children(&self, owner: EntityId, field: &str) -> Result<Vec<EntityId>> {
        let (_, index) = self.collection_field(owner, field)?;
        let node = self.entity(owner)?.node_at(index)?;
        Ok(node
            .as_to_many()
            .map(|c| {
                c.children()
                    .iter()
                    .copied()
                    .filter(|id| {
                        self.entities
                            .get(id)
                            .is_some_and(|e| !e.is_marked_for_removal())
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Final targets of a collection: the members themselves, or for
    /// join-table relations the entities reached through the join entities.
    pub fn targets(&mut self, owner: EntityId, field: &str) -> Result<Vec<EntityId>> {
        let children = self.children(owner, field)?;
        let (owner_type, index) = self.collection_field(owner, field)?;
        let Some(join_property) = join_property(&owner_type.fields[index]) else {
            return Ok(children);
        };
        let mut targets = Vec::with_capacity(children.len());
        for join in children {
            if let Some(target) = self.reference(join, &join_property)? {
                targets.push(target);
            }
        }
        Ok(targets)
    }

    /// Whether a collection has been loaded completely.
    pub fn is_fetched(&self, owner: EntityId, field: &str) -> Result<bool> {
        let (_, index) = self.collection_field(owner, field)?;
        Ok(self
            .entity(owner)?
            .node_at(index)?
            .as_to_many()
            .is_some_and(|c| c.is_fetched()))
    }

    pub(crate) fn set_fetched(&mut self, owner: EntityId, index: usize) -> Result<()> {
        if let Node::ToMany(node) = self.entity_mut(owner)?.node_at_mut(index)? {
            node.set_fetched(true);
        }
        Ok(())
    }

    /// Add `child` to a collection.
    ///
    /// For plain relations the child's back-reference is pointed at the
    /// owner. For join-table relations a new join entity is created with
    /// both of its references wired; its handle is returned.
    pub fn add_child(&mut self, owner: EntityId, field: &str, child: EntityId) -> Result<EntityId> {
        let (owner_type, index) = self.collection_field(owner, field)?;
        let def = &owner_type.fields[index];
        let FieldKind::ToMany {
            target,
            mapped_by,
            join_property,
            ..
        } = &def.kind
        else {
            return Err(Error::InvalidNodeType {
                entity_type: owner_type.name.clone(),
                property: field.to_string(),
                expected: "to-many",
            });
        };

        match join_property {
            None => {
                self.set_reference(child, mapped_by, Some(owner))?;
                Ok(child)
            }
            Some(join_property) => {
                for join in self.children(owner, field)? {
                    if self.reference(join, join_property)? == Some(child) {
                        return Ok(join);
                    }
                }
                let join_type = self.definitions.resolve(&owner_type, target)?;
                let join = self.create(&join_type)?;
                self.set_reference(join, mapped_by, Some(owner))?;
                self.set_reference(join, join_property, Some(child))?;
                trace!(owner = %owner, join = %join, target = %child, "Join entity created");
                Ok(join)
            }
        }
    }

    /// Remove `child` from a collection.
    ///
    /// A child whose back-reference is mandatory cannot exist without its
    /// owner and is scheduled for deletion; otherwise the back-reference is
    /// cleared. Join entities are always deleted.
    pub fn remove_child(&mut self, owner: EntityId, field: &str, child: EntityId) -> Result<()> {
        let (owner_type, index) = self.collection_field(owner, field)?;
        let def = &owner_type.fields[index];
        let FieldKind::ToMany {
            mapped_by,
            join_property,
            ..
        } = &def.kind
        else {
            return Ok(());
        };

        if let Some(join_property) = join_property {
            for join in self.children(owner, field)? {
                if self.reference(join, join_property)? == Some(child) {
                    self.mark_for_deletion(join)?;
                }
            }
            return Ok(());
        }

        if self.reference(child, mapped_by)? != Some(owner) {
            return Ok(());
        }
        let child_type = Arc::clone(self.entity(child)?.entity_type());
        let mandatory = child_type
            .field(mapped_by)
            .is_some_and(FieldDef::is_mandatory_reference);
        if mandatory {
            self.mark_for_deletion(child)
        } else {
            self.set_reference(child, mapped_by, None).map(|_| ())
        }
    }

    /// Schedule an entity for deletion by the next persist.
    ///
    /// Loaded children are handled per their collection's
    /// [`DeleteBehavior`]; join entities are always deleted with their owner.
    /// A restricted collection with live children fails the whole call
    /// before anything is marked.
    pub fn mark_for_deletion(&mut self, id: EntityId) -> Result<()> {
        let mut cascade = Vec::new();
        let mut set_null = Vec::new();
        let mut seen = BTreeSet::new();
        self.collect_deletion(id, &mut cascade, &mut set_null, &mut seen)?;

        for (child, field) in set_null {
            if !seen.contains(&child) {
                self.set_reference(child, &field, None)?;
            }
        }
        for entity in &cascade {
            self.entity_mut(*entity)?.set_marked_for_removal(true);
        }
        trace!(entity = %id, marked = cascade.len(), "Marked for deletion");
        Ok(())
    }

    fn collect_deletion(
        &self,
        id: EntityId,
        cascade: &mut Vec<EntityId>,
        set_null: &mut Vec<(EntityId, String)>,
        seen: &mut BTreeSet<EntityId>,
    ) -> Result<()> {
        if !seen.insert(id) {
            return Ok(());
        }
        let entity = self.entity(id)?;
        match entity.state() {
            EntityState::Deleted => {
                return Err(Error::EntityDeleted {
                    entity_type: entity.entity_type().name.clone(),
                    uuid: entity.uuid(),
                })
            }
            EntityState::NotLoaded | EntityState::Loading => {
                return Err(Error::NotLoaded {
                    entity_type: entity.entity_type().name.clone(),
                    key: entity.key().cloned().unwrap_or(Value::Null),
                })
            }
            EntityState::Loaded | EntityState::New => {}
        }
        if entity.is_marked_for_removal() {
            return Ok(());
        }
        cascade.push(id);

        let entity_type = Arc::clone(entity.entity_type());
        for (_, def) in entity_type.to_many_fields() {
            let FieldKind::ToMany {
                mapped_by,
                join_property,
                on_delete,
                ..
            } = &def.kind
            else {
                continue;
            };
            let children = self.children(id, &def.name)?;
            if children.is_empty() {
                continue;
            }
            let behavior = if join_property.is_some() {
                DeleteBehavior::Cascade
            } else {
                *on_delete
            };
            match behavior {
                DeleteBehavior::Restrict => {
                    return Err(Error::DeleteRestricted {
                        entity_type: entity_type.name.clone(),
                        field: def.name.clone(),
                        count: children.len(),
                    })
                }
                DeleteBehavior::Cascade => {
                    for child in children {
                        self.collect_deletion(child, cascade, set_null, seen)?;
                    }
                }
                DeleteBehavior::SetNull => {
                    set_null.extend(children.into_iter().map(|c| (c, mapped_by.clone())));
                }
            }
        }
        Ok(())
    }
}

fn join_property(def: &FieldDef) -> Option<String> {
    match &def.kind {
        FieldKind::ToMany { join_property, .. } => join_property.clone(),
        _ => None,
    }
}
