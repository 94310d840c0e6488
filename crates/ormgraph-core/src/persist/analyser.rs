//! Partitioning of a context into write sets.

use ormgraph_proto::Value;

use crate::catalog::FieldKind;
use crate::context::EntityContext;
use crate::error::{Error, Result};
use crate::graph::{Entity, EntityId, EntityState, Node};

/// Entities touched by one persist call, each in creation order.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct WorkSet {
    pub(crate) inserts: Vec<EntityId>,
    pub(crate) updates: Vec<EntityId>,
    pub(crate) deletes: Vec<EntityId>,
    /// NEW entities marked for removal: dropped without a statement.
    pub(crate) discarded: Vec<EntityId>,
}

impl WorkSet {
    /// Whether no statement has to be issued.
    pub(crate) fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Sort every live entity into insert, update and delete sets, and check
/// that the rows to be written carry their mandatory values.
pub(crate) fn analyse(context: &EntityContext) -> Result<WorkSet> {
    let mut work = WorkSet::default();
    for entity in context.entities() {
        let marked = entity.is_marked_for_removal();
        match entity.state() {
            EntityState::New if marked => work.discarded.push(entity.id()),
            EntityState::New => {
                check_mandatory(context, entity)?;
                work.inserts.push(entity.id());
            }
            EntityState::Loaded if marked => work.deletes.push(entity.id()),
            EntityState::Loaded if entity.is_dirty() => {
                check_mandatory(context, entity)?;
                work.updates.push(entity.id());
            }
            _ => {}
        }
    }
    Ok(work)
}

fn check_mandatory(context: &EntityContext, entity: &Entity) -> Result<()> {
    let entity_type = entity.entity_type();
    for (index, def) in entity_type.column_fields() {
        if def.nullable || entity_type.is_system_field(index) {
            continue;
        }
        let missing = match (&def.kind, entity.node_at(index)?) {
            (FieldKind::Value { .. }, Node::Value(node)) => node.value().is_null(),
            (FieldKind::Reference { .. }, Node::Ref(node)) => match node.target() {
                Some(target) => !is_writable_target(context, target),
                None => node.entity_key().is_none(),
            },
            _ => false,
        };
        if missing {
            return Err(Error::MandatoryValueMissing {
                entity_type: entity_type.name.clone(),
                field: def.name.clone(),
            });
        }
    }
    Ok(())
}

/// A reference target that still exists after this persist.
fn is_writable_target(context: &EntityContext, target: EntityId) -> bool {
    context
        .entity(target)
        .is_ok_and(|t| t.state() != EntityState::Deleted && !t.is_marked_for_removal())
}

/// Target of a reference node, resolving a loaded key through the identity
/// map without creating stubs.
pub(crate) fn ref_target(
    context: &EntityContext,
    entity: &Entity,
    index: usize,
) -> Result<Option<EntityId>> {
    let Some(node) = entity.nodes().get(index).and_then(Node::as_ref_node) else {
        return Ok(None);
    };
    if let Some(target) = node.target() {
        return Ok(Some(target));
    }
    let Some(key) = node.entity_key() else {
        return Ok(None);
    };
    let target_type = context
        .definitions()
        .target_of(entity.entity_type(), &entity.entity_type().fields[index].name)?;
    Ok(context.find(&target_type, key))
}

/// Foreign-key value a reference node holds before this persist.
pub(crate) fn committed_key(entity: &Entity, index: usize) -> Value {
    entity
        .nodes()
        .get(index)
        .and_then(Node::as_ref_node)
        .and_then(|node| node.committed().key)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;

    #[test]
    fn test_partition_by_state() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let team = ctx.definitions().lookup("app", "Team").unwrap();

        let clean = ctx
            .merge_loaded(&user, vec![(0, Value::Int64(1)), (1, Value::from("Ann"))])
            .unwrap();
        let dirty = ctx
            .merge_loaded(&user, vec![(0, Value::Int64(2)), (1, Value::from("Bob"))])
            .unwrap();
        ctx.set_value(dirty, "name", "Rob").unwrap();
        let gone = ctx
            .merge_loaded(&team, vec![(0, Value::Int64(5)), (1, Value::from("Ops"))])
            .unwrap();
        ctx.mark_for_deletion(gone).unwrap();
        let fresh = ctx.create(&team).unwrap();
        ctx.set_value(fresh, "name", "Core").unwrap();
        let dropped = ctx.create(&team).unwrap();
        ctx.mark_for_deletion(dropped).unwrap();
        ctx.get_or_create(&team, Value::Int64(9)).unwrap();

        let work = analyse(&ctx).unwrap();
        assert_eq!(work.inserts, vec![fresh]);
        assert_eq!(work.updates, vec![dirty]);
        assert_eq!(work.deletes, vec![gone]);
        assert_eq!(work.discarded, vec![dropped]);
        assert!(!work.updates.contains(&clean));
    }

    #[test]
    fn test_missing_mandatory_value() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        ctx.create(&user).unwrap();

        let err = analyse(&ctx).unwrap_err();
        assert!(matches!(
            err,
            Error::MandatoryValueMissing { ref field, .. } if field == "name"
        ));
    }
}
