//! Field-level audit trail of one persist call.

use std::collections::HashSet;

use ormgraph_proto::Value;

use crate::catalog::EntityType;
use crate::error::{Error, Result};
use crate::graph::EntityId;

/// Kind of write an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    /// The row was inserted.
    Insert,
    /// The row was updated.
    Update,
    /// The row was deleted.
    Delete,
}

/// One changed node.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Field name.
    pub field: String,
    /// Value before the persist; null for inserts.
    pub old: Value,
    /// Value written; null for deletes.
    pub new: Value,
}

impl Change {
    /// Create a change record.
    pub fn new(field: impl Into<String>, old: Value, new: Value) -> Self {
        Self {
            field: field.into(),
            old,
            new,
        }
    }
}

/// All changes written for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    /// Entity handle in the persisted context.
    pub entity: EntityId,
    /// Qualified entity type name.
    pub entity_type: String,
    /// Primary key of the row.
    pub key: Value,
    /// Write kind.
    pub action: AuditAction,
    /// Changed nodes, in field order.
    pub changes: Vec<Change>,
}

impl AuditRecord {
    /// Change of a field, if it was written.
    pub fn change(&self, field: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.field == field)
    }
}

/// Audit records produced by one persist call.
#[derive(Debug, Clone, Default)]
pub struct AuditInformation {
    records: Vec<AuditRecord>,
    audited: HashSet<(EntityId, usize)>,
}

impl AuditInformation {
    /// Empty audit trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the record of one entity.
    ///
    /// `changes` pairs each change with its field position. A node audited
    /// earlier in the same persist call fails with `DoubleAudit` and leaves
    /// the trail unchanged.
    pub(crate) fn record(
        &mut self,
        entity: EntityId,
        entity_type: &EntityType,
        key: Value,
        action: AuditAction,
        changes: Vec<(usize, Change)>,
    ) -> Result<()> {
        for (index, change) in &changes {
            if self.audited.contains(&(entity, *index)) {
                return Err(Error::DoubleAudit {
                    entity_type: entity_type.name.clone(),
                    field: change.field.clone(),
                });
            }
        }
        self.audited
            .extend(changes.iter().map(|(index, _)| (entity, *index)));
        self.records.push(AuditRecord {
            entity,
            entity_type: entity_type.qualified_name(),
            key,
            action,
            changes: changes.into_iter().map(|(_, c)| c).collect(),
        });
        Ok(())
    }

    /// Records in write order.
    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record of an entity.
    pub fn record_for(&self, entity: EntityId) -> Option<&AuditRecord> {
        self.records.iter().find(|r| r.entity == entity)
    }

    /// Records with the given action.
    pub fn with_action(&self, action: AuditAction) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter().filter(move |r| r.action == action)
    }

    /// Total number of changed nodes.
    pub fn change_count(&self) -> usize {
        self.records.iter().map(|r| r.changes.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDef, ScalarType};

    #[test]
    fn test_node_audited_once() {
        let ty = EntityType::new("Tag", "tag", "id")
            .with_field(FieldDef::value("id", ScalarType::Int64))
            .with_field(FieldDef::value("label", ScalarType::String));
        let mut audit = AuditInformation::new();
        let change = || vec![(1, Change::new("label", Value::Null, Value::from("x")))];

        audit
            .record(EntityId(1), &ty, Value::Int64(1), AuditAction::Insert, change())
            .unwrap();
        let err = audit
            .record(EntityId(1), &ty, Value::Int64(1), AuditAction::Update, change())
            .unwrap_err();
        assert!(matches!(err, Error::DoubleAudit { .. }));
        assert_eq!(audit.len(), 1);

        // same field on another entity is fine
        audit
            .record(EntityId(2), &ty, Value::Int64(2), AuditAction::Insert, change())
            .unwrap();
        assert_eq!(audit.change_count(), 2);
        assert_eq!(
            audit.record_for(EntityId(2)).and_then(|r| r.change("label")).map(|c| &c.new),
            Some(&Value::from("x"))
        );
    }
}
