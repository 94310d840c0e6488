//! Entity type definitions.

use serde::{Deserialize, Serialize};

use super::constraint::ConstraintDef;
use super::field::{FieldDef, FieldKind};

/// Immutable schema node describing one entity type (one table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    /// Namespace the type is registered in. Filled in on registration.
    #[serde(default)]
    pub namespace: String,
    /// Interface name (unique within the namespace).
    pub name: String,
    /// Table name.
    pub table: String,
    /// Name of the primary-key field.
    pub primary_key: String,
    /// Ordered field definitions.
    pub fields: Vec<FieldDef>,
    /// Declared unique field sets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique: Vec<Vec<String>>,
}

impl EntityType {
    /// Create a new entity type.
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
            table: table.into(),
            primary_key: primary_key.into(),
            fields: Vec::new(),
            unique: Vec::new(),
        }
    }

    /// Add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add multiple fields.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Declare a unique field set.
    pub fn with_unique(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.unique.push(fields.into_iter().map(Into::into).collect());
        self
    }

    /// `namespace.Name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Get a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of a field.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Position of the primary-key field.
    pub fn primary_key_index(&self) -> Option<usize> {
        self.field_index(&self.primary_key)
    }

    /// The primary-key field.
    pub fn primary_key_field(&self) -> Option<&FieldDef> {
        self.field(&self.primary_key)
    }

    /// Primary-key column name.
    pub fn primary_key_column(&self) -> &str {
        self.primary_key_field()
            .and_then(|f| f.column.as_deref())
            .unwrap_or(&self.primary_key)
    }

    /// Position of the optimistic-lock field, if any.
    pub fn lock_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.lock.is_some())
    }

    /// Fields backed by a column, with their positions.
    pub fn column_fields(&self) -> impl Iterator<Item = (usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.column.is_some() && !f.is_to_many())
    }

    /// Reference fields with their positions.
    pub fn reference_fields(&self) -> impl Iterator<Item = (usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_reference())
    }

    /// To-many fields with their positions.
    pub fn to_many_fields(&self) -> impl Iterator<Item = (usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_to_many())
    }

    /// Whether a field is maintained by the engine (key and lock).
    pub fn is_system_field(&self, index: usize) -> bool {
        Some(index) == self.primary_key_index()
            || self.fields.get(index).is_some_and(|f| f.lock.is_some())
    }

    /// Constraint metadata derived from the field definitions.
    pub fn constraints(&self) -> Vec<ConstraintDef> {
        let mut constraints = vec![ConstraintDef::PrimaryKey {
            name: format!("pk_{}", self.table),
            table: self.table.clone(),
            columns: vec![self.primary_key_column().to_string()],
        }];

        for (i, columns) in self.unique.iter().enumerate() {
            let columns = columns
                .iter()
                .map(|f| {
                    self.field(f)
                        .and_then(|d| d.column.clone())
                        .unwrap_or_else(|| f.clone())
                })
                .collect();
            constraints.push(ConstraintDef::Unique {
                name: format!("uk_{}_{}", self.table, i),
                table: self.table.clone(),
                columns,
            });
        }

        for (_, field) in self.reference_fields() {
            if let (FieldKind::Reference { target, .. }, Some(column)) =
                (&field.kind, field.column.as_ref())
            {
                constraints.push(ConstraintDef::ForeignKey {
                    name: format!("fk_{}_{}", self.table, field.name),
                    table: self.table.clone(),
                    column: column.clone(),
                    references: target.clone(),
                });
            }
        }

        constraints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{LockKind, ScalarType, TypeRef};

    fn user() -> EntityType {
        EntityType::new("User", "app_user", "id")
            .with_field(FieldDef::value("id", ScalarType::Int64))
            .with_field(FieldDef::value("name", ScalarType::String))
            .with_field(FieldDef::value("version", ScalarType::Int64).with_lock(LockKind::Counter))
            .with_field(
                FieldDef::reference("team", TypeRef::local("Team"), ScalarType::Int64).optional(),
            )
            .with_unique(["name"])
    }

    #[test]
    fn test_field_lookup() {
        let user = user();

        assert_eq!(user.primary_key_index(), Some(0));
        assert_eq!(user.lock_index(), Some(2));
        assert_eq!(user.field_index("team"), Some(3));
        assert!(user.field("missing").is_none());
        assert!(user.is_system_field(0));
        assert!(user.is_system_field(2));
        assert!(!user.is_system_field(1));
    }

    #[test]
    fn test_derived_constraints() {
        let constraints = user().constraints();

        assert_eq!(constraints.len(), 3);
        assert!(matches!(
            &constraints[0],
            ConstraintDef::PrimaryKey { columns, .. } if columns == &vec!["id".to_string()]
        ));
        assert!(matches!(
            &constraints[2],
            ConstraintDef::ForeignKey { column, .. } if column == "team_id"
        ));
    }
}
