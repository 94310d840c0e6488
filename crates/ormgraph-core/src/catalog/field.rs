//! Field definitions for entity types.

use serde::{Deserialize, Serialize};

use super::types::ScalarType;

/// Reference to an entity type, optionally in another namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    /// Namespace; `None` means the namespace of the referencing type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Entity type name.
    pub name: String,
}

impl TypeRef {
    /// Reference a type in the same namespace.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Reference a type in another namespace.
    pub fn qualified(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Optimistic-lock column flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// Timestamp column, bumped to the current time on each write.
    Timestamp,
    /// Integer column, incremented on each write.
    Counter,
}

/// What happens to loaded children when their owner is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteBehavior {
    /// Delete the children too.
    #[default]
    Cascade,
    /// Refuse to delete while children are present.
    Restrict,
    /// Clear the children's reference to the owner.
    SetNull,
}

/// Node kind and relation metadata of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Scalar column.
    Value {
        /// Type seen by application code.
        value_type: ScalarType,
        /// Type stored in the column; differs only when a converter is set.
        storage_type: ScalarType,
    },
    /// Many-to-one reference stored as a foreign-key column.
    Reference {
        /// Referenced entity type.
        target: TypeRef,
        /// Type of the foreign-key value (the target's key type).
        key_type: ScalarType,
    },
    /// One-to-many or many-to-many collection; no column of its own.
    ToMany {
        /// Child entity type (the join entity for join-table relations).
        target: TypeRef,
        /// Reference field on the child pointing back at the owner.
        mapped_by: String,
        /// For join-table relations: reference field on the join entity
        /// leading to the final target.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        join_property: Option<String>,
        /// Behaviour on owner deletion.
        #[serde(default)]
        on_delete: DeleteBehavior,
    },
}

/// A field definition within an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Column name; `None` for to-many fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// Whether the column accepts null.
    #[serde(default)]
    pub nullable: bool,
    /// Optimistic-lock flavour, if this is the lock column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockKind>,
    /// Name of a registered type converter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter: Option<String>,
    /// Node kind.
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldDef {
    /// Create a required scalar field stored under its own name.
    pub fn value(name: impl Into<String>, value_type: ScalarType) -> Self {
        let name = name.into();
        Self {
            column: Some(name.clone()),
            name,
            nullable: false,
            lock: None,
            converter: None,
            kind: FieldKind::Value {
                value_type,
                storage_type: value_type,
            },
        }
    }

    /// Create a mandatory many-to-one reference stored in `<name>_id`.
    pub fn reference(name: impl Into<String>, target: TypeRef, key_type: ScalarType) -> Self {
        let name = name.into();
        Self {
            column: Some(format!("{name}_id")),
            name,
            nullable: false,
            lock: None,
            converter: None,
            kind: FieldKind::Reference { target, key_type },
        }
    }

    /// Create a to-many collection mapped by a reference on the child.
    pub fn to_many(name: impl Into<String>, target: TypeRef, mapped_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: None,
            nullable: true,
            lock: None,
            converter: None,
            kind: FieldKind::ToMany {
                target,
                mapped_by: mapped_by.into(),
                join_property: None,
                on_delete: DeleteBehavior::default(),
            },
        }
    }

    /// Make the field nullable.
    pub fn optional(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Override the column name.
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Mark as the optimistic-lock column.
    pub fn with_lock(mut self, lock: LockKind) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Store the value as a different type through a named converter.
    pub fn stored_as(mut self, storage: ScalarType, converter: impl Into<String>) -> Self {
        if let FieldKind::Value { storage_type, .. } = &mut self.kind {
            *storage_type = storage;
        }
        self.converter = Some(converter.into());
        self
    }

    /// Route a to-many collection through a join entity.
    pub fn through(mut self, join_property: impl Into<String>) -> Self {
        if let FieldKind::ToMany {
            join_property: jp, ..
        } = &mut self.kind
        {
            *jp = Some(join_property.into());
        }
        self
    }

    /// Set the delete behaviour of a to-many collection.
    pub fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        if let FieldKind::ToMany { on_delete, .. } = &mut self.kind {
            *on_delete = behavior;
        }
        self
    }

    /// Whether this is a scalar field.
    pub fn is_value(&self) -> bool {
        matches!(self.kind, FieldKind::Value { .. })
    }

    /// Whether this is a many-to-one reference.
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference { .. })
    }

    /// Whether this is a to-many collection.
    pub fn is_to_many(&self) -> bool {
        matches!(self.kind, FieldKind::ToMany { .. })
    }

    /// A non-nullable reference: its target must be written first.
    pub fn is_mandatory_reference(&self) -> bool {
        self.is_reference() && !self.nullable
    }

    /// Target type of a reference or collection.
    pub fn target(&self) -> Option<&TypeRef> {
        match &self.kind {
            FieldKind::Reference { target, .. } | FieldKind::ToMany { target, .. } => Some(target),
            FieldKind::Value { .. } => None,
        }
    }

    /// Application-level scalar type of a column-backed field.
    pub fn value_type(&self) -> Option<ScalarType> {
        match &self.kind {
            FieldKind::Value { value_type, .. } => Some(*value_type),
            FieldKind::Reference { key_type, .. } => Some(*key_type),
            FieldKind::ToMany { .. } => None,
        }
    }

    /// Storage scalar type of a column-backed field.
    pub fn storage_type(&self) -> Option<ScalarType> {
        match &self.kind {
            FieldKind::Value { storage_type, .. } => Some(*storage_type),
            FieldKind::Reference { key_type, .. } => Some(*key_type),
            FieldKind::ToMany { .. } => None,
        }
    }

    /// Human-readable node kind.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            FieldKind::Value { .. } => "value",
            FieldKind::Reference { .. } => "reference",
            FieldKind::ToMany { .. } => "to-many",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_field_builder() {
        let field = FieldDef::value("modified", ScalarType::Timestamp)
            .with_lock(LockKind::Timestamp)
            .with_column("modified_at");

        assert_eq!(field.column.as_deref(), Some("modified_at"));
        assert_eq!(field.lock, Some(LockKind::Timestamp));
        assert!(!field.nullable);
        assert!(field.is_value());
    }

    #[test]
    fn test_reference_field() {
        let field = FieldDef::reference("team", TypeRef::local("Team"), ScalarType::Int64);

        assert_eq!(field.column.as_deref(), Some("team_id"));
        assert!(field.is_mandatory_reference());
        assert!(!field.clone().optional().is_mandatory_reference());
        assert_eq!(field.value_type(), Some(ScalarType::Int64));
    }

    #[test]
    fn test_join_table_collection() {
        let field = FieldDef::to_many("tags", TypeRef::local("UserTag"), "user")
            .through("tag")
            .on_delete(DeleteBehavior::Cascade);

        match &field.kind {
            FieldKind::ToMany {
                join_property,
                on_delete,
                ..
            } => {
                assert_eq!(join_property.as_deref(), Some("tag"));
                assert_eq!(*on_delete, DeleteBehavior::Cascade);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(field.column.is_none());
    }

    #[test]
    fn test_converter_storage_type() {
        let field = FieldDef::value("created", ScalarType::Timestamp)
            .stored_as(ScalarType::String, "timestamp_as_string");

        assert_eq!(field.value_type(), Some(ScalarType::Timestamp));
        assert_eq!(field.storage_type(), Some(ScalarType::String));
        assert_eq!(field.converter.as_deref(), Some("timestamp_as_string"));
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{"name":"team","nullable":true,"column":"team_id",
            "kind":"reference","target":{"name":"Team"},"key_type":"int64"}"#;
        let field: FieldDef = serde_json::from_str(json).unwrap();

        assert!(field.is_reference());
        assert!(field.nullable);
        assert_eq!(field.target(), Some(&TypeRef::local("Team")));
    }
}
