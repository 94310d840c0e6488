//! Constraint metadata.

use serde::{Deserialize, Serialize};

use super::field::TypeRef;

/// A table constraint, derived from an [`EntityType`](super::EntityType).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintDef {
    /// Primary key column set.
    PrimaryKey {
        /// Constraint name.
        name: String,
        /// Table the constraint applies to.
        table: String,
        /// Key columns.
        columns: Vec<String>,
    },
    /// Uniqueness constraint.
    Unique {
        /// Constraint name.
        name: String,
        /// Table the constraint applies to.
        table: String,
        /// Columns that must be unique together.
        columns: Vec<String>,
    },
    /// Foreign key constraint.
    ForeignKey {
        /// Constraint name.
        name: String,
        /// Table containing the foreign key.
        table: String,
        /// Foreign key column.
        column: String,
        /// Referenced entity type.
        references: TypeRef,
    },
}

impl ConstraintDef {
    /// Get the constraint name.
    pub fn name(&self) -> &str {
        match self {
            ConstraintDef::PrimaryKey { name, .. }
            | ConstraintDef::Unique { name, .. }
            | ConstraintDef::ForeignKey { name, .. } => name,
        }
    }

    /// Get the constrained table.
    pub fn table(&self) -> &str {
        match self {
            ConstraintDef::PrimaryKey { table, .. }
            | ConstraintDef::Unique { table, .. }
            | ConstraintDef::ForeignKey { table, .. } => table,
        }
    }

    /// Columns covered by the constraint.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            ConstraintDef::PrimaryKey { columns, .. } | ConstraintDef::Unique { columns, .. } => {
                columns.iter().map(String::as_str).collect()
            }
            ConstraintDef::ForeignKey { column, .. } => vec![column.as_str()],
        }
    }
}

impl std::fmt::Display for ConstraintDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintDef::PrimaryKey { name, columns, .. } => {
                write!(f, "{name}: primary key ({})", columns.join(", "))
            }
            ConstraintDef::Unique { name, columns, .. } => {
                write!(f, "{name}: unique ({})", columns.join(", "))
            }
            ConstraintDef::ForeignKey {
                name,
                column,
                references,
                ..
            } => write!(f, "{name}: foreign key ({column}) -> {references}"),
        }
    }
}
